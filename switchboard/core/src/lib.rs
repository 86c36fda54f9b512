//! Switchboard Core - Resilient Multi-Backend Inference Routing
//!
//! Routes each request to one of several interchangeable text-generation
//! backends, judges the answer, and falls back to another backend when the
//! answer is poor or the call fails. No UI and no transport: a host process
//! (see `switchboard-daemon`) feeds requests in and writes outcomes out.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           Host process                           │
//! │              route(prompt, SelectionCriteria, user)              │
//! └────────────────────────────────┬─────────────────────────────────┘
//!                                  │
//! ┌────────────────────────────────┼─────────────────────────────────┐
//! │                      SWITCHBOARD CORE                            │
//! │  ┌─────────────────────────────┴──────────────────────────────┐  │
//! │  │                          Router                            │  │
//! │  │  ┌──────────┐ ┌──────────┐ ┌──────────┐ ┌───────────────┐  │  │
//! │  │  │ Registry │ │  Health  │ │ Quality  │ │   Fallback    │  │  │
//! │  │  └──────────┘ └──────────┘ └──────────┘ └───────────────┘  │  │
//! │  │  ┌──────────┐ ┌──────────┐ ┌──────────┐ ┌───────────────┐  │  │
//! │  │  │  Cache   │ │Admission │ │Experiment│ │  Preferences  │  │  │
//! │  │  └──────────┘ └──────────┘ └──────────┘ └───────────────┘  │  │
//! │  └────────────────────────────────────────────────────────────┘  │
//! │            │                                   │                 │
//! │     ┌──────┴──────┐                     ┌──────┴──────┐          │
//! │     │   Backend   │                     │    Store    │          │
//! │     │  adapters   │                     │ (KV + log)  │          │
//! │     └─────────────┘                     └─────────────┘          │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use switchboard_core::{load_config, Router, SelectionCriteria, TaskType};
//! use switchboard_core::backend::GenerateBackend;
//!
//! let config = load_config()?;
//! let adapters = config
//!     .endpoints
//!     .iter()
//!     .map(|(id, url)| Ok((id.clone(), Arc::new(GenerateBackend::new(id, url)?) as _)))
//!     .collect::<anyhow::Result<_>>()?;
//!
//! let router = Router::builder(config.router).backends(adapters).build()?;
//! router.start();
//!
//! let criteria = SelectionCriteria::new(TaskType::Chat);
//! let outcome = router.route("Summarize this thread", &criteria, "user-1").await?;
//! println!("{} answered: {}", outcome.decision.backend_id, outcome.content);
//! ```
//!
//! # Module Overview
//!
//! - [`backend`]: Backend adapter trait, HTTP adapter, error classification
//! - [`routing`]: Every routing service and the [`Router`] that wires them
//! - [`store`]: Key-value persistence, usage log, alert sinks
//! - [`config`]: TOML configuration loading with env and CLI overrides
//! - [`telemetry`]: `tracing` subscriber setup

#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod config;
pub mod routing;
pub mod store;
pub mod telemetry;

// Re-exports for convenience
pub use backend::{Backend, BackendError, ErrorKind, GenerateBackend};
pub use routing::{
    BackendConfig, CancelToken, Complexity, FallbackStrategy, RouteError, RouteOutcome, Router,
    RouterBuilder, RouterConfig, RoutingDecision, RoutingPolicy, SelectionCriteria, TaskType,
    Urgency,
};
pub use store::{FileKvStore, FileUsageLog, KvStore, MemoryKvStore, UsageLog};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigOverrides,
    ConfigSource, SwitchboardConfig, SwitchboardToml,
};
