#![allow(missing_docs)]
//! Resilient Request Routing
//!
//! Picks a backend for each request, calls it, judges the answer and walks a
//! fallback chain when something goes wrong.
//!
//! # Architecture
//!
//! ```text
//! +------------------+
//! |      Router      |  <-- route(prompt, criteria, user)
//! +--------+---------+
//!          |
//!    +-----+------+-------------+--------------+
//!    |            |             |              |
//!    v            v             v              v
//! +-------+ +-----------+ +-----------+ +------------+
//! | Cache | |Experiments| | Registry  | | Preferences|  <-- SelectInitial
//! +-------+ +-----------+ +-----+-----+ +------------+
//!                               |
//!                               v
//!                        +-------------+
//!                        |  Admission  |  <-- tier budgets
//!                        +------+------+
//!                               |
//!                               v
//!              +-------------------------------+
//!              | Attempt -> Quality -> Escalate|  <-- dispatch loop
//!              +---------------+---------------+
//!                              |
//!                +-------------+-------------+
//!                v                           v
//!          +-----------+              +-------------+
//!          |  Health   |              |  Fallback   |
//!          |  Monitor  |              |  Chains     |
//!          +-----------+              +-------------+
//! ```
//!
//! Every service is constructed explicitly by [`RouterBuilder`] and owns its
//! own concurrent state. Background work (health recompute, cache expiry,
//! spend projection) runs as [`SweepHandle`] tasks started by
//! [`Router::start`].

pub mod admission;
pub mod cache;
pub mod config;
pub mod dispatch;
pub mod experiment;
pub mod fallback;
pub mod health;
pub mod metrics;
pub mod preference;
pub mod quality;
pub mod registry;
pub mod router;
pub mod sweep;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use admission::{AdmissionControl, BudgetCheck, MonthlyCostReport, TierBudget};
pub use cache::{fingerprint, CacheConfig, CacheEntry, CachingStrategy, ResponseCache};
pub use config::*;
pub use dispatch::{
    AttemptRecord, AttemptSummary, CancelToken, DecisionFlags, RouteError, RouteOutcome,
    RoutingDecision,
};
pub use experiment::{
    Experiment, ExperimentAssignment, ExperimentDraft, ExperimentError, ExperimentResolver,
    ExperimentStatus, ExperimentType, VariantConfig, VariantDraft,
};
pub use fallback::{FallbackChainBuilder, FallbackContext};
pub use health::{HealthConfig, HealthMonitor, HealthSnapshot, HealthStatus};
pub use metrics::{DispatchMetrics, MetricsSummary};
pub use preference::{InteractionOutcome, PreferenceConfig, PreferenceLearner, UserPreference};
pub use quality::{QualityAssessment, QualityAssessor, QualityConfig, Recommendation};
pub use registry::{ModelRegistry, RegistryError, RegistrySnapshot};
pub use router::{BuildError, Router, RouterBuilder};
pub use sweep::SweepHandle;
