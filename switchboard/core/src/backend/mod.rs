//! Backend Integration
//!
//! Abstracted access to inference backends through a common trait, plus the
//! error classifier the router applies to backend failures.
//!
//! # Available Backends
//!
//! - **GenerateBackend**: HTTP generate endpoint (Ollama-compatible)
//!
//! # Usage
//!
//! ```ignore
//! use switchboard_core::backend::{Backend, GenerateBackend, InvokeRequest};
//!
//! let backend = GenerateBackend::new("local", "http://localhost:11434")?;
//! let reply = backend.invoke(&InvokeRequest::new("Hello!", "llama3")).await?;
//! ```

mod classify;
mod http;
mod traits;

pub use classify::{ErrorClassifier, ErrorPatterns};
pub use http::GenerateBackend;
pub use traits::{
    Backend, BackendError, ErrorKind, InvokeOptions, InvokeRequest, InvokeResponse, Usage,
};
