//! Backend Invocation Traits
//!
//! The router talks to every provider through the [`Backend`] trait. An
//! adapter turns an [`InvokeRequest`] into a provider call and reports either
//! an [`InvokeResponse`] or a [`BackendError`]; classifying that error as
//! retryable or fatal is the router's job (see [`super::ErrorClassifier`]).
//!
//! ```text
//!   Dispatcher ──InvokeRequest──► Backend::invoke ──► provider
//!        ▲                                               │
//!        └──────── InvokeResponse | BackendError ◄───────┘
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Per-call options forwarded to the provider
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct InvokeOptions {
    /// Output token cap (None = backend default)
    pub max_tokens: Option<u32>,
    /// Sampling temperature
    pub temperature: Option<f32>,
    /// System prompt prepended by the adapter
    pub system: Option<String>,
    /// Extra provider parameters (experiment parameter variants land here)
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
}

/// Request handed to a backend
#[derive(Clone, Debug, PartialEq)]
pub struct InvokeRequest {
    /// Prompt text after any reduction or template application
    pub prompt: String,
    /// Provider model identifier
    pub model: String,
}

impl InvokeRequest {
    /// Create a request
    pub fn new(prompt: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model: model.into(),
        }
    }
}

/// Token usage reported by a provider
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Prompt tokens
    pub prompt_tokens: u32,
    /// Completion tokens
    pub completion_tokens: u32,
}

impl Usage {
    /// Prompt plus completion
    #[must_use]
    pub fn total(&self) -> u32 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }
}

/// Successful backend reply
#[derive(Clone, Debug, PartialEq)]
pub struct InvokeResponse {
    /// Response text
    pub content: String,
    /// Token usage, when the provider reports it
    pub usage: Option<Usage>,
    /// Provider-reported cost; the router estimates one otherwise
    pub cost: Option<f64>,
    /// Provider-side latency, when reported
    pub latency: Option<Duration>,
}

impl InvokeResponse {
    /// Response with only content
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            usage: None,
            cost: None,
            latency: None,
        }
    }
}

/// Failure reported by a backend adapter
///
/// Carries the raw provider text; the classifier decides what it means.
#[derive(Clone, Debug, PartialEq)]
pub struct BackendError {
    /// Provider error message
    pub message: String,
    /// HTTP-like status code, if any
    pub status: Option<u16>,
    /// Provider retry hint
    pub retry_after: Option<Duration>,
    /// The call hit its deadline
    pub timed_out: bool,
}

impl BackendError {
    /// Error with only a message
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            retry_after: None,
            timed_out: false,
        }
    }

    /// Error with a status code
    pub fn with_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            ..Self::new(message)
        }
    }

    /// Deadline exceeded
    #[must_use]
    pub fn timeout(after: Duration) -> Self {
        Self {
            timed_out: true,
            ..Self::new(format!("timeout after {}ms", after.as_millis()))
        }
    }

    /// Attach a retry hint
    #[must_use]
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "{status}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for BackendError {}

/// How the router treats a backend failure
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Escalate to the next backend
    Retryable,
    /// Abort the request
    Fatal,
    /// Matched no pattern; escalates like `Retryable`
    Unknown,
}

impl ErrorKind {
    /// Whether the dispatcher should escalate
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Fatal)
    }
}

/// An invocable backend
#[async_trait]
pub trait Backend: Send + Sync {
    /// Backend identifier (matches the registry's `BackendConfig::id`)
    fn id(&self) -> &str;

    /// Send one request and wait for the full reply
    async fn invoke(
        &self,
        request: &InvokeRequest,
        options: &InvokeOptions,
    ) -> Result<InvokeResponse, BackendError>;
}
