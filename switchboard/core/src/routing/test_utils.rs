//! Routing Test Utilities
//!
//! Mock collaborators for exercising the router without real providers.
//! [`ScriptedBackend`] replays a queue of replies (text, error, or a call
//! that never returns) and records every prompt it was sent, so tests can
//! assert on call counts and ordering.
//!
//! # Usage
//!
//! ```ignore
//! use switchboard_core::routing::test_utils::{ScriptedBackend, Reply, GOOD_RESPONSE};
//!
//! let flaky = ScriptedBackend::new("flaky")
//!     .then(Reply::Fail(BackendError::with_status(503, "overloaded")))
//!     .replying(GOOD_RESPONSE);
//!
//! // ... route a request ...
//! assert_eq!(flaky.calls(), 2);
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::admission::TierBudget;
use super::config::{BackendConfig, RetryConfig, RouterConfig, RoutingPolicy};
use crate::backend::{Backend, BackendError, InvokeOptions, InvokeRequest, InvokeResponse, Usage};
use crate::store::{Alert, AlertSink};

/// Structured, detailed, vocabulary-rich answer; accepted on the first try
pub const GOOD_RESPONSE: &str = "Here is how to total the column:\n\
1. Select the range B2:B20.\n\
2. Enter the formula =SUM(B2:B20) in the cell below.\n\
3. Press Enter to see the result.\n\
The formula updates automatically when a row is added, so the total always \
reflects the current range of values in the worksheet.";

/// Short plain answer; lands in the retry band
pub const MEDIOCRE_RESPONSE: &str = "The total is in the last cell.";

/// Blank answer; always sent to fallback
pub const POOR_RESPONSE: &str = "   ";

// ============================================================================
// Scripted Backend
// ============================================================================

/// One scripted reply
#[derive(Clone, Debug)]
pub enum Reply {
    /// Successful response with this content
    Text(String),
    /// Backend error
    Fail(BackendError),
    /// Never completes (for timeout and cancellation tests)
    Hang,
}

/// Captured request for test verification
#[derive(Clone, Debug)]
pub struct RecordedCall {
    /// Prompt sent
    pub prompt: String,
    /// Options sent
    pub options: InvokeOptions,
}

/// Backend that replays a queue of replies
///
/// Once the queue is empty every call gets the default reply.
pub struct ScriptedBackend {
    id: String,
    queue: Mutex<VecDeque<Reply>>,
    default_reply: Mutex<Reply>,
    delay: Duration,
    cost: Option<f64>,
    calls: AtomicUsize,
    history: Mutex<Vec<RecordedCall>>,
}

impl std::fmt::Debug for ScriptedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedBackend")
            .field("id", &self.id)
            .field("queued", &self.queue.lock().len())
            .field("calls", &self.calls())
            .finish()
    }
}

impl ScriptedBackend {
    /// Backend answering [`GOOD_RESPONSE`] by default
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            queue: Mutex::new(VecDeque::new()),
            default_reply: Mutex::new(Reply::Text(GOOD_RESPONSE.to_string())),
            delay: Duration::ZERO,
            cost: None,
            calls: AtomicUsize::new(0),
            history: Mutex::new(Vec::new()),
        }
    }

    /// Queue a one-off reply
    #[must_use]
    pub fn then(self, reply: Reply) -> Self {
        self.queue.lock().push_back(reply);
        self
    }

    /// Replace the default reply with text
    #[must_use]
    pub fn replying(self, content: impl Into<String>) -> Self {
        *self.default_reply.lock() = Reply::Text(content.into());
        self
    }

    /// Fail every unscripted call
    #[must_use]
    pub fn failing(self, error: BackendError) -> Self {
        *self.default_reply.lock() = Reply::Fail(error);
        self
    }

    /// Never answer unscripted calls
    #[must_use]
    pub fn hanging(self) -> Self {
        *self.default_reply.lock() = Reply::Hang;
        self
    }

    /// Simulated latency per call
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Report this cost on every success
    #[must_use]
    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = Some(cost);
        self
    }

    /// Number of invocations so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every call received, in order
    pub fn history(&self) -> Vec<RecordedCall> {
        self.history.lock().clone()
    }

    /// Prompt of the most recent call
    pub fn last_prompt(&self) -> Option<String> {
        self.history.lock().last().map(|c| c.prompt.clone())
    }

    fn next_reply(&self) -> Reply {
        self.queue
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.default_reply.lock().clone())
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn invoke(
        &self,
        request: &InvokeRequest,
        options: &InvokeOptions,
    ) -> Result<InvokeResponse, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.history.lock().push(RecordedCall {
            prompt: request.prompt.clone(),
            options: options.clone(),
        });
        let reply = self.next_reply();

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match reply {
            Reply::Text(content) => Ok(InvokeResponse {
                usage: Some(Usage {
                    prompt_tokens: u32::try_from(request.prompt.len() / 4).unwrap_or(u32::MAX),
                    completion_tokens: u32::try_from(content.len() / 4).unwrap_or(u32::MAX),
                }),
                content,
                cost: self.cost,
                latency: Some(self.delay),
            }),
            Reply::Fail(error) => Err(error),
            Reply::Hang => std::future::pending().await,
        }
    }
}

/// Registry-ready map of scripted backends
pub fn backend_map(backends: &[Arc<ScriptedBackend>]) -> HashMap<String, Arc<dyn Backend>> {
    backends
        .iter()
        .map(|b| (b.id.clone(), Arc::clone(b) as Arc<dyn Backend>))
        .collect()
}

// ============================================================================
// Alert Sink
// ============================================================================

/// Alert sink that keeps every alert in memory
#[derive(Debug, Default)]
pub struct MemoryAlertSink {
    alerts: Mutex<Vec<Alert>>,
}

impl MemoryAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Alerts received so far
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().clone()
    }
}

#[async_trait]
impl AlertSink for MemoryAlertSink {
    async fn alert(&self, alert: Alert) {
        self.alerts.lock().push(alert);
    }
}

// ============================================================================
// Config Builders
// ============================================================================

/// Router config over `backends` with no escalation backoff and the
/// built-in tiers
pub fn router_config(backends: Vec<BackendConfig>) -> RouterConfig {
    RouterConfig {
        backends,
        policy: RoutingPolicy::default(),
        retry: RetryConfig {
            initial_backoff_ms: 0,
            ..RetryConfig::default()
        },
        tiers: TierBudget::presets(),
        ..RouterConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_backend_replays_queue() {
        let backend = ScriptedBackend::new("s")
            .then(Reply::Fail(BackendError::with_status(503, "busy")))
            .replying("fine");
        let request = InvokeRequest::new("hi", "m");
        let options = InvokeOptions::default();

        assert!(backend.invoke(&request, &options).await.is_err());
        assert_eq!(backend.invoke(&request, &options).await.unwrap().content, "fine");
        assert_eq!(backend.invoke(&request, &options).await.unwrap().content, "fine");
        assert_eq!(backend.calls(), 3);
        assert_eq!(backend.last_prompt().as_deref(), Some("hi"));
    }

    #[tokio::test]
    async fn test_hanging_backend_times_out() {
        let backend = ScriptedBackend::new("h").hanging();
        let request = InvokeRequest::new("hi", "m");
        let result = tokio::time::timeout(
            Duration::from_millis(20),
            backend.invoke(&request, &InvokeOptions::default()),
        )
        .await;
        assert!(result.is_err());
    }
}
