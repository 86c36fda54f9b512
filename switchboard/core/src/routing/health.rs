//! Backend Health Monitoring
//!
//! Tracks a time-boxed rolling window of outcomes per backend and derives a
//! [`HealthSnapshot`] from it on a fixed period:
//!
//! ```text
//!   record_outcome ──► [window: last 60s of (success, latency)]
//!                                   │
//!            sweep (every 60s) ─────┘──► HealthSnapshot (replaces previous)
//!                                              │
//!                        status / is_eligible ◄┘
//! ```
//!
//! Classification of a window:
//!
//! - **Unavailable**: error rate > 0.5
//! - **Degraded**: error rate > 0.1, or average latency > 5000ms
//! - **Healthy**: otherwise, including backends with no recent traffic
//!
//! # Thread Safety
//!
//! Windows live in a `DashMap` with one `Mutex` per backend so unrelated
//! backends never contend. The sweep clones the list of windows first and
//! locks each one only long enough to summarize it.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::sweep::SweepHandle;
use crate::store::{Alert, AlertKind, AlertSink};

// ============================================================================
// Health Status
// ============================================================================

/// Health status of a backend
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Backend is healthy and accepting requests
    #[default]
    Healthy,

    /// Backend is slow or erroring, but still eligible
    Degraded,

    /// Backend is excluded from selection and fallback
    Unavailable,
}

impl HealthStatus {
    /// Check if requests should be allowed
    #[must_use]
    pub fn allows_requests(&self) -> bool {
        !matches!(self, Self::Unavailable)
    }

    /// Lowercase name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unavailable => "unavailable",
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Health Configuration
// ============================================================================

/// Configuration for health tracking behavior
#[derive(Clone, Debug, PartialEq)]
pub struct HealthConfig {
    /// How far back the rolling window reaches
    pub window: Duration,

    /// Recompute period for the background sweep
    pub sweep_interval: Duration,

    /// Error rate above which a backend is degraded (0.0 - 1.0)
    pub degraded_error_rate: f64,

    /// Error rate above which a backend is unavailable (0.0 - 1.0)
    pub unavailable_error_rate: f64,

    /// Average latency above which a backend is degraded
    pub degraded_latency_ms: f64,

    /// Error rate that makes an unavailable transition alert-worthy
    pub alert_error_rate: f64,

    /// Hard cap on samples kept per backend
    pub max_window_samples: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(60),
            degraded_error_rate: 0.1,
            unavailable_error_rate: 0.5,
            degraded_latency_ms: 5000.0,
            alert_error_rate: 0.8,
            max_window_samples: 10_000,
        }
    }
}

impl HealthConfig {
    /// Classify window aggregates
    ///
    /// Pure: identical inputs always yield the same status.
    #[must_use]
    pub fn classify(&self, samples: usize, error_rate: f64, avg_latency_ms: f64) -> HealthStatus {
        if samples == 0 {
            HealthStatus::Healthy
        } else if error_rate > self.unavailable_error_rate {
            HealthStatus::Unavailable
        } else if error_rate > self.degraded_error_rate || avg_latency_ms > self.degraded_latency_ms
        {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

// ============================================================================
// Rolling Window
// ============================================================================

#[derive(Clone, Copy, Debug)]
struct Outcome {
    at: Instant,
    success: bool,
    latency: Duration,
}

/// Time-boxed window of recent outcomes for one backend
#[derive(Debug, Default)]
pub struct OutcomeWindow {
    samples: VecDeque<Outcome>,
}

impl OutcomeWindow {
    fn push(&mut self, outcome: Outcome, config: &HealthConfig) {
        self.samples.push_back(outcome);
        while self.samples.len() > config.max_window_samples {
            self.samples.pop_front();
        }
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(front) = self.samples.front() {
            if now.saturating_duration_since(front.at) > window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// (samples, error rate, average latency ms)
    fn aggregate(&self) -> (usize, f64, f64) {
        let total = self.samples.len();
        if total == 0 {
            return (0, 0.0, 0.0);
        }
        let failures = self.samples.iter().filter(|o| !o.success).count();
        let latency_sum: f64 = self
            .samples
            .iter()
            .map(|o| o.latency.as_secs_f64() * 1000.0)
            .sum();
        (
            total,
            failures as f64 / total as f64,
            latency_sum / total as f64,
        )
    }
}

// ============================================================================
// Health Snapshot
// ============================================================================

/// Point-in-time health of a backend
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    /// Backend identifier
    pub backend_id: String,
    /// Classified status
    pub status: HealthStatus,
    /// Mean latency over the window
    pub avg_latency_ms: f64,
    /// Failure fraction over the window (0.0 - 1.0)
    pub error_rate: f64,
    /// Outcomes observed in the window
    pub throughput: usize,
    /// When this snapshot was computed
    pub last_checked: DateTime<Utc>,
}

impl HealthSnapshot {
    /// Snapshot for a backend with no recent traffic
    pub fn idle(backend_id: impl Into<String>) -> Self {
        Self {
            backend_id: backend_id.into(),
            status: HealthStatus::Healthy,
            avg_latency_ms: 0.0,
            error_rate: 0.0,
            throughput: 0,
            last_checked: Utc::now(),
        }
    }

    /// Reliability score used for high-urgency selection
    ///
    /// `(1 - error_rate) * 0.7 + (1 - min(latency / 5000, 1)) * 0.3`
    #[must_use]
    pub fn reliability(&self) -> f64 {
        let latency = (self.avg_latency_ms / 5000.0).min(1.0);
        (1.0 - self.error_rate) * 0.7 + (1.0 - latency) * 0.3
    }
}

// ============================================================================
// Health Monitor
// ============================================================================

/// Per-backend health accounting
pub struct HealthMonitor {
    config: HealthConfig,
    windows: DashMap<String, Arc<Mutex<OutcomeWindow>>>,
    snapshots: DashMap<String, Arc<HealthSnapshot>>,
    alerts: Arc<dyn AlertSink>,
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("config", &self.config)
            .field("backends", &self.windows.len())
            .finish_non_exhaustive()
    }
}

impl HealthMonitor {
    /// Create a monitor that reports alerts to `alerts`
    pub fn new(config: HealthConfig, alerts: Arc<dyn AlertSink>) -> Self {
        Self {
            config,
            windows: DashMap::new(),
            snapshots: DashMap::new(),
            alerts,
        }
    }

    /// Monitor configuration
    #[must_use]
    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Append an outcome to the backend's window
    pub fn record_outcome(&self, backend_id: &str, success: bool, latency: Duration) {
        let window = self
            .windows
            .entry(backend_id.to_string())
            .or_default()
            .value()
            .clone();

        let now = Instant::now();
        let mut window = window.lock();
        window.prune(now, self.config.window);
        window.push(
            Outcome {
                at: now,
                success,
                latency,
            },
            &self.config,
        );
    }

    /// Most recently computed snapshot (idle/healthy if never computed)
    #[must_use]
    pub fn status(&self, backend_id: &str) -> Arc<HealthSnapshot> {
        self.snapshots
            .get(backend_id)
            .map(|s| s.value().clone())
            .unwrap_or_else(|| Arc::new(HealthSnapshot::idle(backend_id)))
    }

    /// False only while the backend is classified unavailable
    #[must_use]
    pub fn is_eligible(&self, backend_id: &str) -> bool {
        self.snapshots
            .get(backend_id)
            .map_or(true, |s| s.status.allows_requests())
    }

    /// All computed snapshots
    #[must_use]
    pub fn snapshots(&self) -> Vec<Arc<HealthSnapshot>> {
        self.snapshots.iter().map(|s| s.value().clone()).collect()
    }

    /// Drop windows and snapshots for backends not in `backend_ids`
    pub fn retain_backends(&self, backend_ids: &HashSet<String>) {
        self.windows.retain(|id, _| backend_ids.contains(id));
        self.snapshots.retain(|id, _| backend_ids.contains(id));
    }

    /// Recompute every backend's snapshot from its window
    ///
    /// Returns the backends whose status changed.
    pub async fn recompute_all(&self) -> Vec<(String, HealthStatus, HealthStatus)> {
        let windows: Vec<(String, Arc<Mutex<OutcomeWindow>>)> = self
            .windows
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let now = Instant::now();
        let mut transitions = Vec::new();
        let mut pending_alerts = Vec::new();

        for (backend_id, window) in windows {
            let (samples, error_rate, avg_latency_ms) = {
                let mut window = window.lock();
                window.prune(now, self.config.window);
                window.aggregate()
            };

            let status = self.config.classify(samples, error_rate, avg_latency_ms);
            let snapshot = Arc::new(HealthSnapshot {
                backend_id: backend_id.clone(),
                status,
                avg_latency_ms,
                error_rate,
                throughput: samples,
                last_checked: Utc::now(),
            });

            let previous = self
                .snapshots
                .insert(backend_id.clone(), snapshot)
                .map_or(HealthStatus::Healthy, |s| s.status);

            if previous != status {
                tracing::warn!(
                    backend = %backend_id,
                    from = %previous,
                    to = %status,
                    error_rate = error_rate,
                    avg_latency_ms = avg_latency_ms,
                    "Backend health changed"
                );
                transitions.push((backend_id.clone(), previous, status));

                if status == HealthStatus::Unavailable
                    && error_rate > self.config.alert_error_rate
                {
                    pending_alerts.push(Alert::new(
                        AlertKind::BackendUnavailable {
                            backend_id: backend_id.clone(),
                            error_rate,
                            samples,
                        },
                        format!(
                            "Backend {backend_id} unavailable: {:.0}% errors over {samples} requests",
                            error_rate * 100.0
                        ),
                    ));
                }
            }
        }

        for alert in pending_alerts {
            self.alerts.alert(alert).await;
        }

        transitions
    }

    /// Start the periodic recompute task
    pub fn spawn_sweeper(self: &Arc<Self>) -> SweepHandle {
        let monitor = Arc::clone(self);
        SweepHandle::spawn("health", self.config.sweep_interval, move || {
            let monitor = Arc::clone(&monitor);
            async move {
                monitor.recompute_all().await;
            }
        })
    }
}
