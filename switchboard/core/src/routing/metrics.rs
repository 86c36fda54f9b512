//! Dispatch Metrics
//!
//! Lock-free counters and a latency histogram updated on the request path:
//! - Dispatch outcomes (accepted, degraded, exhausted, rejected, cancelled)
//! - Cache hits and escalations
//! - Attempts per backend, with failures and quality rejections
//! - End-to-end dispatch latency

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;

// ============================================================================
// Histogram for Latency Tracking
// ============================================================================

/// A histogram for tracking latency distributions
#[derive(Debug)]
pub struct Histogram {
    /// Bucket upper bounds
    buckets: Vec<f64>,
    /// Count per bucket
    counts: Vec<AtomicU64>,
    total_count: AtomicU64,
    sum: AtomicU64,
    min: AtomicU64,
    max: AtomicU64,
}

impl Histogram {
    /// Create a histogram with the given bucket upper bounds
    pub fn new(buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            total_count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            min: AtomicU64::new(u64::MAX),
            max: AtomicU64::new(0),
        }
    }

    /// Millisecond buckets from 10ms to 2 minutes
    pub fn latency_default() -> Self {
        Self::new(vec![
            10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0, 30000.0,
            60000.0, 120000.0,
        ])
    }

    /// Record a value
    pub fn record(&self, value: f64) {
        if self.buckets.is_empty() {
            return;
        }
        let bucket_idx = self
            .buckets
            .iter()
            .position(|&b| value <= b)
            .unwrap_or(self.buckets.len() - 1);

        self.counts[bucket_idx].fetch_add(1, Ordering::Relaxed);
        self.total_count.fetch_add(1, Ordering::Relaxed);

        let value_u64 = value.max(0.0) as u64;
        self.sum.fetch_add(value_u64, Ordering::Relaxed);
        self.min.fetch_min(value_u64, Ordering::Relaxed);
        self.max.fetch_max(value_u64, Ordering::Relaxed);
    }

    /// Point-in-time copy
    pub fn snapshot(&self) -> HistogramSnapshot {
        let counts: Vec<u64> = self
            .counts
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect();
        let total = self.total_count.load(Ordering::Relaxed);
        let sum = self.sum.load(Ordering::Relaxed);
        let min = self.min.load(Ordering::Relaxed);

        HistogramSnapshot {
            buckets: self.buckets.clone(),
            counts,
            total,
            sum,
            min: if min == u64::MAX { 0 } else { min },
            max: self.max.load(Ordering::Relaxed),
            mean: if total > 0 {
                sum as f64 / total as f64
            } else {
                0.0
            },
        }
    }
}

/// Snapshot of histogram data
#[derive(Clone, Debug, Serialize)]
pub struct HistogramSnapshot {
    pub buckets: Vec<f64>,
    pub counts: Vec<u64>,
    pub total: u64,
    pub sum: u64,
    pub min: u64,
    pub max: u64,
    pub mean: f64,
}

impl HistogramSnapshot {
    /// Upper bound of the bucket holding the `p` quantile
    pub fn percentile(&self, p: f64) -> f64 {
        if self.total == 0 {
            return 0.0;
        }

        let target = (self.total as f64 * p).ceil() as u64;
        let mut cumulative = 0u64;

        for (i, &count) in self.counts.iter().enumerate() {
            cumulative += count;
            if cumulative >= target {
                return self.buckets[i];
            }
        }

        *self.buckets.last().unwrap_or(&0.0)
    }

    pub fn p50(&self) -> f64 {
        self.percentile(0.5)
    }

    pub fn p99(&self) -> f64 {
        self.percentile(0.99)
    }
}

// ============================================================================
// Counter
// ============================================================================

/// A simple atomic counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Per-Backend Counters
// ============================================================================

#[derive(Debug, Default)]
struct BackendCounters {
    attempts: Counter,
    failures: Counter,
    quality_rejections: Counter,
}

/// Attempt counts for one backend
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BackendAttemptSummary {
    pub backend_id: String,
    pub attempts: u64,
    pub failures: u64,
    pub quality_rejections: u64,
}

// ============================================================================
// Dispatch Metrics
// ============================================================================

/// How one dispatch ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A response passed the quality gate
    Accepted,
    /// A text-only backend answered after the chain was exhausted
    Degraded,
    /// Served from the response cache
    CacheHit,
    /// Every attempt failed
    Exhausted,
    /// Rejected before any attempt (no backend, over budget, fatal error)
    Rejected,
    /// Caller cancelled
    Cancelled,
}

/// Router-wide metrics
#[derive(Debug)]
pub struct DispatchMetrics {
    started_at: Instant,
    dispatches: Counter,
    accepted: Counter,
    degraded: Counter,
    exhausted: Counter,
    rejected: Counter,
    cancelled: Counter,
    cache_hits: Counter,
    escalations: Counter,
    attempts: Counter,
    latency_ms: Histogram,
    backends: DashMap<String, BackendCounters>,
}

impl Default for DispatchMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchMetrics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            dispatches: Counter::new(),
            accepted: Counter::new(),
            degraded: Counter::new(),
            exhausted: Counter::new(),
            rejected: Counter::new(),
            cancelled: Counter::new(),
            cache_hits: Counter::new(),
            escalations: Counter::new(),
            attempts: Counter::new(),
            latency_ms: Histogram::latency_default(),
            backends: DashMap::new(),
        }
    }

    /// Record one backend attempt
    pub fn record_attempt(&self, backend_id: &str, success: bool, quality_rejected: bool) {
        self.attempts.inc();
        let counters = self.backends.entry(backend_id.to_string()).or_default();
        counters.attempts.inc();
        if !success {
            counters.failures.inc();
        }
        if quality_rejected {
            counters.quality_rejections.inc();
        }
    }

    /// Record a move to the next candidate
    pub fn record_escalation(&self) {
        self.escalations.inc();
    }

    /// Record the end of a dispatch
    pub fn record_dispatch(&self, outcome: DispatchOutcome, elapsed: Duration) {
        self.dispatches.inc();
        match outcome {
            DispatchOutcome::Accepted => self.accepted.inc(),
            DispatchOutcome::Degraded => self.degraded.inc(),
            DispatchOutcome::CacheHit => self.cache_hits.inc(),
            DispatchOutcome::Exhausted => self.exhausted.inc(),
            DispatchOutcome::Rejected => self.rejected.inc(),
            DispatchOutcome::Cancelled => self.cancelled.inc(),
        }
        self.latency_ms.record(elapsed.as_secs_f64() * 1000.0);
    }

    /// Current totals
    pub fn summary(&self) -> MetricsSummary {
        let latency = self.latency_ms.snapshot();
        let mut backends: Vec<BackendAttemptSummary> = self
            .backends
            .iter()
            .map(|e| BackendAttemptSummary {
                backend_id: e.key().clone(),
                attempts: e.attempts.get(),
                failures: e.failures.get(),
                quality_rejections: e.quality_rejections.get(),
            })
            .collect();
        backends.sort_by(|a, b| a.backend_id.cmp(&b.backend_id));

        MetricsSummary {
            uptime_secs: self.started_at.elapsed().as_secs(),
            dispatches: self.dispatches.get(),
            accepted: self.accepted.get(),
            degraded: self.degraded.get(),
            exhausted: self.exhausted.get(),
            rejected: self.rejected.get(),
            cancelled: self.cancelled.get(),
            cache_hits: self.cache_hits.get(),
            escalations: self.escalations.get(),
            attempts: self.attempts.get(),
            latency_p50_ms: latency.p50(),
            latency_p99_ms: latency.p99(),
            latency_mean_ms: latency.mean,
            backends,
        }
    }
}

/// Serializable view of [`DispatchMetrics`]
#[derive(Clone, Debug, Serialize)]
pub struct MetricsSummary {
    pub uptime_secs: u64,
    pub dispatches: u64,
    pub accepted: u64,
    pub degraded: u64,
    pub exhausted: u64,
    pub rejected: u64,
    pub cancelled: u64,
    pub cache_hits: u64,
    pub escalations: u64,
    pub attempts: u64,
    pub latency_p50_ms: f64,
    pub latency_p99_ms: f64,
    pub latency_mean_ms: f64,
    pub backends: Vec<BackendAttemptSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram() {
        let hist = Histogram::new(vec![10.0, 25.0, 50.0, 100.0]);

        hist.record(5.0);
        hist.record(15.0);
        hist.record(75.0);
        hist.record(200.0); // overflow lands in the last bucket

        let snap = hist.snapshot();
        assert_eq!(snap.total, 4);
        assert_eq!(snap.min, 5);
        assert_eq!(snap.max, 200);
        assert_eq!(snap.counts, vec![1, 1, 0, 2]);
    }

    #[test]
    fn test_percentiles() {
        let hist = Histogram::new(vec![10.0, 50.0, 100.0, 500.0, 1000.0]);
        for i in 0..100 {
            hist.record(f64::from(i * 10));
        }

        let snap = hist.snapshot();
        let p50 = snap.p50();
        assert!((100.0..=500.0).contains(&p50));
        assert!((snap.p99() - 1000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_dispatch_metrics() {
        let metrics = DispatchMetrics::new();
        metrics.record_attempt("a", false, false);
        metrics.record_escalation();
        metrics.record_attempt("b", true, true);
        metrics.record_attempt("b", true, false);
        metrics.record_dispatch(DispatchOutcome::Accepted, Duration::from_millis(120));
        metrics.record_dispatch(DispatchOutcome::CacheHit, Duration::from_millis(1));

        let summary = metrics.summary();
        assert_eq!(summary.dispatches, 2);
        assert_eq!(summary.accepted, 1);
        assert_eq!(summary.cache_hits, 1);
        assert_eq!(summary.attempts, 3);
        assert_eq!(summary.escalations, 1);
        assert_eq!(
            summary.backends,
            vec![
                BackendAttemptSummary {
                    backend_id: "a".to_string(),
                    attempts: 1,
                    failures: 1,
                    quality_rejections: 0,
                },
                BackendAttemptSummary {
                    backend_id: "b".to_string(),
                    attempts: 2,
                    failures: 0,
                    quality_rejections: 1,
                },
            ]
        );
    }
}
