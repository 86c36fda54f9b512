//! Fallback Chain Construction
//!
//! When an attempt fails or its response is rejected, the dispatcher asks
//! for a fresh chain anchored at the backend that just failed.
//!
//! # Architecture
//!
//! ```text
//! Attempt on backend-a fails
//!         |
//!         v
//! FallbackChainBuilder::build_chain(failed = backend-a)
//!         |   health-eligible, untried, active, full capability
//!         |   strategy filter (same provider / similar / any)
//!         v
//! [backend-b, backend-c]      ordered by provider priority, then cost
//!         |
//!         v   (chain empty and text-only fallback enabled)
//! FallbackChainBuilder::degraded_chain()  ──► [plain-text backends]
//! ```
//!
//! Chains never exceed `max_retries - 1` entries, since the first attempt
//! already used one.

use super::config::{BackendConfig, Capability, FallbackStrategy, SelectionCriteria};
use super::registry::RegistrySnapshot;

// ============================================================================
// Fallback Chain Builder
// ============================================================================

/// Builds fallback chains from a registry snapshot
#[derive(Clone, Copy, Debug)]
pub struct FallbackChainBuilder<'a> {
    snapshot: &'a RegistrySnapshot,
}

impl<'a> FallbackChainBuilder<'a> {
    /// Builder over a snapshot
    #[must_use]
    pub fn new(snapshot: &'a RegistrySnapshot) -> Self {
        Self { snapshot }
    }

    /// Ordered alternatives to `failed`
    ///
    /// `is_eligible` is the health check; backends in `context` are skipped.
    pub fn build_chain(
        &self,
        failed: &BackendConfig,
        criteria: &SelectionCriteria,
        strategy: FallbackStrategy,
        context: &FallbackContext,
        is_eligible: impl Fn(&str) -> bool,
    ) -> Vec<&'a BackendConfig> {
        let policy = &self.snapshot.policy;
        let mut chain: Vec<&'a BackendConfig> = self
            .usable(criteria, context, &is_eligible)
            .filter(|b| b.capability == Capability::Full)
            .filter(|b| match strategy {
                FallbackStrategy::SameProvider => b.provider == failed.provider,
                FallbackStrategy::SimilarCapability => similar(failed, b),
                FallbackStrategy::AnyAvailable => true,
            })
            .collect();

        chain.sort_by(|a, b| {
            policy
                .provider_rank(&a.provider)
                .cmp(&policy.provider_rank(&b.provider))
                .then(a.cost_per_unit.total_cmp(&b.cost_per_unit))
                .then_with(|| a.id.cmp(&b.id))
        });
        chain.truncate(self.max_len());
        chain
    }

    /// Minimal-capability backends for a degraded answer
    ///
    /// Empty unless the policy enables text-only fallback.
    pub fn degraded_chain(
        &self,
        criteria: &SelectionCriteria,
        context: &FallbackContext,
        is_eligible: impl Fn(&str) -> bool,
    ) -> Vec<&'a BackendConfig> {
        if !self.snapshot.policy.text_only_fallback {
            return Vec::new();
        }

        let mut chain: Vec<&'a BackendConfig> = self
            .usable(criteria, context, &is_eligible)
            .filter(|b| b.capability == Capability::TextOnly)
            .collect();
        chain.sort_by(|a, b| {
            a.cost_per_unit
                .total_cmp(&b.cost_per_unit)
                .then_with(|| a.id.cmp(&b.id))
        });
        chain.truncate(self.max_len());
        chain
    }

    fn usable<'s>(
        &'s self,
        criteria: &'s SelectionCriteria,
        context: &'s FallbackContext,
        is_eligible: &'s impl Fn(&str) -> bool,
    ) -> impl Iterator<Item = &'a BackendConfig> + 's {
        let policy = &self.snapshot.policy;
        self.snapshot.backends.iter().filter(move |b| {
            b.active
                && !policy.is_blacklisted(&b.id)
                && !context.has_tried(&b.id)
                && criteria
                    .cost_ceiling
                    .map_or(true, |ceiling| b.cost_per_unit <= ceiling)
                && is_eligible(&b.id)
        })
    }

    fn max_len(&self) -> usize {
        self.snapshot.policy.max_retries.saturating_sub(1) as usize
    }
}

/// Shares a task type, or has an output budget within a factor of two
fn similar(failed: &BackendConfig, candidate: &BackendConfig) -> bool {
    let shares_task = failed
        .task_types
        .iter()
        .any(|t| candidate.task_types.contains(t));
    let (lo, hi) = if failed.max_output <= candidate.max_output {
        (failed.max_output, candidate.max_output)
    } else {
        (candidate.max_output, failed.max_output)
    };
    shares_task || u64::from(hi) <= u64::from(lo) * 2
}

// ============================================================================
// Fallback Context
// ============================================================================

/// Backends tried during one dispatch, in order
#[derive(Clone, Debug, Default)]
pub struct FallbackContext {
    tried: Vec<String>,
}

impl FallbackContext {
    /// Empty context
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an attempted backend
    pub fn record(&mut self, backend_id: impl Into<String>) {
        let id = backend_id.into();
        if !self.has_tried(&id) {
            self.tried.push(id);
        }
    }

    /// Whether a backend has already been tried
    #[must_use]
    pub fn has_tried(&self, backend_id: &str) -> bool {
        self.tried.iter().any(|b| b == backend_id)
    }

    /// Number of escalations so far
    #[must_use]
    pub fn fallback_count(&self) -> usize {
        self.tried.len().saturating_sub(1)
    }

    /// Tried backends in order
    #[must_use]
    pub fn tried(&self) -> &[String] {
        &self.tried
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::config::{RoutingPolicy, TaskType};

    fn snapshot(backends: Vec<BackendConfig>, policy: RoutingPolicy) -> RegistrySnapshot {
        RegistrySnapshot {
            backends,
            policy,
            version: 0,
        }
    }

    fn ids(chain: &[&BackendConfig]) -> Vec<String> {
        chain.iter().map(|b| b.id.clone()).collect()
    }

    fn pool() -> Vec<BackendConfig> {
        vec![
            BackendConfig::new("oa-1", "openai", "m").with_cost(0.003),
            BackendConfig::new("oa-2", "openai", "m").with_cost(0.001),
            BackendConfig::new("an-1", "anthropic", "m").with_cost(0.002),
            BackendConfig::new("local-1", "local", "m").with_cost(0.0),
            BackendConfig::new("vision", "vendor", "m")
                .with_task_types([TaskType::Vision])
                .with_max_output(32_000),
            BackendConfig::new("plain", "local", "m").text_only(),
        ]
    }

    fn policy(max_retries: u32) -> RoutingPolicy {
        RoutingPolicy {
            max_retries,
            provider_priority: vec!["anthropic".to_string(), "openai".to_string()],
            ..RoutingPolicy::default()
        }
    }

    #[test]
    fn test_same_provider() {
        let snap = snapshot(pool(), policy(5));
        let failed = snap.get("oa-1").unwrap().clone();
        let mut ctx = FallbackContext::new();
        ctx.record("oa-1");

        let chain = FallbackChainBuilder::new(&snap).build_chain(
            &failed,
            &SelectionCriteria::new(TaskType::General),
            FallbackStrategy::SameProvider,
            &ctx,
            |_| true,
        );
        assert_eq!(ids(&chain), vec!["oa-2"]);
    }

    #[test]
    fn test_provider_priority_then_cost() {
        let snap = snapshot(pool(), policy(5));
        let failed = snap.get("oa-1").unwrap().clone();
        let mut ctx = FallbackContext::new();
        ctx.record("oa-1");

        let chain = FallbackChainBuilder::new(&snap).build_chain(
            &failed,
            &SelectionCriteria::new(TaskType::General),
            FallbackStrategy::AnyAvailable,
            &ctx,
            |_| true,
        );
        // Unlisted providers sort last; text-only never appears
        assert_eq!(ids(&chain), vec!["an-1", "oa-2", "local-1", "vision"]);
    }

    #[test]
    fn test_similar_capability() {
        let snap = snapshot(pool(), policy(5));
        let failed = snap.get("oa-1").unwrap().clone();
        let mut ctx = FallbackContext::new();
        ctx.record("oa-1");

        let chain = FallbackChainBuilder::new(&snap).build_chain(
            &failed,
            &SelectionCriteria::new(TaskType::General),
            FallbackStrategy::SimilarCapability,
            &ctx,
            |_| true,
        );
        // vision shares no task and has 8x the output budget
        assert!(!ids(&chain).contains(&"vision".to_string()));
        assert_eq!(chain.len(), 3);
    }

    #[test]
    fn test_bounded_and_health_filtered() {
        let snap = snapshot(pool(), policy(3));
        let failed = snap.get("oa-1").unwrap().clone();
        let mut ctx = FallbackContext::new();
        ctx.record("oa-1");

        let chain = FallbackChainBuilder::new(&snap).build_chain(
            &failed,
            &SelectionCriteria::new(TaskType::General),
            FallbackStrategy::AnyAvailable,
            &ctx,
            |id| id != "an-1",
        );
        assert_eq!(ids(&chain), vec!["oa-2", "local-1"]);
    }

    #[test]
    fn test_excludes_tried_and_over_ceiling() {
        let snap = snapshot(pool(), policy(5));
        let failed = snap.get("oa-1").unwrap().clone();
        let mut ctx = FallbackContext::new();
        ctx.record("oa-1");
        ctx.record("oa-2");

        let chain = FallbackChainBuilder::new(&snap).build_chain(
            &failed,
            &SelectionCriteria::new(TaskType::General).with_cost_ceiling(0.001),
            FallbackStrategy::AnyAvailable,
            &ctx,
            |_| true,
        );
        assert_eq!(ids(&chain), vec!["local-1", "vision"]);
        assert_eq!(ctx.fallback_count(), 1);
    }

    #[test]
    fn test_degraded_chain() {
        let snap = snapshot(pool(), policy(3));
        let builder = FallbackChainBuilder::new(&snap);
        let criteria = SelectionCriteria::new(TaskType::General);

        let chain = builder.degraded_chain(&criteria, &FallbackContext::new(), |_| true);
        assert_eq!(ids(&chain), vec!["plain"]);

        let disabled = snapshot(
            pool(),
            RoutingPolicy {
                text_only_fallback: false,
                ..policy(3)
            },
        );
        assert!(FallbackChainBuilder::new(&disabled)
            .degraded_chain(&criteria, &FallbackContext::new(), |_| true)
            .is_empty());
    }

    #[test]
    fn test_context_dedupes() {
        let mut ctx = FallbackContext::new();
        ctx.record("a");
        ctx.record("a");
        ctx.record("b");
        assert_eq!(ctx.tried(), ["a".to_string(), "b".to_string()]);
        assert!(ctx.has_tried("b"));
        assert!(!ctx.has_tried("c"));
    }
}
