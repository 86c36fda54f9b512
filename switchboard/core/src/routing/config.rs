//! Routing Configuration
//!
//! Configuration types shared by the routing components: backend entries,
//! per-request selection criteria, routing policy, retry backoff and the
//! aggregate [`RouterConfig`] consumed by [`Router`](super::Router).

use std::collections::{BTreeSet, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::admission::TierBudget;
use super::cache::CacheConfig;
use super::health::HealthConfig;
use super::preference::PreferenceConfig;
use super::quality::QualityConfig;
use crate::backend::ErrorPatterns;

// ============================================================================
// Task Types
// ============================================================================

/// Kind of work a request asks a backend to do
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Unclassified requests
    #[default]
    General,
    /// Conversational turns
    Chat,
    /// Image or screenshot understanding
    Vision,
    /// Structured analysis of supplied data
    Analysis,
    /// Code generation and review
    Code,
    /// Condensing long input
    Summarize,
}

impl TaskType {
    /// Stable lowercase name, used in fingerprints and store keys
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::General => "general",
            Self::Chat => "chat",
            Self::Vision => "vision",
            Self::Analysis => "analysis",
            Self::Code => "code",
            Self::Summarize => "summarize",
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "general" => Ok(Self::General),
            "chat" => Ok(Self::Chat),
            "vision" => Ok(Self::Vision),
            "analysis" => Ok(Self::Analysis),
            "code" => Ok(Self::Code),
            "summarize" => Ok(Self::Summarize),
            other => Err(format!("unknown task type: {other}")),
        }
    }
}

/// Complexity tier of a request
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    /// Short prompts, quick answers
    Simple,
    /// Everyday requests
    #[default]
    Medium,
    /// Long or multi-part requests; needs a large output budget
    Complex,
}

/// How urgently the caller needs an answer
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    /// Background work
    Low,
    /// Interactive default
    #[default]
    Normal,
    /// Prefer the most reliable backend
    High,
}

/// Output capability of a backend
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Regular backend, eligible for initial selection and fallback chains
    #[default]
    Full,
    /// Minimal-capability backend, only used once the regular chain is exhausted
    TextOnly,
}

// ============================================================================
// Backend Configuration
// ============================================================================

/// One configured, invocable backend (provider + model)
///
/// Immutable once loaded; the registry swaps whole snapshots on reload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Unique backend identifier
    pub id: String,

    /// Provider tag (e.g. "openai", "anthropic", "local")
    pub provider: String,

    /// Model name understood by the provider
    pub model: String,

    /// Task types this backend serves
    #[serde(default)]
    pub task_types: BTreeSet<TaskType>,

    /// Maximum output size in tokens
    #[serde(default = "default_max_output")]
    pub max_output: u32,

    /// Cost per 1000 tokens
    #[serde(default)]
    pub cost_per_unit: f64,

    /// Lower values are preferred
    #[serde(default)]
    pub priority: i32,

    /// Whether the backend may be selected at all
    #[serde(default = "default_true")]
    pub active: bool,

    /// Last-resort backend when filtering yields nothing
    #[serde(default)]
    pub is_default: bool,

    /// Per-attempt timeout override in milliseconds
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Output capability
    #[serde(default)]
    pub capability: Capability,
}

fn default_max_output() -> u32 {
    4096
}

fn default_true() -> bool {
    true
}

impl BackendConfig {
    /// Create an active backend serving `general` with default limits
    pub fn new(
        id: impl Into<String>,
        provider: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            provider: provider.into(),
            model: model.into(),
            task_types: BTreeSet::from([TaskType::General]),
            max_output: default_max_output(),
            cost_per_unit: 0.0,
            priority: 0,
            active: true,
            is_default: false,
            timeout_ms: None,
            capability: Capability::Full,
        }
    }

    /// Replace the supported task types
    #[must_use]
    pub fn with_task_types(mut self, task_types: impl IntoIterator<Item = TaskType>) -> Self {
        self.task_types = task_types.into_iter().collect();
        self
    }

    /// Set the cost per 1000 tokens
    #[must_use]
    pub fn with_cost(mut self, cost_per_unit: f64) -> Self {
        self.cost_per_unit = cost_per_unit;
        self
    }

    /// Set the maximum output size
    #[must_use]
    pub fn with_max_output(mut self, max_output: u32) -> Self {
        self.max_output = max_output;
        self
    }

    /// Set selection priority (lower first)
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the per-attempt timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Mark as the default backend
    #[must_use]
    pub fn as_default(mut self) -> Self {
        self.is_default = true;
        self
    }

    /// Mark as a minimal-capability (text-only) backend
    #[must_use]
    pub fn text_only(mut self) -> Self {
        self.capability = Capability::TextOnly;
        self
    }

    /// Mark inactive
    #[must_use]
    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    /// Whether the backend serves the given task type
    #[must_use]
    pub fn supports(&self, task_type: TaskType) -> bool {
        self.task_types.contains(&task_type)
    }

    /// Estimated cost of processing `tokens` tokens
    #[must_use]
    pub fn estimate_cost(&self, tokens: u32) -> f64 {
        f64::from(tokens) / 1000.0 * self.cost_per_unit
    }

    /// Effective per-attempt timeout
    #[must_use]
    pub fn timeout(&self, default: Duration) -> Duration {
        self.timeout_ms.map_or(default, Duration::from_millis)
    }
}

// ============================================================================
// Selection Criteria
// ============================================================================

/// Per-request selection constraints
///
/// Built once per request with the `with_*` builders and never mutated after
/// being handed to the router.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectionCriteria {
    /// Requested task type
    pub task_type: TaskType,

    /// Complexity tier; estimated from the prompt when absent
    pub complexity: Option<Complexity>,

    /// Explicit backend preference
    pub preferred_backend: Option<String>,

    /// Maximum acceptable cost per 1000 tokens
    pub cost_ceiling: Option<f64>,

    /// Rank cheaper backends first
    pub cost_sensitive: bool,

    /// Caller urgency
    pub urgency: Urgency,

    /// User tier, governs budgets and experiment eligibility
    pub tier: Option<String>,

    /// Score responses with the rich-output signals
    pub rich_output: bool,
}

impl SelectionCriteria {
    /// Criteria for a task type with every other field defaulted
    #[must_use]
    pub fn new(task_type: TaskType) -> Self {
        Self {
            task_type,
            ..Default::default()
        }
    }

    /// Set complexity tier
    #[must_use]
    pub fn with_complexity(mut self, complexity: Complexity) -> Self {
        self.complexity = Some(complexity);
        self
    }

    /// Prefer a specific backend
    #[must_use]
    pub fn with_preferred_backend(mut self, backend_id: impl Into<String>) -> Self {
        self.preferred_backend = Some(backend_id.into());
        self
    }

    /// Cap the cost per unit
    #[must_use]
    pub fn with_cost_ceiling(mut self, ceiling: f64) -> Self {
        self.cost_ceiling = Some(ceiling);
        self
    }

    /// Rank cheaper backends first
    #[must_use]
    pub fn cost_sensitive(mut self) -> Self {
        self.cost_sensitive = true;
        self
    }

    /// Set urgency
    #[must_use]
    pub fn with_urgency(mut self, urgency: Urgency) -> Self {
        self.urgency = urgency;
        self
    }

    /// Set user tier
    #[must_use]
    pub fn with_tier(mut self, tier: impl Into<String>) -> Self {
        self.tier = Some(tier.into());
        self
    }

    /// Enable rich-output scoring
    #[must_use]
    pub fn rich_output(mut self) -> Self {
        self.rich_output = true;
        self
    }
}

// ============================================================================
// Routing Policy
// ============================================================================

/// Fallback chain construction strategy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FallbackStrategy {
    /// Same provider tag as the failed backend
    SameProvider,
    /// Shares a task type or has a comparable output budget
    #[default]
    SimilarCapability,
    /// Any eligible backend
    AnyAvailable,
}

impl std::str::FromStr for FallbackStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "same-provider" => Ok(Self::SameProvider),
            "similar-capability" => Ok(Self::SimilarCapability),
            "any-available" => Ok(Self::AnyAvailable),
            other => Err(format!("unknown fallback strategy: {other}")),
        }
    }
}

/// Read-mostly routing policy, swapped together with the backend list
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoutingPolicy {
    /// Total attempts allowed per dispatch
    pub max_retries: u32,

    /// Strategy used when escalating
    pub fallback_strategy: FallbackStrategy,

    /// Provider order for fallback chains; unlisted providers sort last
    pub provider_priority: Vec<String>,

    /// Backends never selected
    pub blacklist: HashSet<String>,

    /// Minimum `max_output` for complex requests
    pub complex_min_output: u32,

    /// Degrade to text-only backends once the chain is exhausted
    pub text_only_fallback: bool,

    /// Default per-attempt timeout in milliseconds
    pub default_timeout_ms: u64,
}

impl Default for RoutingPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            fallback_strategy: FallbackStrategy::SimilarCapability,
            provider_priority: Vec::new(),
            blacklist: HashSet::new(),
            complex_min_output: 4000,
            text_only_fallback: true,
            default_timeout_ms: 10_000,
        }
    }
}

impl RoutingPolicy {
    /// Default per-attempt timeout
    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// Rank of a provider in the priority list
    #[must_use]
    pub fn provider_rank(&self, provider: &str) -> usize {
        self.provider_priority
            .iter()
            .position(|p| p == provider)
            .unwrap_or(self.provider_priority.len())
    }

    /// Whether a backend is blacklisted
    #[must_use]
    pub fn is_blacklisted(&self, backend_id: &str) -> bool {
        self.blacklist.contains(backend_id)
    }
}

// ============================================================================
// Retry Configuration
// ============================================================================

/// Backoff between escalations
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Initial backoff delay (0 disables backoff)
    pub initial_backoff_ms: u64,

    /// Maximum backoff delay
    pub max_backoff_ms: u64,

    /// Backoff multiplier
    pub backoff_multiplier: f32,

    /// Add jitter to backoff
    pub use_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 0,
            max_backoff_ms: 2_000,
            backoff_multiplier: 2.0,
            use_jitter: true,
        }
    }
}

impl RetryConfig {
    /// Calculate backoff duration for escalation N (0-indexed)
    #[must_use]
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        if self.initial_backoff_ms == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base = self.initial_backoff_ms as f64 * f64::from(self.backoff_multiplier).powi(exponent);
        let capped = base.min(self.max_backoff_ms as f64);

        let duration_ms = if self.use_jitter {
            // Up to 25% jitter
            let jitter = rand::random::<f64>() * 0.25;
            (capped * (1.0 + jitter)) as u64
        } else {
            capped as u64
        };

        Duration::from_millis(duration_ms)
    }
}

// ============================================================================
// Full Router Configuration
// ============================================================================

/// Complete router configuration
#[derive(Clone, Debug, Default)]
pub struct RouterConfig {
    /// Configured backends
    pub backends: Vec<BackendConfig>,

    /// Routing policy
    pub policy: RoutingPolicy,

    /// Escalation backoff
    pub retry: RetryConfig,

    /// Health monitor settings
    pub health: HealthConfig,

    /// Response cache settings
    pub cache: CacheConfig,

    /// Preference learner settings
    pub preference: PreferenceConfig,

    /// Quality assessor settings
    pub quality: QualityConfig,

    /// Retryable/fatal classification patterns
    pub errors: ErrorPatterns,

    /// Per-tier budgets
    pub tiers: Vec<TierBudget>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_backoff() {
        let config = RetryConfig {
            initial_backoff_ms: 100,
            backoff_multiplier: 2.0,
            max_backoff_ms: 1000,
            use_jitter: false,
        };

        assert_eq!(config.backoff_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.backoff_for_attempt(1), Duration::from_millis(200));
        assert_eq!(config.backoff_for_attempt(2), Duration::from_millis(400));
        assert_eq!(config.backoff_for_attempt(3), Duration::from_millis(800));
        assert_eq!(config.backoff_for_attempt(4), Duration::from_millis(1000)); // Capped
    }

    #[test]
    fn test_zero_backoff_disabled() {
        let config = RetryConfig::default();
        assert_eq!(config.backoff_for_attempt(3), Duration::ZERO);
    }

    #[test]
    fn test_backend_cost_estimate() {
        let backend = BackendConfig::new("a", "openai", "gpt").with_cost(0.002);
        assert!((backend.estimate_cost(1500) - 0.003).abs() < 1e-12);
    }

    #[test]
    fn test_provider_rank() {
        let policy = RoutingPolicy {
            provider_priority: vec!["anthropic".into(), "openai".into()],
            ..Default::default()
        };
        assert_eq!(policy.provider_rank("anthropic"), 0);
        assert_eq!(policy.provider_rank("openai"), 1);
        assert_eq!(policy.provider_rank("local"), 2);
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("chat".parse::<TaskType>(), Ok(TaskType::Chat));
        assert_eq!(
            "same_provider".parse::<FallbackStrategy>(),
            Ok(FallbackStrategy::SameProvider)
        );
        assert!("nope".parse::<TaskType>().is_err());
    }

    #[test]
    fn test_backend_config_toml_defaults() {
        let backend: BackendConfig = toml::from_str(
            r#"
            id = "mini"
            provider = "openai"
            model = "gpt-4o-mini"
            task_types = ["chat", "general"]
            cost_per_unit = 0.0007
            "#,
        )
        .unwrap();

        assert!(backend.active);
        assert!(!backend.is_default);
        assert_eq!(backend.max_output, 4096);
        assert_eq!(backend.capability, Capability::Full);
        assert!(backend.supports(TaskType::Chat));
    }
}
