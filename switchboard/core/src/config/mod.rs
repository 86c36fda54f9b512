//! TOML Configuration File Support
//!
//! Centralized configuration loading for the router, from a TOML file at
//! `~/.config/switchboard/router.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments (via [`ConfigOverrides`])
//! 2. Environment variables (`SWITCHBOARD_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # XDG Base Directory Compliance
//!
//! - `$XDG_CONFIG_HOME/switchboard/router.toml` (typically `~/.config/switchboard/router.toml`)
//!
//! # Example Configuration
//!
//! ```toml
//! [routing]
//! max_retries = 3
//! fallback_strategy = "same-provider"
//! provider_priority = ["anthropic", "openai"]
//! default_timeout_ms = 10000
//!
//! [health]
//! window_secs = 60
//! unavailable_error_rate = 0.5
//!
//! [cache]
//! strategy = "moderate"
//! capacity = 1000
//!
//! [[tiers]]
//! name = "tier1"
//! daily_budget = 1.0
//!
//! [[backends]]
//! id = "local-llama"
//! provider = "local"
//! model = "llama3.2"
//! endpoint = "http://localhost:11434"
//! cost_per_unit = 0.0
//! is_default = true
//! ```

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::{ErrorClassifier, ErrorPatterns};
use crate::routing::admission::TierBudget;
use crate::routing::cache::CachingStrategy;
use crate::routing::config::{
    BackendConfig, Capability, FallbackStrategy, RouterConfig, TaskType,
};
use crate::routing::registry::validate_backends;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// `[routing]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingToml {
    /// Total attempts per dispatch
    pub max_retries: Option<u32>,

    /// `same-provider`, `similar-capability` or `any-available`
    pub fallback_strategy: Option<FallbackStrategy>,

    /// Provider order for fallback chains
    pub provider_priority: Option<Vec<String>>,

    /// Backend ids never selected
    pub blacklist: Option<Vec<String>>,

    /// Minimum output budget for complex requests
    pub complex_min_output: Option<u32>,

    /// Delay before the first escalation (0 = none)
    pub escalation_backoff_ms: Option<u64>,

    /// Per-attempt timeout when a backend sets none
    pub default_timeout_ms: Option<u64>,

    /// Degrade to text-only backends once the chain is exhausted
    pub text_only_fallback: Option<bool>,
}

/// `[health]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthToml {
    /// Rolling window length in seconds
    pub window_secs: Option<u64>,

    /// Recompute period in seconds
    pub sweep_interval_secs: Option<u64>,

    /// Error rate above which a backend is degraded
    pub degraded_error_rate: Option<f64>,

    /// Error rate above which a backend is unavailable
    pub unavailable_error_rate: Option<f64>,

    /// Average latency above which a backend is degraded
    pub degraded_latency_ms: Option<f64>,

    /// Error rate that raises an alert on an unavailable transition
    pub alert_error_rate: Option<f64>,
}

/// `[cache]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheToml {
    /// Default strategy (`aggressive`, `moderate`, `minimal`)
    pub strategy: Option<CachingStrategy>,

    /// In-memory entry limit
    pub capacity: Option<usize>,

    /// Minimum response cost worth caching
    pub min_cost: Option<f64>,

    /// Minimum quality worth caching
    pub min_quality: Option<f64>,

    /// Expiry sweep period in seconds
    pub sweep_interval_secs: Option<u64>,
}

/// `[preference]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PreferenceToml {
    /// EMA weight of the newest observation
    pub alpha: Option<f64>,

    /// Interactions required before a preference is trusted
    pub min_usage: Option<u64>,

    /// In-memory entry limit
    pub capacity: Option<usize>,
}

/// `[quality]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityToml {
    /// Trust prior per backend id
    pub base_scores: Option<HashMap<String, f64>>,

    /// Prior for backends without an entry
    pub default_base_score: Option<f64>,

    /// Domain vocabulary for the expertise bonus
    pub domain_terms: Option<Vec<String>>,
}

/// `[errors]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorsToml {
    /// Regexes marking a failure fatal
    pub fatal_patterns: Option<Vec<String>>,

    /// Regexes marking a failure retryable
    pub retryable_patterns: Option<Vec<String>>,

    /// Status codes marking a failure fatal
    pub fatal_status_codes: Option<Vec<u16>>,

    /// Status codes marking a failure retryable
    pub retryable_status_codes: Option<Vec<u16>>,
}

/// One `[[tiers]]` entry
///
/// Fields left out fall back to the built-in tier of the same name, or to
/// the `tier2` figures for a custom tier.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TierToml {
    /// Tier name as carried in selection criteria
    pub name: String,
    pub daily_budget: Option<f64>,
    pub monthly_budget: Option<f64>,
    pub admit_fraction: Option<f64>,
    pub aggressive: Option<bool>,
    pub caching_strategy: Option<CachingStrategy>,
    pub token_reduction_target: Option<f64>,
    pub alert_threshold: Option<f64>,
}

/// One `[[backends]]` entry
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendToml {
    pub id: String,
    pub provider: String,
    pub model: String,
    /// HTTP generate endpoint
    pub endpoint: Option<String>,
    pub task_types: Option<Vec<TaskType>>,
    pub max_output: Option<u32>,
    pub cost_per_unit: Option<f64>,
    pub priority: Option<i32>,
    pub active: Option<bool>,
    pub is_default: Option<bool>,
    pub timeout_ms: Option<u64>,
    pub capability: Option<Capability>,
}

impl BackendToml {
    fn to_backend_config(&self) -> BackendConfig {
        let mut backend = BackendConfig::new(&self.id, &self.provider, &self.model);
        if let Some(task_types) = &self.task_types {
            backend.task_types = task_types.iter().copied().collect::<BTreeSet<_>>();
        }
        if let Some(max_output) = self.max_output {
            backend.max_output = max_output;
        }
        if let Some(cost) = self.cost_per_unit {
            backend.cost_per_unit = cost;
        }
        if let Some(priority) = self.priority {
            backend.priority = priority;
        }
        if let Some(active) = self.active {
            backend.active = active;
        }
        if let Some(is_default) = self.is_default {
            backend.is_default = is_default;
        }
        backend.timeout_ms = self.timeout_ms;
        if let Some(capability) = self.capability {
            backend.capability = capability;
        }
        backend
    }
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchboardToml {
    pub routing: RoutingToml,
    pub health: HealthToml,
    pub cache: CacheToml,
    pub preference: PreferenceToml,
    pub quality: QualityToml,
    pub errors: ErrorsToml,
    pub tiers: Vec<TierToml>,
    pub backends: Vec<BackendToml>,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Loaded configuration: the router settings plus adapter endpoints
///
/// Use [`load_config`] to load with proper priority handling.
#[derive(Clone, Debug)]
pub struct SwitchboardConfig {
    /// Everything the router is built from
    pub router: RouterConfig,

    /// HTTP endpoint per backend id
    pub endpoints: HashMap<String, String>,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    /// Source of configuration values
    source: ConfigSource,
}

impl Default for SwitchboardConfig {
    fn default() -> Self {
        Self {
            router: RouterConfig {
                tiers: TierBudget::presets(),
                ..RouterConfig::default()
            },
            endpoints: HashMap::new(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl SwitchboardConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Endpoint configured for a backend
    #[must_use]
    pub fn endpoint(&self, backend_id: &str) -> Option<&str> {
        self.endpoints.get(backend_id).map(String::as_str)
    }

    /// Check every value the router depends on
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let router = &self.router;

        if router.policy.max_retries == 0 {
            return Err(invalid("routing.max_retries must be at least 1"));
        }

        let health = &router.health;
        unit_interval("health.degraded_error_rate", health.degraded_error_rate)?;
        unit_interval("health.unavailable_error_rate", health.unavailable_error_rate)?;
        unit_interval("health.alert_error_rate", health.alert_error_rate)?;
        if health.degraded_error_rate > health.unavailable_error_rate {
            return Err(invalid(
                "health.degraded_error_rate must not exceed health.unavailable_error_rate",
            ));
        }

        unit_interval("cache.min_quality", router.cache.min_quality)?;
        unit_interval("preference.alpha", router.preference.alpha)?;
        unit_interval("quality.default_base_score", router.quality.default_base_score)?;
        for (backend_id, score) in &router.quality.base_scores {
            unit_interval(&format!("quality.base_scores.{backend_id}"), *score)?;
        }

        for tier in &router.tiers {
            unit_interval(&format!("tiers.{}.admit_fraction", tier.name), tier.admit_fraction)?;
            unit_interval(
                &format!("tiers.{}.token_reduction_target", tier.name),
                tier.token_reduction_target,
            )?;
            unit_interval(&format!("tiers.{}.alert_threshold", tier.name), tier.alert_threshold)?;
            if tier.daily_budget < 0.0 || tier.monthly_budget < 0.0 {
                return Err(invalid(format!("tiers.{}: budgets must be non-negative", tier.name)));
            }
        }

        validate_backends(&router.backends).map_err(|e| invalid(e.to_string()))?;
        ErrorClassifier::new(&router.errors)
            .map_err(|e| invalid(format!("errors: pattern does not compile: {e}")))?;

        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError(message.into())
}

fn unit_interval(name: &str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(invalid(format!("{name} must be within [0, 1], got {value}")))
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/switchboard/router.toml` or
/// `~/.config/switchboard/router.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("switchboard").join("router.toml"))
}

/// Load configuration from all sources with proper priority
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed.
/// A missing config file is not an error (defaults are used).
pub fn load_config() -> Result<SwitchboardConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Arguments
///
/// * `path` - Optional path to the configuration file. If `None`, only defaults
///   and environment variables are used.
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<SwitchboardConfig, ConfigError> {
    let mut config = SwitchboardConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: SwitchboardToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                backends = config.router.backends.len(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config, |key| std::env::var(key).ok());

    Ok(config)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut SwitchboardConfig, toml: &SwitchboardToml) {
    let router = &mut config.router;

    // Routing
    let routing = &toml.routing;
    if let Some(max_retries) = routing.max_retries {
        router.policy.max_retries = max_retries;
    }
    if let Some(strategy) = routing.fallback_strategy {
        router.policy.fallback_strategy = strategy;
    }
    if let Some(priority) = &routing.provider_priority {
        router.policy.provider_priority.clone_from(priority);
    }
    if let Some(blacklist) = &routing.blacklist {
        router.policy.blacklist = blacklist.iter().cloned().collect();
    }
    if let Some(min_output) = routing.complex_min_output {
        router.policy.complex_min_output = min_output;
    }
    if let Some(backoff) = routing.escalation_backoff_ms {
        router.retry.initial_backoff_ms = backoff;
    }
    if let Some(timeout) = routing.default_timeout_ms {
        router.policy.default_timeout_ms = timeout;
    }
    if let Some(enabled) = routing.text_only_fallback {
        router.policy.text_only_fallback = enabled;
    }

    // Health
    let health = &toml.health;
    if let Some(secs) = health.window_secs {
        router.health.window = Duration::from_secs(secs);
    }
    if let Some(secs) = health.sweep_interval_secs {
        router.health.sweep_interval = Duration::from_secs(secs);
    }
    if let Some(rate) = health.degraded_error_rate {
        router.health.degraded_error_rate = rate;
    }
    if let Some(rate) = health.unavailable_error_rate {
        router.health.unavailable_error_rate = rate;
    }
    if let Some(ms) = health.degraded_latency_ms {
        router.health.degraded_latency_ms = ms;
    }
    if let Some(rate) = health.alert_error_rate {
        router.health.alert_error_rate = rate;
    }

    // Cache
    let cache = &toml.cache;
    if let Some(strategy) = cache.strategy {
        router.cache.strategy = strategy;
    }
    if let Some(capacity) = cache.capacity {
        router.cache.capacity = capacity;
    }
    if let Some(cost) = cache.min_cost {
        router.cache.min_cost = cost;
    }
    if let Some(quality) = cache.min_quality {
        router.cache.min_quality = quality;
    }
    if let Some(secs) = cache.sweep_interval_secs {
        router.cache.sweep_interval = Duration::from_secs(secs);
    }

    // Preference
    let preference = &toml.preference;
    if let Some(alpha) = preference.alpha {
        router.preference.alpha = alpha;
    }
    if let Some(min_usage) = preference.min_usage {
        router.preference.min_usage = min_usage;
    }
    if let Some(capacity) = preference.capacity {
        router.preference.capacity = capacity;
    }

    // Quality
    let quality = &toml.quality;
    if let Some(scores) = &quality.base_scores {
        router.quality.base_scores.clone_from(scores);
    }
    if let Some(score) = quality.default_base_score {
        router.quality.default_base_score = score;
    }
    if let Some(terms) = &quality.domain_terms {
        router.quality.domain_terms.clone_from(terms);
    }

    // Error classification
    let errors = &toml.errors;
    let defaults = ErrorPatterns::default();
    router.errors = ErrorPatterns {
        retryable: errors.retryable_patterns.clone().unwrap_or(defaults.retryable),
        fatal: errors.fatal_patterns.clone().unwrap_or(defaults.fatal),
        retryable_status: errors
            .retryable_status_codes
            .clone()
            .unwrap_or(defaults.retryable_status),
        fatal_status: errors.fatal_status_codes.clone().unwrap_or(defaults.fatal_status),
    };

    // Tiers
    if !toml.tiers.is_empty() {
        router.tiers = toml.tiers.iter().map(tier_budget).collect();
    }

    // Backends
    router.backends = toml.backends.iter().map(BackendToml::to_backend_config).collect();
    config.endpoints = toml
        .backends
        .iter()
        .filter_map(|b| b.endpoint.clone().map(|e| (b.id.clone(), e)))
        .collect();
}

fn tier_budget(toml: &TierToml) -> TierBudget {
    let mut tier = TierBudget::presets()
        .into_iter()
        .find(|t| t.name == toml.name)
        .unwrap_or_else(|| TierBudget {
            name: toml.name.clone(),
            ..TierBudget::tier2()
        });

    if let Some(budget) = toml.daily_budget {
        tier.daily_budget = budget;
    }
    if let Some(budget) = toml.monthly_budget {
        tier.monthly_budget = budget;
    }
    if let Some(fraction) = toml.admit_fraction {
        tier.admit_fraction = fraction;
    }
    if let Some(aggressive) = toml.aggressive {
        tier.aggressive = aggressive;
    }
    if let Some(strategy) = toml.caching_strategy {
        tier.caching_strategy = strategy;
    }
    if let Some(target) = toml.token_reduction_target {
        tier.token_reduction_target = target;
    }
    if let Some(threshold) = toml.alert_threshold {
        tier.alert_threshold = threshold;
    }
    tier
}

/// Apply `SWITCHBOARD_*` overrides read through `lookup`
///
/// Unparseable values are ignored with a warning.
fn apply_env_config(config: &mut SwitchboardConfig, lookup: impl Fn(&str) -> Option<String>) {
    fn parsed<T: std::str::FromStr>(key: &str, value: &str) -> Option<T> {
        let parsed = value.trim().parse().ok();
        if parsed.is_none() {
            tracing::warn!(key = key, value = value, "Ignoring unparseable environment override");
        }
        parsed
    }

    let mut apply = |key: &str, config: &mut SwitchboardConfig, set: &dyn Fn(&mut SwitchboardConfig, &str, &str) -> bool| {
        if let Some(value) = lookup(key) {
            if set(config, key, &value) {
                config.source = ConfigSource::Env;
            }
        }
    };

    apply("SWITCHBOARD_MAX_RETRIES", config, &|c, k, v| {
        parsed(k, v).map(|n| c.router.policy.max_retries = n).is_some()
    });
    apply("SWITCHBOARD_FALLBACK_STRATEGY", config, &|c, k, v| {
        parsed(k, v).map(|s| c.router.policy.fallback_strategy = s).is_some()
    });
    apply("SWITCHBOARD_CACHE_STRATEGY", config, &|c, k, v| {
        parsed(k, v).map(|s| c.router.cache.strategy = s).is_some()
    });
    apply("SWITCHBOARD_HEALTH_INTERVAL", config, &|c, k, v| {
        parsed(k, v)
            .map(|secs| c.router.health.sweep_interval = Duration::from_secs(secs))
            .is_some()
    });
    apply("SWITCHBOARD_DEFAULT_TIMEOUT_MS", config, &|c, k, v| {
        parsed(k, v).map(|ms| c.router.policy.default_timeout_ms = ms).is_some()
    });
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Max retries override
    pub max_retries: Option<u32>,

    /// Cache strategy override
    pub cache_strategy: Option<CachingStrategy>,

    /// Fallback strategy override
    pub fallback_strategy: Option<FallbackStrategy>,

    /// Default timeout override (milliseconds)
    pub default_timeout_ms: Option<u64>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set max retries override
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Set cache strategy override
    #[must_use]
    pub fn with_cache_strategy(mut self, strategy: CachingStrategy) -> Self {
        self.cache_strategy = Some(strategy);
        self
    }

    /// Set fallback strategy override
    #[must_use]
    pub fn with_fallback_strategy(mut self, strategy: FallbackStrategy) -> Self {
        self.fallback_strategy = Some(strategy);
        self
    }

    /// Set default timeout override
    #[must_use]
    pub fn with_default_timeout_ms(mut self, ms: u64) -> Self {
        self.default_timeout_ms = Some(ms);
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut SwitchboardConfig) {
        if self.max_retries.is_some()
            || self.cache_strategy.is_some()
            || self.fallback_strategy.is_some()
            || self.default_timeout_ms.is_some()
        {
            config.source = ConfigSource::Cli;
        }

        if let Some(max_retries) = self.max_retries {
            config.router.policy.max_retries = max_retries;
        }
        if let Some(strategy) = self.cache_strategy {
            config.router.cache.strategy = strategy;
        }
        if let Some(strategy) = self.fallback_strategy {
            config.router.policy.fallback_strategy = strategy;
        }
        if let Some(ms) = self.default_timeout_ms {
            config.router.policy.default_timeout_ms = ms;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
