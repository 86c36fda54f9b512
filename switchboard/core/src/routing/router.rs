//! Router
//!
//! The main entry point. Owns every routing service as an explicitly
//! constructed collaborator and runs the background sweeps.
//!
//! # Usage
//!
//! ```ignore
//! let router = Router::builder(config)
//!     .backends(adapters)
//!     .kv_store(store)
//!     .usage_log(log)
//!     .build()?;
//! router.restore().await?;
//! router.start();
//!
//! let outcome = router.route(prompt, &criteria, "user-1").await?;
//!
//! router.shutdown().await;
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use super::admission::{AdmissionControl, PROJECTION_INTERVAL};
use super::cache::ResponseCache;
use super::config::{RetryConfig, RouterConfig, RoutingPolicy};
use super::experiment::ExperimentResolver;
use super::health::HealthMonitor;
use super::metrics::DispatchMetrics;
use super::preference::PreferenceLearner;
use super::quality::QualityAssessor;
use super::registry::{ModelRegistry, RegistryError};
use super::sweep::SweepHandle;
use crate::backend::{Backend, ErrorClassifier};
use crate::routing::config::BackendConfig;
use crate::store::{AlertSink, KvStore, TracingAlertSink, UsageLog};

/// Router construction errors
#[derive(Debug, Error)]
pub enum BuildError {
    /// Backend list failed validation
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// An error classification pattern failed to compile
    #[error("invalid error pattern: {0}")]
    Pattern(#[from] regex::Error),
}

// ============================================================================
// Builder
// ============================================================================

/// Collects a router's collaborators
pub struct RouterBuilder {
    config: RouterConfig,
    backends: HashMap<String, Arc<dyn Backend>>,
    kv_store: Option<Arc<dyn KvStore>>,
    usage_log: Option<Arc<dyn UsageLog>>,
    alerts: Arc<dyn AlertSink>,
}

impl std::fmt::Debug for RouterBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterBuilder")
            .field("backends", &self.backends.keys().collect::<Vec<_>>())
            .field("kv_store", &self.kv_store.is_some())
            .field("usage_log", &self.usage_log.is_some())
            .finish_non_exhaustive()
    }
}

impl RouterBuilder {
    /// Backend adapters keyed by backend id
    #[must_use]
    pub fn backends(mut self, backends: HashMap<String, Arc<dyn Backend>>) -> Self {
        self.backends = backends;
        self
    }

    /// Durable store for cache entries, preferences and experiments
    #[must_use]
    pub fn kv_store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.kv_store = Some(store);
        self
    }

    /// Append-only usage log
    #[must_use]
    pub fn usage_log(mut self, log: Arc<dyn UsageLog>) -> Self {
        self.usage_log = Some(log);
        self
    }

    /// Alert destination (defaults to tracing)
    #[must_use]
    pub fn alert_sink(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }

    /// Assemble the router
    ///
    /// # Errors
    ///
    /// Fails on an invalid backend list or error pattern.
    pub fn build(self) -> Result<Router, BuildError> {
        let RouterConfig {
            backends,
            policy,
            retry,
            health,
            cache,
            preference,
            quality,
            errors,
            tiers,
        } = self.config;

        let registry = ModelRegistry::new(backends, policy)?;
        let classifier = ErrorClassifier::new(&errors)?;

        let mut response_cache = ResponseCache::new(cache);
        let mut preferences = PreferenceLearner::new(preference);
        let mut experiments = ExperimentResolver::new();
        if let Some(store) = &self.kv_store {
            response_cache = response_cache.with_store(Arc::clone(store));
            preferences = preferences.with_store(Arc::clone(store));
            experiments = experiments.with_store(Arc::clone(store));
        }

        let mut admission = AdmissionControl::new(tiers, Arc::clone(&self.alerts));
        if let Some(log) = &self.usage_log {
            admission = admission.with_usage_log(Arc::clone(log));
        }

        Ok(Router {
            registry: Arc::new(registry),
            backends: RwLock::new(self.backends),
            health: Arc::new(HealthMonitor::new(health, Arc::clone(&self.alerts))),
            cache: Arc::new(response_cache),
            quality: QualityAssessor::new(quality),
            preferences: Arc::new(preferences),
            experiments: Arc::new(experiments),
            admission: Arc::new(admission),
            classifier,
            retry,
            usage_log: self.usage_log,
            metrics: Arc::new(DispatchMetrics::new()),
            sweeps: Mutex::new(Vec::new()),
        })
    }
}

// ============================================================================
// Router
// ============================================================================

/// Resilient multi-backend router
pub struct Router {
    pub(super) registry: Arc<ModelRegistry>,
    pub(super) backends: RwLock<HashMap<String, Arc<dyn Backend>>>,
    pub(super) health: Arc<HealthMonitor>,
    pub(super) cache: Arc<ResponseCache>,
    pub(super) quality: QualityAssessor,
    pub(super) preferences: Arc<PreferenceLearner>,
    pub(super) experiments: Arc<ExperimentResolver>,
    pub(super) admission: Arc<AdmissionControl>,
    pub(super) classifier: ErrorClassifier,
    pub(super) retry: RetryConfig,
    pub(super) usage_log: Option<Arc<dyn UsageLog>>,
    pub(super) metrics: Arc<DispatchMetrics>,
    sweeps: Mutex<Vec<SweepHandle>>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("registry", &self.registry)
            .field("backends", &self.backends.read().len())
            .field("sweeps", &self.sweeps.lock().len())
            .finish_non_exhaustive()
    }
}

impl Router {
    /// Start building a router from configuration
    #[must_use]
    pub fn builder(config: RouterConfig) -> RouterBuilder {
        RouterBuilder {
            config,
            backends: HashMap::new(),
            kv_store: None,
            usage_log: None,
            alerts: Arc::new(TracingAlertSink),
        }
    }

    /// Load persisted preferences and experiments
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be scanned.
    pub async fn restore(&self) -> anyhow::Result<()> {
        let preferences = self.preferences.restore().await?;
        let experiments = self.experiments.restore().await?;
        tracing::info!(
            preferences = preferences,
            experiments = experiments,
            "Restored router state"
        );
        Ok(())
    }

    /// Start the health, cache and spend-projection sweeps
    ///
    /// Calling it again while sweeps are running is a no-op.
    pub fn start(&self) {
        let mut sweeps = self.sweeps.lock();
        if !sweeps.is_empty() {
            return;
        }
        sweeps.push(self.health.spawn_sweeper());
        sweeps.push(self.cache.spawn_sweeper());
        sweeps.push(self.admission.spawn_projection_sweeper(PROJECTION_INTERVAL));
        tracing::info!(sweeps = sweeps.len(), "Router started");
    }

    /// Stop every sweep
    pub async fn shutdown(&self) {
        let sweeps: Vec<SweepHandle> = std::mem::take(&mut *self.sweeps.lock());
        for sweep in sweeps {
            sweep.stop().await;
        }
        tracing::info!("Router stopped");
    }

    /// Whether the sweeps are running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.sweeps.lock().iter().any(SweepHandle::is_running)
    }

    /// Swap in a new backend list, policy and adapter set
    ///
    /// # Errors
    ///
    /// The current configuration stays in place if validation fails.
    pub fn reload(
        &self,
        backends: Vec<BackendConfig>,
        policy: RoutingPolicy,
        adapters: HashMap<String, Arc<dyn Backend>>,
    ) -> Result<u64, RegistryError> {
        // Adapter readers wait out the swap so a new snapshot never meets
        // the old adapter map.
        let backend_ids: HashSet<String> = backends.iter().map(|b| b.id.clone()).collect();
        let mut current = self.backends.write();
        let version = self.registry.reload(backends, policy)?;
        *current = adapters;
        drop(current);
        self.health.retain_backends(&backend_ids);
        Ok(version)
    }

    pub(super) fn adapter(&self, backend_id: &str) -> Option<Arc<dyn Backend>> {
        self.backends.read().get(backend_id).cloned()
    }

    /// Backend registry
    #[must_use]
    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    /// Health monitor
    #[must_use]
    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    /// Response cache
    #[must_use]
    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    /// Preference learner
    #[must_use]
    pub fn preferences(&self) -> &Arc<PreferenceLearner> {
        &self.preferences
    }

    /// Experiment resolver
    #[must_use]
    pub fn experiments(&self) -> &Arc<ExperimentResolver> {
        &self.experiments
    }

    /// Admission control
    #[must_use]
    pub fn admission(&self) -> &Arc<AdmissionControl> {
        &self.admission
    }

    /// Dispatch metrics
    #[must_use]
    pub fn metrics(&self) -> &Arc<DispatchMetrics> {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ErrorPatterns;
    use crate::routing::test_utils::{backend_map, router_config, ScriptedBackend};

    #[test]
    fn test_build_rejects_duplicate_backends() {
        let config = router_config(vec![
            BackendConfig::new("a", "p", "m"),
            BackendConfig::new("a", "p", "m"),
        ]);
        assert!(matches!(
            Router::builder(config).build(),
            Err(BuildError::Registry(RegistryError::DuplicateBackend(_)))
        ));
    }

    #[test]
    fn test_build_rejects_bad_pattern() {
        let mut config = router_config(vec![BackendConfig::new("a", "p", "m")]);
        config.errors = ErrorPatterns {
            fatal: vec!["(unclosed".to_string()],
            ..ErrorPatterns::default()
        };
        assert!(matches!(
            Router::builder(config).build(),
            Err(BuildError::Pattern(_))
        ));
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let router = Router::builder(router_config(vec![BackendConfig::new("a", "p", "m")]))
            .build()
            .unwrap();
        assert!(!router.is_running());

        router.start();
        router.start();
        assert!(router.is_running());
        assert_eq!(router.sweeps.lock().len(), 3);

        router.shutdown().await;
        assert!(!router.is_running());
    }

    #[tokio::test]
    async fn test_reload_swaps_adapters() {
        let a = Arc::new(ScriptedBackend::new("a"));
        let router = Router::builder(router_config(vec![BackendConfig::new("a", "p", "m")]))
            .backends(backend_map(&[a]))
            .build()
            .unwrap();
        assert!(router.adapter("a").is_some());
        router
            .health()
            .record_outcome("a", true, std::time::Duration::from_millis(10));
        router.health().recompute_all().await;
        assert_eq!(router.health().snapshots().len(), 1);

        let b = Arc::new(ScriptedBackend::new("b"));
        let version = router
            .reload(
                vec![BackendConfig::new("b", "p", "m")],
                RoutingPolicy::default(),
                backend_map(&[b]),
            )
            .unwrap();
        assert_eq!(version, 1);
        assert!(router.health().snapshots().is_empty());
        assert!(router.adapter("a").is_none());
        assert!(router.adapter("b").is_some());
    }

    #[test]
    fn test_rejected_reload_keeps_adapters() {
        let a = Arc::new(ScriptedBackend::new("a"));
        let router = Router::builder(router_config(vec![BackendConfig::new("a", "p", "m")]))
            .backends(backend_map(&[a]))
            .build()
            .unwrap();

        let b = Arc::new(ScriptedBackend::new("b"));
        let result = router.reload(
            vec![BackendConfig::new("b", "p", "m"), BackendConfig::new("b", "p", "m")],
            RoutingPolicy::default(),
            backend_map(&[b]),
        );
        assert!(result.is_err());
        assert_eq!(router.registry().snapshot().version, 0);
        assert!(router.adapter("a").is_some());
        assert!(router.adapter("b").is_none());
    }
}
