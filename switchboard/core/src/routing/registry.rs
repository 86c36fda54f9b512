//! Model Registry & Candidate Filter
//!
//! Holds the current backend list and routing policy as one immutable
//! snapshot. Readers take an `Arc` to the snapshot and never block a reload;
//! a reload validates the new list, swaps the snapshot and bumps a version
//! on a watch channel so subscribers learn about it.
//!
//! Candidate filtering keeps an active backend only if it is not
//! blacklisted, serves the task type, has enough output budget for complex
//! requests, and is within the cost ceiling. Text-only backends are kept out
//! of initial selection; they only serve degraded fallback. A preferred
//! backend that passes the same filter is returned alone; one that fails it
//! is ignored.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::watch;

use super::config::{BackendConfig, Capability, Complexity, RoutingPolicy, SelectionCriteria, TaskType};

/// Registry errors
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// Filtering yielded nothing and no active default exists
    #[error("no backend available for task {task_type}")]
    NoBackendAvailable {
        /// Requested task type
        task_type: TaskType,
    },

    /// No backend with this id
    #[error("unknown backend: {0}")]
    UnknownBackend(String),

    /// Two backends share an id
    #[error("duplicate backend id: {0}")]
    DuplicateBackend(String),

    /// More than one backend is flagged default
    #[error("more than one default backend: {0:?}")]
    MultipleDefaults(Vec<String>),
}

/// Point-in-time view of the configuration
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RegistrySnapshot {
    /// Configured backends in declaration order
    pub backends: Vec<BackendConfig>,
    /// Routing policy
    pub policy: RoutingPolicy,
    /// Incremented on every reload
    pub version: u64,
}

impl RegistrySnapshot {
    /// Look up a backend by id
    #[must_use]
    pub fn get(&self, backend_id: &str) -> Option<&BackendConfig> {
        self.backends.iter().find(|b| b.id == backend_id)
    }

    /// The active default backend, if any
    #[must_use]
    pub fn default_backend(&self) -> Option<&BackendConfig> {
        self.backends.iter().find(|b| b.is_default && b.active)
    }

    /// Ranked candidates for `criteria`
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NoBackendAvailable`] when nothing matches
    /// and no active default exists.
    pub fn select_candidates(
        &self,
        criteria: &SelectionCriteria,
    ) -> Result<Vec<BackendConfig>, RegistryError> {
        if let Some(preferred) = criteria
            .preferred_backend
            .as_deref()
            .and_then(|id| self.get(id))
            .filter(|b| self.admits(b, criteria))
        {
            return Ok(vec![preferred.clone()]);
        }

        let mut candidates: Vec<BackendConfig> = self
            .backends
            .iter()
            .filter(|b| self.admits(b, criteria))
            .cloned()
            .collect();

        if candidates.is_empty() {
            return self
                .default_backend()
                .map(|b| vec![b.clone()])
                .ok_or(RegistryError::NoBackendAvailable {
                    task_type: criteria.task_type,
                });
        }

        if criteria.cost_sensitive {
            candidates.sort_by(|a, b| {
                a.cost_per_unit
                    .total_cmp(&b.cost_per_unit)
                    .then(a.priority.cmp(&b.priority))
                    .then_with(|| a.id.cmp(&b.id))
            });
        } else {
            candidates.sort_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then(a.cost_per_unit.total_cmp(&b.cost_per_unit))
                    .then_with(|| a.id.cmp(&b.id))
            });
        }

        Ok(candidates)
    }

    fn admits(&self, backend: &BackendConfig, criteria: &SelectionCriteria) -> bool {
        backend.active
            && backend.capability == Capability::Full
            && !self.policy.is_blacklisted(&backend.id)
            && backend.supports(criteria.task_type)
            && (criteria.complexity != Some(Complexity::Complex)
                || backend.max_output >= self.policy.complex_min_output)
            && criteria
                .cost_ceiling
                .map_or(true, |ceiling| backend.cost_per_unit <= ceiling)
    }
}

/// Validate a backend list
///
/// # Errors
///
/// Rejects duplicate ids and more than one default backend.
pub fn validate_backends(backends: &[BackendConfig]) -> Result<(), RegistryError> {
    let mut seen = HashSet::new();
    for b in backends {
        if !seen.insert(b.id.as_str()) {
            return Err(RegistryError::DuplicateBackend(b.id.clone()));
        }
    }
    let defaults: Vec<String> = backends
        .iter()
        .filter(|b| b.is_default)
        .map(|b| b.id.clone())
        .collect();
    if defaults.len() > 1 {
        return Err(RegistryError::MultipleDefaults(defaults));
    }
    Ok(())
}

/// Owner of the current configuration snapshot
#[derive(Debug)]
pub struct ModelRegistry {
    current: RwLock<Arc<RegistrySnapshot>>,
    updates: watch::Sender<u64>,
}

impl ModelRegistry {
    /// Create from an initial backend list and policy
    ///
    /// # Errors
    ///
    /// See [`validate_backends`].
    pub fn new(backends: Vec<BackendConfig>, policy: RoutingPolicy) -> Result<Self, RegistryError> {
        validate_backends(&backends)?;
        let (updates, _) = watch::channel(0);
        Ok(Self {
            current: RwLock::new(Arc::new(RegistrySnapshot {
                backends,
                policy,
                version: 0,
            })),
            updates,
        })
    }

    /// Current snapshot
    #[must_use]
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        Arc::clone(&self.current.read())
    }

    /// Replace the configuration and notify subscribers
    ///
    /// # Errors
    ///
    /// The previous snapshot stays in place if validation fails.
    pub fn reload(
        &self,
        backends: Vec<BackendConfig>,
        policy: RoutingPolicy,
    ) -> Result<u64, RegistryError> {
        validate_backends(&backends)?;
        let version = {
            let mut current = self.current.write();
            let version = current.version + 1;
            *current = Arc::new(RegistrySnapshot {
                backends,
                policy,
                version,
            });
            version
        };
        self.updates.send_replace(version);
        tracing::info!(version = version, "Registry reloaded");
        Ok(version)
    }

    /// Receive the snapshot version after every reload
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.updates.subscribe()
    }

    /// Look up a backend in the current snapshot
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownBackend`] if absent.
    pub fn get(&self, backend_id: &str) -> Result<BackendConfig, RegistryError> {
        self.snapshot()
            .get(backend_id)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownBackend(backend_id.to_string()))
    }

    /// Ranked candidates from the current snapshot
    ///
    /// # Errors
    ///
    /// See [`RegistrySnapshot::select_candidates`].
    pub fn select_candidates(
        &self,
        criteria: &SelectionCriteria,
    ) -> Result<Vec<BackendConfig>, RegistryError> {
        self.snapshot().select_candidates(criteria)
    }
}
