//! User Preference Learning
//!
//! Exponential moving averages of success, latency and quality per
//! (user, backend, task type). Once a user has enough history with a
//! backend, [`PreferenceLearner::recommend`] steers their requests to it.
//!
//! Score = 0.4 · success + 0.4 · quality + 0.2 · (1 − min(latency / 10s, 1))

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::config::{BackendConfig, TaskType};
use crate::store::{self, KvStore};

const KEY_PREFIX: &str = "preference/";

/// Learner settings
#[derive(Clone, Debug, PartialEq)]
pub struct PreferenceConfig {
    /// EMA weight of the newest observation
    pub alpha: f64,
    /// Interactions required before a preference is trusted
    pub min_usage: u64,
    /// In-memory entry limit
    pub capacity: usize,
    /// Latency that normalizes to the worst score
    pub latency_ceiling_ms: f64,
}

impl Default for PreferenceConfig {
    fn default() -> Self {
        Self {
            alpha: 0.3,
            min_usage: 3,
            capacity: 10_000,
            latency_ceiling_ms: 10_000.0,
        }
    }
}

/// (user, backend, task) triple
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PreferenceKey {
    /// User identifier
    pub user_id: String,
    /// Backend identifier
    pub backend_id: String,
    /// Task type
    pub task_type: TaskType,
}

impl PreferenceKey {
    /// Build a key
    pub fn new(user_id: impl Into<String>, backend_id: impl Into<String>, task_type: TaskType) -> Self {
        Self {
            user_id: user_id.into(),
            backend_id: backend_id.into(),
            task_type,
        }
    }

    fn store_key(&self) -> String {
        format!(
            "{KEY_PREFIX}{}/{}/{}",
            self.user_id, self.task_type, self.backend_id
        )
    }
}

/// Observed result of one interaction
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct InteractionOutcome {
    /// Whether the backend answered acceptably
    pub success: bool,
    /// End-to-end latency
    pub latency_ms: f64,
    /// Quality score (0.0 - 1.0)
    pub quality: f64,
}

/// Learned preference state
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserPreference {
    /// Which triple this describes
    pub key: PreferenceKey,
    /// Success-rate EMA
    pub success_rate: f64,
    /// Latency EMA in milliseconds
    pub latency_ms: f64,
    /// Quality EMA
    pub quality: f64,
    /// Interactions observed
    pub usage_count: u64,
    /// Last interaction
    pub last_used: DateTime<Utc>,
}

impl UserPreference {
    /// Seed from a first observation
    fn first(key: PreferenceKey, outcome: &InteractionOutcome) -> Self {
        Self {
            key,
            success_rate: if outcome.success { 1.0 } else { 0.0 },
            latency_ms: outcome.latency_ms,
            quality: outcome.quality,
            usage_count: 1,
            last_used: Utc::now(),
        }
    }

    fn observe(&mut self, outcome: &InteractionOutcome, alpha: f64) {
        let ema = |prev: f64, next: f64| (1.0 - alpha) * prev + alpha * next;
        self.success_rate = ema(self.success_rate, if outcome.success { 1.0 } else { 0.0 });
        self.latency_ms = ema(self.latency_ms, outcome.latency_ms);
        self.quality = ema(self.quality, outcome.quality);
        self.usage_count += 1;
        self.last_used = Utc::now();
    }

    /// Weighted preference score
    #[must_use]
    pub fn score(&self, latency_ceiling_ms: f64) -> f64 {
        let latency = (self.latency_ms / latency_ceiling_ms).min(1.0);
        0.4 * self.success_rate + 0.4 * self.quality + 0.2 * (1.0 - latency)
    }
}

struct Slot {
    preference: UserPreference,
    last_access: u64,
}

/// Per-user backend preference tracker
pub struct PreferenceLearner {
    config: PreferenceConfig,
    entries: DashMap<PreferenceKey, Slot>,
    clock: AtomicU64,
    store: Option<Arc<dyn KvStore>>,
}

impl std::fmt::Debug for PreferenceLearner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreferenceLearner")
            .field("config", &self.config)
            .field("entries", &self.entries.len())
            .finish_non_exhaustive()
    }
}

impl PreferenceLearner {
    /// Memory-only learner
    #[must_use]
    pub fn new(config: PreferenceConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
            clock: AtomicU64::new(0),
            store: None,
        }
    }

    /// Persist preferences to a durable store
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Load persisted preferences (up to capacity)
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be scanned.
    pub async fn restore(&self) -> anyhow::Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };

        let mut loaded = 0;
        for (key, value) in store.scan_prefix(KEY_PREFIX).await? {
            match serde_json::from_value::<UserPreference>(value) {
                Ok(preference) => {
                    self.insert(preference);
                    loaded += 1;
                }
                Err(e) => tracing::warn!(key = %key, error = %e, "Skipping malformed preference"),
            }
        }
        tracing::info!(loaded = loaded, "Restored user preferences");
        Ok(loaded)
    }

    /// Fold an interaction into the triple's EMAs
    pub async fn update(
        &self,
        user_id: &str,
        backend_id: &str,
        task_type: TaskType,
        outcome: InteractionOutcome,
    ) -> UserPreference {
        let key = PreferenceKey::new(user_id, backend_id, task_type);
        let tick = self.clock.fetch_add(1, Ordering::Relaxed);

        let updated = match self.entries.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                let slot = entry.get_mut();
                slot.preference.observe(&outcome, self.config.alpha);
                slot.last_access = tick;
                slot.preference.clone()
            }
            Entry::Vacant(entry) => {
                let preference = UserPreference::first(key.clone(), &outcome);
                entry.insert(Slot {
                    preference: preference.clone(),
                    last_access: tick,
                });
                preference
            }
        };

        self.evict_over_capacity();

        if let Some(store) = &self.store {
            if let Err(e) = store::save_json(store.as_ref(), &key.store_key(), &updated).await {
                tracing::warn!(user = %user_id, error = %e, "Preference write failed");
            }
        }
        updated
    }

    fn insert(&self, preference: UserPreference) {
        let last_access = self.clock.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(
            preference.key.clone(),
            Slot {
                preference,
                last_access,
            },
        );
        self.evict_over_capacity();
    }

    fn evict_over_capacity(&self) {
        while self.entries.len() > self.config.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|s| s.value().last_access)
                .map(|s| s.key().clone());
            match oldest {
                Some(key) => {
                    self.entries.remove(&key);
                }
                None => break,
            }
        }
    }

    /// Current state for a triple
    #[must_use]
    pub fn get(&self, user_id: &str, backend_id: &str, task_type: TaskType) -> Option<UserPreference> {
        self.entries
            .get(&PreferenceKey::new(user_id, backend_id, task_type))
            .map(|s| s.preference.clone())
    }

    /// Best-scoring candidate, if the user has used it at least `min_usage` times
    #[must_use]
    pub fn recommend(
        &self,
        user_id: &str,
        task_type: TaskType,
        candidates: &[BackendConfig],
    ) -> Option<String> {
        let best = candidates
            .iter()
            .filter_map(|c| self.get(user_id, &c.id, task_type))
            .max_by(|a, b| {
                a.score(self.config.latency_ceiling_ms)
                    .total_cmp(&b.score(self.config.latency_ceiling_ms))
            })?;

        (best.usage_count >= self.config.min_usage).then(|| best.key.backend_id)
    }

    /// Entries in memory
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether memory holds no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKvStore;

    fn outcome(success: bool, latency_ms: f64, quality: f64) -> InteractionOutcome {
        InteractionOutcome {
            success,
            latency_ms,
            quality,
        }
    }

    fn candidates(ids: &[&str]) -> Vec<BackendConfig> {
        ids.iter()
            .map(|id| BackendConfig::new(*id, "p", "m"))
            .collect()
    }

    #[tokio::test]
    async fn test_first_observation_seeds_ema() {
        let learner = PreferenceLearner::new(PreferenceConfig::default());
        let pref = learner
            .update("u", "x", TaskType::Chat, outcome(true, 800.0, 0.9))
            .await;
        assert_eq!(pref.usage_count, 1);
        assert!((pref.success_rate - 1.0).abs() < 1e-9);
        assert!((pref.quality - 0.9).abs() < 1e-9);
        assert!((pref.latency_ms - 800.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_ema_update() {
        let learner = PreferenceLearner::new(PreferenceConfig::default());
        learner
            .update("u", "x", TaskType::Chat, outcome(true, 1000.0, 1.0))
            .await;
        let pref = learner
            .update("u", "x", TaskType::Chat, outcome(false, 2000.0, 0.0))
            .await;
        assert_eq!(pref.usage_count, 2);
        assert!((pref.success_rate - 0.7).abs() < 1e-9);
        assert!((pref.quality - 0.7).abs() < 1e-9);
        assert!((pref.latency_ms - 1300.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_cold_start_guard() {
        let learner = PreferenceLearner::new(PreferenceConfig::default());
        for _ in 0..2 {
            learner
                .update("u", "x", TaskType::Chat, outcome(true, 500.0, 0.9))
                .await;
        }
        assert_eq!(learner.recommend("u", TaskType::Chat, &candidates(&["x", "y"])), None);

        learner
            .update("u", "x", TaskType::Chat, outcome(true, 500.0, 0.9))
            .await;
        assert_eq!(
            learner.recommend("u", TaskType::Chat, &candidates(&["x", "y"])),
            Some("x".to_string())
        );
        // Other task types and users are unaffected
        assert_eq!(learner.recommend("u", TaskType::Code, &candidates(&["x"])), None);
        assert_eq!(learner.recommend("v", TaskType::Chat, &candidates(&["x"])), None);
    }

    #[tokio::test]
    async fn test_recommend_only_considers_candidates() {
        let learner = PreferenceLearner::new(PreferenceConfig::default());
        for _ in 0..5 {
            learner
                .update("u", "x", TaskType::Chat, outcome(true, 500.0, 0.9))
                .await;
        }
        assert_eq!(learner.recommend("u", TaskType::Chat, &candidates(&["y"])), None);
    }

    #[tokio::test]
    async fn test_highest_score_wins() {
        let learner = PreferenceLearner::new(PreferenceConfig::default());
        for _ in 0..4 {
            learner
                .update("u", "fast", TaskType::Chat, outcome(true, 200.0, 0.9))
                .await;
            learner
                .update("u", "slow", TaskType::Chat, outcome(true, 9000.0, 0.9))
                .await;
        }
        assert_eq!(
            learner.recommend("u", TaskType::Chat, &candidates(&["slow", "fast"])),
            Some("fast".to_string())
        );
    }

    #[tokio::test]
    async fn test_lru_bound_and_restore() {
        let store = Arc::new(MemoryKvStore::new());
        let learner = PreferenceLearner::new(PreferenceConfig {
            capacity: 2,
            ..PreferenceConfig::default()
        })
        .with_store(store.clone());

        for user in ["a", "b", "c"] {
            learner
                .update(user, "x", TaskType::Chat, outcome(true, 100.0, 0.8))
                .await;
        }
        assert_eq!(learner.len(), 2);
        assert!(learner.get("a", "x", TaskType::Chat).is_none());
        assert_eq!(store.len(), 3);

        let restored = PreferenceLearner::new(PreferenceConfig::default()).with_store(store);
        assert_eq!(restored.restore().await.unwrap(), 3);
        assert!(restored.get("a", "x", TaskType::Chat).is_some());
    }
}
