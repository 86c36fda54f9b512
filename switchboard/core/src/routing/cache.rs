//! Response Cache
//!
//! Content-addressed cache of accepted responses. Entries are keyed by a
//! fingerprint of the normalized request text plus task type, and expire a
//! strategy-dependent TTL after creation:
//!
//! | Strategy   | TTL    |
//! |------------|--------|
//! | aggressive | 24h    |
//! | moderate   | 4h     |
//! | minimal    | 30min  |
//!
//! A bounded in-memory LRU sits in front of an optional durable
//! [`KvStore`]. Hits bump `hit_count` and are written back to the store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::config::TaskType;
use super::sweep::SweepHandle;
use crate::store::{self, KvStore};

const KEY_PREFIX: &str = "cache/";

// ============================================================================
// Configuration
// ============================================================================

/// How long accepted responses stay cached
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CachingStrategy {
    /// 24 hours
    Aggressive,
    /// 4 hours
    #[default]
    Moderate,
    /// 30 minutes
    Minimal,
}

impl CachingStrategy {
    /// Entry lifetime for this strategy
    #[must_use]
    pub fn ttl(&self) -> Duration {
        match self {
            Self::Aggressive => Duration::from_secs(24 * 60 * 60),
            Self::Moderate => Duration::from_secs(4 * 60 * 60),
            Self::Minimal => Duration::from_secs(30 * 60),
        }
    }

    /// Lowercase name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aggressive => "aggressive",
            Self::Moderate => "moderate",
            Self::Minimal => "minimal",
        }
    }
}

impl std::str::FromStr for CachingStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "aggressive" => Ok(Self::Aggressive),
            "moderate" => Ok(Self::Moderate),
            "minimal" => Ok(Self::Minimal),
            other => Err(format!("unknown caching strategy: {other}")),
        }
    }
}

/// Cache settings
#[derive(Clone, Debug, PartialEq)]
pub struct CacheConfig {
    /// Default strategy when the request's tier does not set one
    pub strategy: CachingStrategy,
    /// In-memory entry limit
    pub capacity: usize,
    /// Responses costing more than this are cached
    pub min_cost: f64,
    /// Responses scoring more than this are cached
    pub min_quality: f64,
    /// Expiry sweep period
    pub sweep_interval: Duration,
    /// Fixed TTL overriding the strategy (mainly for tests)
    pub ttl_override: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            strategy: CachingStrategy::Moderate,
            capacity: 1000,
            min_cost: 0.01,
            min_quality: 0.8,
            sweep_interval: Duration::from_secs(3600),
            ttl_override: None,
        }
    }
}

impl CacheConfig {
    fn ttl(&self, strategy: CachingStrategy) -> Duration {
        self.ttl_override.unwrap_or_else(|| strategy.ttl())
    }
}

// ============================================================================
// Entries
// ============================================================================

/// Stable fingerprint of (normalized text, task type)
///
/// Normalization is trim plus lowercase.
#[must_use]
pub fn fingerprint(text: &str, task_type: TaskType) -> String {
    let mut hasher = Sha256::new();
    hasher.update(task_type.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(text.trim().to_lowercase().as_bytes());
    hex::encode(hasher.finalize())
}

/// Cached response
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request fingerprint
    pub fingerprint: String,
    /// Response text
    pub response: String,
    /// Backend that produced it
    pub backend_id: String,
    /// What it cost
    pub cost: f64,
    /// Quality score at acceptance
    pub quality: Option<f64>,
    /// Insert time
    pub created_at: DateTime<Utc>,
    /// `created_at` + strategy TTL
    pub expires_at: DateTime<Utc>,
    /// Times served from cache
    pub hit_count: u64,
}

impl CacheEntry {
    /// Whether the entry is past its expiry at `now`
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

struct Slot {
    entry: CacheEntry,
    last_access: u64,
}

/// Hit/miss counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups answered from cache
    pub hits: u64,
    /// Lookups that found nothing usable
    pub misses: u64,
    /// Entries currently in memory
    pub entries: usize,
}

// ============================================================================
// Response Cache
// ============================================================================

/// LRU-bounded response cache with optional durable backing
pub struct ResponseCache {
    config: CacheConfig,
    entries: DashMap<String, Slot>,
    clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    store: Option<Arc<dyn KvStore>>,
}

impl std::fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCache")
            .field("config", &self.config)
            .field("entries", &self.entries.len())
            .field("durable", &self.store.is_some())
            .finish_non_exhaustive()
    }
}

impl ResponseCache {
    /// Memory-only cache
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
            clock: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            store: None,
        }
    }

    /// Back the cache with a durable store
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Cache settings
    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Whether a response qualifies for caching
    #[must_use]
    pub fn should_cache(&self, cost: f64, quality: Option<f64>) -> bool {
        cost > self.config.min_cost || quality.is_some_and(|q| q > self.config.min_quality)
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Look up a live entry
    pub async fn get(&self, fingerprint: &str) -> Option<CacheEntry> {
        let now = Utc::now();

        let (in_memory, expired) = match self.entries.get_mut(fingerprint) {
            Some(mut slot) if !slot.entry.is_expired(now) => {
                slot.entry.hit_count += 1;
                slot.last_access = self.tick();
                (Some(slot.entry.clone()), false)
            }
            Some(_) => (None, true),
            None => (None, false),
        };

        let found = if expired {
            self.entries.remove(fingerprint);
            self.forget(fingerprint).await;
            None
        } else if in_memory.is_some() {
            in_memory
        } else {
            self.load_from_store(fingerprint, now).await
        };

        match found {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                self.persist(&entry).await;
                Some(entry)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    async fn load_from_store(&self, fingerprint: &str, now: DateTime<Utc>) -> Option<CacheEntry> {
        let store = self.store.as_ref()?;
        let key = format!("{KEY_PREFIX}{fingerprint}");
        let mut entry: CacheEntry = match store::load_json(store.as_ref(), &key).await {
            Ok(entry) => entry?,
            Err(e) => {
                tracing::warn!(error = %e, "Cache store read failed");
                return None;
            }
        };

        if entry.is_expired(now) {
            self.forget(fingerprint).await;
            return None;
        }

        entry.hit_count += 1;
        self.insert_slot(entry.clone());
        Some(entry)
    }

    /// Cache a response under the default strategy
    ///
    /// Returns whether the entry was stored.
    pub async fn put(
        &self,
        fingerprint: &str,
        response: &str,
        backend_id: &str,
        cost: f64,
        quality: Option<f64>,
    ) -> bool {
        self.put_with_strategy(
            fingerprint,
            response,
            backend_id,
            cost,
            quality,
            self.config.strategy,
        )
        .await
    }

    /// Cache a response with an explicit strategy
    pub async fn put_with_strategy(
        &self,
        fingerprint: &str,
        response: &str,
        backend_id: &str,
        cost: f64,
        quality: Option<f64>,
        strategy: CachingStrategy,
    ) -> bool {
        if !self.should_cache(cost, quality) {
            tracing::debug!(backend = %backend_id, cost = cost, "Response not worth caching");
            return false;
        }

        let created_at = Utc::now();
        let ttl = chrono::Duration::from_std(self.config.ttl(strategy))
            .unwrap_or_else(|_| chrono::Duration::zero());
        let entry = CacheEntry {
            fingerprint: fingerprint.to_string(),
            response: response.to_string(),
            backend_id: backend_id.to_string(),
            cost,
            quality,
            created_at,
            expires_at: created_at + ttl,
            hit_count: 0,
        };

        self.insert_slot(entry.clone());
        self.persist(&entry).await;
        true
    }

    fn insert_slot(&self, entry: CacheEntry) {
        let last_access = self.tick();
        self.entries.insert(
            entry.fingerprint.clone(),
            Slot { entry, last_access },
        );

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

    async fn persist(&self, entry: &CacheEntry) {
        if let Some(store) = &self.store {
            let key = format!("{KEY_PREFIX}{}", entry.fingerprint);
            if let Err(e) = store::save_json(store.as_ref(), &key, entry).await {
                tracing::warn!(error = %e, "Cache store write failed");
            }
        }
    }

    async fn forget(&self, fingerprint: &str) {
        if let Some(store) = &self.store {
            if let Err(e) = store.delete(&format!("{KEY_PREFIX}{fingerprint}")).await {
                tracing::warn!(error = %e, "Cache store delete failed");
            }
        }
    }

    /// Remove expired entries from memory and the durable store
    ///
    /// Returns how many in-memory entries were removed.
    pub async fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|s| s.value().entry.is_expired(now))
            .map(|s| s.key().clone())
            .collect();

        let mut removed = 0;
        for key in &expired {
            if self
                .entries
                .remove_if(key, |_, slot| slot.entry.is_expired(now))
                .is_some()
            {
                removed += 1;
            }
        }

        if let Some(store) = &self.store {
            match store.scan_prefix(KEY_PREFIX).await {
                Ok(stored) => {
                    for (key, value) in stored {
                        let stale = serde_json::from_value::<CacheEntry>(value)
                            .map_or(true, |e| e.is_expired(now));
                        if stale {
                            if let Err(e) = store.delete(&key).await {
                                tracing::warn!(error = %e, "Cache store delete failed");
                            }
                        }
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Cache store scan failed"),
            }
        }

        if removed > 0 {
            tracing::debug!(removed = removed, "Expired cache entries swept");
        }
        removed
    }

    /// Start the periodic expiry task
    pub fn spawn_sweeper(self: &Arc<Self>) -> SweepHandle {
        let cache = Arc::clone(self);
        SweepHandle::spawn("cache", self.config.sweep_interval, move || {
            let cache = Arc::clone(&cache);
            async move {
                cache.sweep_expired().await;
            }
        })
    }

    /// Entries currently in memory
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether memory holds no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Hit/miss counters
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.len(),
        }
    }
}
