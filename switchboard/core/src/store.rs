//! Persistence and Alerting Collaborators
//!
//! Narrow repository interfaces the router depends on, plus the adapters
//! shipped with the crate:
//!
//! - [`KvStore`]: namespaced JSON key-value store for cache entries,
//!   experiment assignments and user preferences
//! - [`UsageLog`]: append-only outcome log used by cost analysis
//! - [`AlertSink`]: destination for health and spend alerts
//!
//! The storage engine itself is external; [`FileKvStore`] and
//! [`FileUsageLog`] are simple file-backed adapters good enough for a single
//! daemon process, the `Memory*` types serve tests and embedded use.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::routing::config::TaskType;

// ============================================================================
// Key-Value Store
// ============================================================================

/// Key-value repository with JSON values
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Fetch a value
    async fn get(&self, key: &str) -> anyhow::Result<Option<serde_json::Value>>;

    /// Insert or replace a value
    async fn put(&self, key: &str, value: serde_json::Value) -> anyhow::Result<()>;

    /// Remove a value (missing keys are not an error)
    async fn delete(&self, key: &str) -> anyhow::Result<()>;

    /// All entries whose key starts with `prefix`
    async fn scan_prefix(&self, prefix: &str) -> anyhow::Result<Vec<(String, serde_json::Value)>>;
}

/// Fetch and deserialize a typed value
pub async fn load_json<T: DeserializeOwned>(
    store: &dyn KvStore,
    key: &str,
) -> anyhow::Result<Option<T>> {
    match store.get(key).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

/// Serialize and store a typed value
pub async fn save_json<T: Serialize + Sync>(
    store: &dyn KvStore,
    key: &str,
    value: &T,
) -> anyhow::Result<()> {
    store.put(key, serde_json::to_value(value)?).await
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: DashMap<String, serde_json::Value>,
}

impl MemoryKvStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    async fn put(&self, key: &str, value: serde_json::Value) -> anyhow::Result<()> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> anyhow::Result<Vec<(String, serde_json::Value)>> {
        Ok(self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect())
    }
}

/// One JSON file per key under a directory
///
/// File names are the hex-encoded key so arbitrary key characters are safe.
/// Writes go through a temp file and rename.
#[derive(Debug, Clone)]
pub struct FileKvStore {
    dir: PathBuf,
}

impl FileKvStore {
    /// Open (and create if needed) a store rooted at `dir`
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub async fn open(dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", hex::encode(key)))
    }
}

#[async_trait]
impl KvStore for FileKvStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &str, value: serde_json::Value) -> anyhow::Result<()> {
        let path = self.path_for(key);
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, serde_json::to_vec(&value)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn scan_prefix(&self, prefix: &str) -> anyhow::Result<Vec<(String, serde_json::Value)>> {
        let mut out = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            let Ok(raw) = hex::decode(stem) else {
                continue;
            };
            let Ok(key) = String::from_utf8(raw) else {
                continue;
            };
            if !key.starts_with(prefix) {
                continue;
            }
            let bytes = tokio::fs::read(entry.path()).await?;
            out.push((key, serde_json::from_slice(&bytes)?));
        }
        Ok(out)
    }
}

// ============================================================================
// Usage Log
// ============================================================================

/// One backend attempt as recorded for analytics
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Backend that served the attempt
    pub backend_id: String,
    /// Task type of the request
    pub task_type: TaskType,
    /// Budget tier, if any
    pub tier: Option<String>,
    /// Whether the attempt produced a response
    pub success: bool,
    /// Attempt latency in milliseconds
    pub latency_ms: u64,
    /// Attempt cost
    pub cost: f64,
    /// Estimated prompt tokens
    pub prompt_tokens: u32,
    /// Request fingerprint
    pub fingerprint: String,
    /// When the attempt finished
    pub timestamp: DateTime<Utc>,
}

/// Append-only usage/outcome log
#[async_trait]
pub trait UsageLog: Send + Sync {
    /// Append a record
    async fn append(&self, record: UsageRecord) -> anyhow::Result<()>;

    /// All records at or after `since`
    async fn since(&self, since: DateTime<Utc>) -> anyhow::Result<Vec<UsageRecord>>;
}

/// In-memory usage log
#[derive(Debug, Default)]
pub struct MemoryUsageLog {
    records: Mutex<Vec<UsageRecord>>,
}

impl MemoryUsageLog {
    /// Create an empty log
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether the log is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl UsageLog for MemoryUsageLog {
    async fn append(&self, record: UsageRecord) -> anyhow::Result<()> {
        self.records.lock().push(record);
        Ok(())
    }

    async fn since(&self, since: DateTime<Utc>) -> anyhow::Result<Vec<UsageRecord>> {
        Ok(self
            .records
            .lock()
            .iter()
            .filter(|r| r.timestamp >= since)
            .cloned()
            .collect())
    }
}

/// JSON-lines usage log
#[derive(Debug)]
pub struct FileUsageLog {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileUsageLog {
    /// Use (and create parent directories for) `path`
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory cannot be created.
    pub async fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(Self {
            path,
            write_lock: tokio::sync::Mutex::new(()),
        })
    }
}

#[async_trait]
impl UsageLog for FileUsageLog {
    async fn append(&self, record: UsageRecord) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    async fn since(&self, since: DateTime<Utc>) -> anyhow::Result<Vec<UsageRecord>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut out = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<UsageRecord>(line) {
                Ok(record) if record.timestamp >= since => out.push(record),
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "Skipping malformed usage record"),
            }
        }
        Ok(out)
    }
}

// ============================================================================
// Alerting
// ============================================================================

/// What triggered an alert
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlertKind {
    /// Backend entered `unavailable` with a sustained high error rate
    BackendUnavailable {
        /// Affected backend
        backend_id: String,
        /// Error rate over the window
        error_rate: f64,
        /// Outcomes in the window
        samples: usize,
    },
    /// Projected monthly spend trends over budget
    SpendProjection {
        /// Budget tier
        tier: String,
        /// Projected spend for the month
        projected: f64,
        /// Monthly budget
        budget: f64,
    },
}

/// Alert event
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// Trigger details
    pub kind: AlertKind,
    /// Human-readable summary
    pub message: String,
    /// When the alert was raised
    pub raised_at: DateTime<Utc>,
}

impl Alert {
    /// Create an alert raised now
    pub fn new(kind: AlertKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            raised_at: Utc::now(),
        }
    }
}

/// Destination for alerts
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Deliver an alert; delivery failures are the sink's concern
    async fn alert(&self, alert: Alert);
}

/// Logs alerts through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn alert(&self, alert: Alert) {
        match &alert.kind {
            AlertKind::BackendUnavailable {
                backend_id,
                error_rate,
                samples,
            } => tracing::error!(
                backend = %backend_id,
                error_rate = error_rate,
                samples = samples,
                "{}",
                alert.message
            ),
            AlertKind::SpendProjection {
                tier,
                projected,
                budget,
            } => tracing::warn!(
                tier = %tier,
                projected = projected,
                budget = budget,
                "{}",
                alert.message
            ),
        }
    }
}
