//! Daemon Server Implementation
//!
//! This module provides the core serve loop for the switchboard daemon:
//! - Reads newline-delimited JSON requests from an input stream
//! - Spawns a routing task per request
//! - Writes one JSON reply per line as requests complete
//! - Supports graceful shutdown
//! - Handles config reload signals
//!
//! # Wire Format
//!
//! ```text
//!   stdin                      DaemonServer                     stdout
//!     │                             │                              │
//!     │ {"id":1,"prompt":"..."}     │                              │
//!     ├────────────────────────────►│ spawn route task             │
//!     │ {"id":2,"prompt":"..."}     │         │                    │
//!     ├────────────────────────────►│ spawn   │                    │
//!     │                             │◄────────┘ reply channel      │
//!     │                             ├─────────────────────────────►│
//!     │                             │  {"id":1,"status":"ok",...}  │
//! ```
//!
//! Replies carry the request `id` so callers can match them; ordering
//! follows completion, not arrival.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use switchboard_core::store::{FileKvStore, FileUsageLog};
use switchboard_core::{
    load_config_from_path, Backend, Complexity, ConfigOverrides, GenerateBackend, RouteError,
    RouteOutcome, Router, SelectionCriteria, SwitchboardConfig, TaskType, Urgency,
};

/// Endpoint used for backends that configure none
pub const DEFAULT_ENDPOINT: &str = "http://localhost:11434";

/// How often the serve loop checks the shutdown and reload flags
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Reply channel capacity
const REPLY_CAPACITY: usize = 256;

// ============================================================================
// Wire Types
// ============================================================================

fn anonymous() -> String {
    "anonymous".to_string()
}

/// One request line
#[derive(Clone, Debug, Deserialize)]
pub struct RouteRequest {
    /// Echoed back on the reply
    #[serde(default)]
    pub id: Option<serde_json::Value>,
    pub prompt: String,
    #[serde(default)]
    pub task_type: TaskType,
    #[serde(default)]
    pub complexity: Option<Complexity>,
    #[serde(default = "anonymous")]
    pub user_id: String,
    #[serde(default)]
    pub tier: Option<String>,
    #[serde(default)]
    pub preferred_backend: Option<String>,
    #[serde(default)]
    pub cost_ceiling: Option<f64>,
    #[serde(default)]
    pub cost_sensitive: bool,
    #[serde(default)]
    pub urgency: Urgency,
    #[serde(default)]
    pub rich_output: bool,
}

impl RouteRequest {
    /// Selection criteria carried by this request
    pub fn criteria(&self) -> SelectionCriteria {
        SelectionCriteria {
            task_type: self.task_type,
            complexity: self.complexity,
            preferred_backend: self.preferred_backend.clone(),
            cost_ceiling: self.cost_ceiling,
            cost_sensitive: self.cost_sensitive,
            urgency: self.urgency,
            tier: self.tier.clone(),
            rich_output: self.rich_output,
        }
    }
}

/// One reply line
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RouteReply {
    /// Routed successfully
    Ok {
        id: Option<serde_json::Value>,
        #[serde(flatten)]
        outcome: Box<RouteOutcome>,
    },
    /// Request failed
    Error {
        id: Option<serde_json::Value>,
        /// Stable error kind, e.g. `all_backends_exhausted`
        kind: String,
        message: String,
    },
}

impl RouteReply {
    fn failed(id: Option<serde_json::Value>, error: &RouteError) -> Self {
        Self::Error {
            id,
            kind: error.kind().to_string(),
            message: error.to_string(),
        }
    }

    fn malformed(error: &serde_json::Error) -> Self {
        Self::Error {
            id: None,
            kind: "invalid_request".to_string(),
            message: error.to_string(),
        }
    }
}

/// Route one request line
pub async fn handle_line(router: &Router, line: &str) -> RouteReply {
    let request: RouteRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "Rejecting malformed request line");
            return RouteReply::malformed(&e);
        }
    };

    debug!(user = %request.user_id, task = %request.task_type, "Routing request");
    match router
        .route(&request.prompt, &request.criteria(), &request.user_id)
        .await
    {
        Ok(outcome) => RouteReply::Ok {
            id: request.id,
            outcome: Box::new(outcome),
        },
        Err(e) => RouteReply::failed(request.id, &e),
    }
}

// ============================================================================
// Router Assembly
// ============================================================================

/// HTTP adapters for every configured backend
///
/// # Errors
///
/// Fails if an HTTP client cannot be built.
pub fn build_adapters(config: &SwitchboardConfig) -> Result<HashMap<String, Arc<dyn Backend>>> {
    config
        .router
        .backends
        .iter()
        .map(|backend| {
            let endpoint = config.endpoint(&backend.id).unwrap_or(DEFAULT_ENDPOINT);
            let adapter = GenerateBackend::new(&backend.id, endpoint)
                .with_context(|| format!("Failed to build adapter for {}", backend.id))?
                .with_cost_per_unit(backend.cost_per_unit);
            Ok((backend.id.clone(), Arc::new(adapter) as Arc<dyn Backend>))
        })
        .collect()
}

/// Load, override and validate configuration
///
/// # Errors
///
/// Fails on unreadable, malformed or invalid configuration.
pub fn load(config_path: Option<PathBuf>, overrides: &ConfigOverrides) -> Result<SwitchboardConfig> {
    let mut config = load_config_from_path(config_path).context("Failed to load configuration")?;
    overrides.apply(&mut config);
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Build a router over `config`, with file-backed state under `data_dir`
///
/// # Errors
///
/// Fails if the stores cannot be opened or the router rejects the config.
pub async fn build_router(config: &SwitchboardConfig, data_dir: Option<&Path>) -> Result<Router> {
    let mut builder = Router::builder(config.router.clone()).backends(build_adapters(config)?);

    if let Some(dir) = data_dir {
        let store = FileKvStore::open(dir.join("state"))
            .await
            .with_context(|| format!("Failed to open state store in {}", dir.display()))?;
        let usage = FileUsageLog::open(dir.join("usage.jsonl"))
            .await
            .with_context(|| format!("Failed to open usage log in {}", dir.display()))?;
        builder = builder.kv_store(Arc::new(store)).usage_log(Arc::new(usage));
        info!(path = %dir.display(), "Using file-backed router state");
    }

    let router = builder.build().context("Failed to build router")?;
    router.restore().await?;
    Ok(router)
}

// ============================================================================
// Server
// ============================================================================

/// The main daemon server
pub struct DaemonServer {
    router: Arc<Router>,
    /// Optional configuration file path
    config_path: Option<PathBuf>,
    /// CLI overrides reapplied on reload
    overrides: ConfigOverrides,
}

impl DaemonServer {
    /// Create a new daemon server
    pub fn new(router: Arc<Router>, config_path: Option<PathBuf>, overrides: ConfigOverrides) -> Self {
        Self {
            router,
            config_path,
            overrides,
        }
    }

    /// Serve requests from `input` until EOF or shutdown
    ///
    /// # Errors
    ///
    /// Fails if reading input or writing output fails.
    pub async fn run<R, W>(
        &self,
        input: R,
        output: W,
        shutdown: Arc<AtomicBool>,
        reload_config: Arc<AtomicBool>,
    ) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (reply_tx, reply_rx) = mpsc::channel::<RouteReply>(REPLY_CAPACITY);
        let writer = tokio::spawn(write_replies(output, reply_rx));

        let mut lines = input.lines();
        let mut in_flight = tokio::task::JoinSet::new();

        loop {
            if shutdown.load(Ordering::SeqCst) {
                info!("Shutdown requested, stopping serve loop");
                break;
            }

            if reload_config.swap(false, Ordering::SeqCst) {
                info!("Config reload requested");
                if let Err(e) = self.reload_config() {
                    warn!(error = %format!("{e:#}"), "Config reload failed, keeping current config");
                }
            }

            // Timeout to allow checking the flags; next_line is cancel safe
            let line = match tokio::time::timeout(POLL_INTERVAL, lines.next_line()).await {
                Ok(Ok(Some(line))) => line,
                Ok(Ok(None)) => {
                    info!("Input closed");
                    break;
                }
                Ok(Err(e)) => return Err(e).context("Failed to read request"),
                Err(_) => continue,
            };

            if line.trim().is_empty() {
                continue;
            }

            let router = Arc::clone(&self.router);
            let reply_tx = reply_tx.clone();
            in_flight.spawn(async move {
                let reply = handle_line(&router, &line).await;
                if reply_tx.send(reply).await.is_err() {
                    warn!("Reply writer closed, dropping reply");
                }
            });

            // Reap finished tasks so the set does not grow unbounded
            while in_flight.try_join_next().is_some() {}
        }

        // Let accepted requests finish
        while in_flight.join_next().await.is_some() {}
        drop(reply_tx);

        writer.await.context("Reply writer panicked")?
    }

    /// Reload configuration from file
    fn reload_config(&self) -> Result<()> {
        let Some(config_path) = &self.config_path else {
            info!("No config file specified, skipping reload");
            return Ok(());
        };

        info!(path = ?config_path, "Reloading configuration");
        let config = load(Some(config_path.clone()), &self.overrides)?;
        let adapters = build_adapters(&config)?;
        let version = self
            .router
            .reload(config.router.backends, config.router.policy, adapters)?;

        info!(
            version = version,
            "Registry reloaded; other settings apply on restart"
        );
        Ok(())
    }
}

async fn write_replies<W>(mut output: W, mut replies: mpsc::Receiver<RouteReply>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(reply) = replies.recv().await {
        let mut line = serde_json::to_vec(&reply).context("Failed to encode reply")?;
        line.push(b'\n');
        output.write_all(&line).await.context("Failed to write reply")?;
        output.flush().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchboard_core::backend::BackendError;
    use switchboard_core::routing::test_utils::{backend_map, router_config, ScriptedBackend};
    use switchboard_core::BackendConfig;
    use tokio::io::BufReader;

    /// Router over `backends`, which must be named `b0`, `b1`, ... in priority order
    fn test_router(backends: &[Arc<ScriptedBackend>]) -> Arc<Router> {
        let configs = (0..backends.len())
            .map(|i| {
                BackendConfig::new(format!("b{i}"), "p", "m")
                    .with_priority(i32::try_from(i).unwrap())
            })
            .collect();
        Arc::new(
            Router::builder(router_config(configs))
                .backends(backend_map(backends))
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn test_request_defaults() {
        let request: RouteRequest = serde_json::from_str(r#"{"prompt":"hi"}"#).unwrap();
        assert_eq!(request.user_id, "anonymous");
        assert_eq!(request.task_type, TaskType::General);
        assert!(request.id.is_none());

        let criteria = request.criteria();
        assert_eq!(criteria.urgency, Urgency::Normal);
        assert!(criteria.tier.is_none());
    }

    #[test]
    fn test_request_full() {
        let request: RouteRequest = serde_json::from_str(
            r#"{"id":"r1","prompt":"hi","task_type":"code","complexity":"complex",
                "user_id":"u","tier":"tier2","urgency":"high","cost_sensitive":true}"#,
        )
        .unwrap();
        let criteria = request.criteria();
        assert_eq!(criteria.task_type, TaskType::Code);
        assert_eq!(criteria.complexity, Some(Complexity::Complex));
        assert_eq!(criteria.tier.as_deref(), Some("tier2"));
        assert_eq!(criteria.urgency, Urgency::High);
        assert!(criteria.cost_sensitive);
    }

    #[tokio::test]
    async fn test_handle_line_ok() {
        let router = test_router(&[Arc::new(ScriptedBackend::new("b0"))]);
        let reply = handle_line(&router, r#"{"id":7,"prompt":"hello"}"#).await;

        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["id"], 7);
        assert_eq!(json["decision"]["backend_id"], "b0");
    }

    #[tokio::test]
    async fn test_handle_line_errors() {
        let router = test_router(&[Arc::new(
            ScriptedBackend::new("b0").failing(BackendError::with_status(401, "bad key")),
        )]);

        let json = serde_json::to_value(handle_line(&router, r#"{"prompt":"hello"}"#).await).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["kind"], "backend_fatal");

        let json = serde_json::to_value(handle_line(&router, "not json").await).unwrap();
        assert_eq!(json["kind"], "invalid_request");
    }

    #[tokio::test]
    async fn test_run_serves_until_eof() {
        let router = test_router(&[Arc::new(ScriptedBackend::new("b0"))]);
        let server = DaemonServer::new(router, None, ConfigOverrides::new());

        let input = BufReader::new(&b"{\"id\":1,\"prompt\":\"a\"}\n\n{\"id\":2,\"prompt\":\"b\"}\n"[..]);
        let (client, mut sink) = tokio::io::duplex(64 * 1024);

        server
            .run(
                input,
                client,
                Arc::new(AtomicBool::new(false)),
                Arc::new(AtomicBool::new(false)),
            )
            .await
            .unwrap();

        let mut raw = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut sink, &mut raw)
            .await
            .unwrap();
        let mut ids: Vec<i64> = raw
            .lines()
            .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap()["id"].as_i64().unwrap())
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown_flag() {
        let router = test_router(&[Arc::new(ScriptedBackend::new("b0"))]);
        let server = DaemonServer::new(router, None, ConfigOverrides::new());
        let (_keep_open, reader) = tokio::io::duplex(64);

        server
            .run(
                BufReader::new(reader),
                tokio::io::sink(),
                Arc::new(AtomicBool::new(true)),
                Arc::new(AtomicBool::new(false)),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_reload_from_file() {
        use std::io::Write;

        let router = test_router(&[Arc::new(ScriptedBackend::new("b0"))]);
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(
            b"[[backends]]\nid = \"fresh\"\nprovider = \"local\"\nmodel = \"m\"\nendpoint = \"http://127.0.0.1:9\"\n",
        )
        .unwrap();

        let server = DaemonServer::new(
            Arc::clone(&router),
            Some(file.path().to_path_buf()),
            ConfigOverrides::new(),
        );
        server.reload_config().unwrap();

        assert!(router.registry().get("fresh").is_ok());
        assert!(router.registry().get("b0").is_err());
    }

    #[test]
    fn test_build_adapters_uses_default_endpoint() {
        let mut config = SwitchboardConfig::default();
        config.router.backends = vec![BackendConfig::new("local", "ollama", "llama3.2")];
        let adapters = build_adapters(&config).unwrap();
        assert_eq!(adapters["local"].id(), "local");
    }
}
