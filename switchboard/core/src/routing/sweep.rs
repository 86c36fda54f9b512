//! Periodic Background Sweeps
//!
//! Health recomputation and cache expiry run as explicit scheduled tasks
//! with a start/stop lifecycle. A [`SweepHandle`] owns one spawned task; the
//! task ticks on a fixed period until `stop()` is called or the handle is
//! dropped.
//!
//! ```text
//!   spawn ──► [interval tick] ──► run pass ──► [tick] ──► ...
//!                  ▲                                     │
//!                  └────────── shutdown signal ──────────┘ ──► exit
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Handle to a running sweep task
#[derive(Debug)]
pub struct SweepHandle {
    name: &'static str,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl SweepHandle {
    /// Spawn a task that runs `pass` every `period`
    ///
    /// The first pass runs one period after spawning, not immediately.
    /// Must be called from within a tokio runtime.
    pub fn spawn<F, Fut>(name: &'static str, period: Duration, mut pass: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown, mut rx) = watch::channel(false);
        let period = period.max(Duration::from_millis(1));

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            tracing::info!(sweep = name, period_ms = period.as_millis() as u64, "Sweep started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => pass().await,
                    changed = rx.changed() => {
                        if changed.is_err() || *rx.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!(sweep = name, "Sweep stopped");
        });

        Self {
            name,
            shutdown,
            task: Some(task),
        }
    }

    /// Sweep name
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether the task is still running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Signal the task to stop and wait for it to exit
    pub async fn stop(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(sweep = self.name, error = %e, "Sweep task ended abnormally");
            }
        }
    }
}

impl Drop for SweepHandle {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}
