//! Logging setup
//!
//! `RUST_LOG` wins when set; otherwise both switchboard crates log at the
//! requested level.

/// Install the global `tracing` subscriber
///
/// Safe to call more than once; later calls leave the first subscriber in place.
pub fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "switchboard_core={level},switchboard_daemon={level}"
        ))
    });

    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .try_init();

    if installed.is_err() {
        tracing::debug!("Logging already initialized");
    }
}
