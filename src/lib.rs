pub mod agents;
pub mod api;
pub mod config;
pub mod models;
pub mod orchestrator;
pub mod providers;
pub mod router;
pub mod session;
pub mod stream;

use tracing_subscriber::EnvFilter;

/// Initialize tracing from `RUST_LOG`, with a sane default filter.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .init();
}
