//! Server lifecycle: bind → serve → graceful shutdown.
//!
//! Also owns the periodic maintenance task that sweeps expired sessions
//! and aged-out rate-limit windows.

use std::net::SocketAddr;
use std::time::Duration;

use crate::api::router::api_router;
use crate::api::types::ApiContext;

/// How often expired sessions and stale rate windows are swept.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(300);

/// Bind and serve until ctrl-c. Spawns the maintenance sweeper for the
/// life of the server.
pub async fn serve(ctx: ApiContext, addr: SocketAddr) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!(%local_addr, "listening");

    let sweeper = tokio::spawn(maintenance_loop(ctx.clone()));

    let app = api_router(ctx);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.abort();
    tracing::info!("server stopped");
    Ok(())
}

async fn maintenance_loop(ctx: ApiContext) {
    let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
    interval.tick().await; // first tick fires immediately
    loop {
        interval.tick().await;
        let evicted = ctx.orchestrator.evict_expired_sessions();
        if evicted > 0 {
            tracing::info!(evicted, "swept expired sessions");
        }
        if let Ok(mut limiter) = ctx.rate_limiter.lock() {
            limiter.cleanup();
        }
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(%err, "failed to install ctrl-c handler");
    }
}
