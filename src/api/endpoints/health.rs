//! Health and warmup endpoints for load balancers. Unauthenticated.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::api::types::ApiContext;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: String,
    pub services: ServiceHealth,
    pub active_sessions: usize,
}

#[derive(Serialize)]
pub struct ServiceHealth {
    pub remote: &'static str,
    pub local: &'static str,
}

fn label(healthy: bool) -> &'static str {
    if healthy {
        "healthy"
    } else {
        "unhealthy"
    }
}

/// `GET /health` — probes both backends.
pub async fn health(State(ctx): State<ApiContext>) -> Json<HealthResponse> {
    let backends = ctx.model_router.health_check().await;
    Json(HealthResponse {
        status: label(backends.all_healthy()),
        timestamp: chrono::Utc::now().to_rfc3339(),
        services: ServiceHealth {
            remote: label(backends.remote),
            local: label(backends.local),
        },
        active_sessions: ctx.orchestrator.session_count(),
    })
}

#[derive(Serialize)]
pub struct WarmupResponse {
    pub status: &'static str,
    pub timestamp: String,
}

/// `GET /warmup` — manual warmup trigger. Warmup failures are swallowed
/// by the providers, so this always reports success.
pub async fn warmup(State(ctx): State<ApiContext>) -> Json<WarmupResponse> {
    ctx.orchestrator.warmup_all().await;
    Json(WarmupResponse {
        status: "warmed_up",
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}
