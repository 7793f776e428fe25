//! Router assembly: endpoint wiring plus the middleware stack.
//!
//! `/health` and `/warmup` are open for load balancers; everything under
//! `/v1` sits behind key validation and rate limiting.

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::api::endpoints::{chat, consultation, health};
use crate::api::middleware::{auth, rate};
use crate::api::types::ApiContext;

pub fn api_router(ctx: ApiContext) -> Router {
    let protected = Router::new()
        .route("/chat/completions", post(chat::completions))
        .route("/models", get(chat::models))
        .route("/consultation", post(consultation::start))
        .route(
            "/consultation/:session_id/stream",
            get(consultation::stream),
        )
        .route("/consultation/answer", post(consultation::answer))
        .route(
            "/consultation/providers/more",
            post(consultation::more_providers),
        )
        .route(
            "/consultation/session/:session_id",
            get(consultation::session).delete(consultation::delete_session),
        )
        // Outermost layer last: auth runs before rate limiting
        .layer(axum::middleware::from_fn_with_state(
            ctx.clone(),
            rate::limit,
        ))
        .layer(axum::middleware::from_fn_with_state(
            ctx.clone(),
            auth::require_key,
        ));

    Router::new()
        .route("/health", get(health::health))
        .route("/warmup", get(health::warmup))
        .nest("/v1", protected)
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}
