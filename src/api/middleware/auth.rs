//! Bearer-key authentication middleware.
//!
//! Accepts the key as `Authorization: Bearer <key>` or `X-Api-Key`.
//! When no service key is configured, every request passes (development
//! mode, matching the service's historical behavior).

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::api::error::ApiError;
use crate::api::types::ApiContext;

/// Extract the presented API key from the request headers.
pub(crate) fn presented_key(req: &Request) -> Option<String> {
    if let Some(bearer) = req
        .headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        return Some(bearer.to_string());
    }
    req.headers()
        .get("X-Api-Key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Reject requests that fail key validation with a structured 401.
pub async fn require_key(
    State(ctx): State<ApiContext>,
    req: Request,
    next: Next,
) -> Response {
    let key = presented_key(&req);
    if !ctx.auth.validate(key.as_deref()) {
        return ApiError::Unauthorized.into_response();
    }
    next.run(req).await
}
