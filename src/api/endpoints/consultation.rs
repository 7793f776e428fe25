//! Consultation pipeline endpoints: start, stream, answer, session
//! inspection, and additional provider recommendations.

use std::convert::Infallible;

use axum::extract::{Path, State};
use axum::response::sse::{KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::Serialize;

use crate::api::error::ApiError;
use crate::api::types::ApiContext;
use crate::models::{
    AnswerRequest, ConsultationRequest, MoreProvidersRequest, PipelinePosition, ProviderMatch,
};
use crate::orchestrator::SessionSnapshot;
use crate::stream::{sse_done, sse_event, StreamEvent};

#[derive(Serialize)]
pub struct StartResponse {
    pub session_id: String,
    pub status: &'static str,
    pub current_stage: &'static str,
}

/// Aggregated events for the non-streaming degraded mode: the same
/// payload shapes as the live stream, returned as one array.
#[derive(Serialize)]
pub struct AggregateResponse {
    pub session_id: String,
    pub status: PipelinePosition,
    pub events: Vec<StreamEvent>,
}

/// `POST /v1/consultation` — start the five-stage pipeline.
///
/// With `stream: true` the pipeline runs in the background and the
/// caller attaches via the stream endpoint. With `stream: false` the
/// full buffered event sequence comes back in this response.
pub async fn start(
    State(ctx): State<ApiContext>,
    Json(req): Json<ConsultationRequest>,
) -> Result<Response, ApiError> {
    if req.symptoms.trim().is_empty() {
        return Err(ApiError::BadRequest("Symptoms description is required".into()));
    }

    if req.stream {
        let session_id = ctx.orchestrator.start_streaming(req).await;
        Ok(Json(StartResponse {
            session_id,
            status: "processing",
            current_stage: "intake",
        })
        .into_response())
    } else {
        let (session_id, events) = ctx.orchestrator.start_buffered(req).await;
        let status = ctx
            .orchestrator
            .snapshot(&session_id)
            .await
            .map(|snapshot| snapshot.status)
            .unwrap_or(PipelinePosition::Failed);
        Ok(Json(AggregateResponse {
            session_id,
            status,
            events,
        })
        .into_response())
    }
}

/// `GET /v1/consultation/{session_id}/stream` — SSE of pipeline events.
/// Replays completed results for late subscribers, then follows live
/// progress until the terminal marker.
pub async fn stream(
    State(ctx): State<ApiContext>,
    Path(session_id): Path<String>,
) -> Result<Response, ApiError> {
    let events = ctx.orchestrator.stream(&session_id).await?;
    Ok(sse_response(events))
}

/// `POST /v1/consultation/answer` — answer a clarifying question and
/// resume. Responds in the mode the consultation was started in: a
/// resumed SSE stream, or the buffered events of the resumed run.
pub async fn answer(
    State(ctx): State<ApiContext>,
    Json(req): Json<AnswerRequest>,
) -> Result<Response, ApiError> {
    if req.answer.trim().is_empty() {
        return Err(ApiError::BadRequest("Answer is required".into()));
    }

    let snapshot = ctx.orchestrator.snapshot(&req.session_id).await?;
    if snapshot.stream {
        let events = ctx
            .orchestrator
            .resume_streaming(&req.session_id, &req.answer)
            .await?;
        Ok(sse_response(events))
    } else {
        let events = ctx
            .orchestrator
            .resume_buffered(&req.session_id, &req.answer)
            .await?;
        let status = ctx
            .orchestrator
            .snapshot(&req.session_id)
            .await
            .map(|snapshot| snapshot.status)
            .unwrap_or(PipelinePosition::Failed);
        Ok(Json(AggregateResponse {
            session_id: req.session_id,
            status,
            events,
        })
        .into_response())
    }
}

#[derive(Serialize)]
pub struct MoreProvidersResponse {
    pub session_id: String,
    pub additional_providers: Vec<ProviderMatch>,
}

/// `POST /v1/consultation/providers/more` — additional recommendations
/// beyond the consultation's original matches.
pub async fn more_providers(
    State(ctx): State<ApiContext>,
    Json(req): Json<MoreProvidersRequest>,
) -> Result<Json<MoreProvidersResponse>, ApiError> {
    let additional = ctx
        .orchestrator
        .more_providers(&req.session_id, req.count)
        .await?;
    Ok(Json(MoreProvidersResponse {
        session_id: req.session_id,
        additional_providers: additional,
    }))
}

/// `GET /v1/consultation/session/{session_id}` — session snapshot.
pub async fn session(
    State(ctx): State<ApiContext>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    Ok(Json(ctx.orchestrator.snapshot(&session_id).await?))
}

#[derive(Serialize)]
pub struct DeleteResponse {
    pub session_id: String,
    pub status: &'static str,
}

/// `DELETE /v1/consultation/session/{session_id}`.
pub async fn delete_session(
    State(ctx): State<ApiContext>,
    Path(session_id): Path<String>,
) -> Result<Json<DeleteResponse>, ApiError> {
    if !ctx.orchestrator.delete_session(&session_id) {
        return Err(ApiError::SessionNotFound(session_id));
    }
    Ok(Json(DeleteResponse {
        session_id,
        status: "deleted",
    }))
}

/// Frame an event stream as SSE terminated by `[DONE]`.
fn sse_response(events: BoxStream<'static, StreamEvent>) -> Response {
    let frames = events
        .map(|event| Ok::<_, Infallible>(sse_event(&event)))
        .chain(futures_util::stream::iter([Ok(sse_done())]));
    Sse::new(frames)
        .keep_alive(KeepAlive::default())
        .into_response()
}
