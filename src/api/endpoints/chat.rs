//! Direct-model endpoints: chat completions and the model listing.
//!
//! The direct path bypasses the pipeline entirely: one resolved
//! provider call, streamed through the multiplexer or returned whole.

use std::convert::Infallible;

use axum::extract::State;
use axum::response::sse::{KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::StreamExt;
use serde::Serialize;

use crate::api::error::ApiError;
use crate::api::types::ApiContext;
use crate::models::{ChatMessage, ChatRequest};
use crate::providers::GenerateParams;
use crate::stream::{generation_id, sse_done, sse_event, StreamEvent};

#[derive(Serialize)]
pub struct CompletionResponse {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
}

#[derive(Serialize)]
pub struct CompletionChoice {
    pub index: u32,
    pub message: ChatMessage,
    pub finish_reason: &'static str,
}

/// `POST /v1/chat/completions` — direct single-model call, streaming or
/// not per the request flag.
pub async fn completions(
    State(ctx): State<ApiContext>,
    Json(req): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    if req.messages.is_empty() {
        return Err(ApiError::BadRequest("No messages provided".into()));
    }

    let route = ctx.model_router.resolve(&req.model)?;
    let prompt = req.to_prompt();
    let params = GenerateParams {
        max_tokens: req.max_tokens,
        temperature: req.temperature.unwrap_or(0.7),
    };

    if req.stream {
        let tokens = route
            .provider
            .stream_generate(&route.model, &prompt, &params)
            .await?;

        let id = generation_id();
        let model = route.model.clone();
        let events = tokens
            .map(move |chunk| {
                let event = match chunk {
                    Ok(chunk) if chunk.done => StreamEvent::token_stop(&id, &model),
                    Ok(chunk) => StreamEvent::token(&id, &model, chunk.content),
                    Err(err) => StreamEvent::error(err.kind(), err.to_string()),
                };
                Ok::<_, Infallible>(sse_event(&event))
            })
            .chain(futures_util::stream::iter([Ok(sse_done())]));

        Ok(Sse::new(events)
            .keep_alive(KeepAlive::default())
            .into_response())
    } else {
        let content = route
            .provider
            .generate(&route.model, &prompt, &params)
            .await?;

        Ok(Json(CompletionResponse {
            id: generation_id(),
            object: "completion",
            created: chrono::Utc::now().timestamp(),
            model: route.model,
            choices: vec![CompletionChoice {
                index: 0,
                message: ChatMessage {
                    role: "assistant".into(),
                    content,
                },
                finish_reason: "stop",
            }],
        })
        .into_response())
    }
}

#[derive(Serialize)]
pub struct ModelsResponse {
    pub data: Vec<ModelInfo>,
}

#[derive(Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub object: &'static str,
}

/// `GET /v1/models` — logical model names the router accepts.
pub async fn models(State(ctx): State<ApiContext>) -> Json<ModelsResponse> {
    let data = ctx
        .model_router
        .available_models()
        .into_iter()
        .map(|id| ModelInfo {
            id,
            object: "model",
        })
        .collect();
    Json(ModelsResponse { data })
}
