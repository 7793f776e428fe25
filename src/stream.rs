//! Streaming multiplexer — the single ordered outbound event sequence.
//!
//! Internal pipeline progress and direct-model token streams both leave
//! the process as `StreamEvent`s, framed as SSE `data:` lines terminated
//! by the `[DONE]` sentinel.
//!
//! The sink seam is the `EventSink` trait with two implementations:
//! `BroadcastSink` delivers incrementally; `BufferingSink` collects the
//! full sequence for environments that forbid incremental delivery.
//! Orchestrator code is identical in both modes — callers of the
//! buffered mode can tell only by the absence of intermediate delivery,
//! which is the documented degraded mode, not a bug.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::models::{StageName, StagePayload, StageStatus};

/// SSE sentinel closing every stream.
pub const DONE_SENTINEL: &str = "[DONE]";

// ═══════════════════════════════════════════════════════════
// Event types
// ═══════════════════════════════════════════════════════════

/// One pipeline stage transition as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageEvent {
    pub stage: StageName,
    pub status: StageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<StagePayload>,
    /// Clarifying question pausing the pipeline, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
}

/// One token increment from a direct model call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenDelta {
    pub id: String,
    pub object: String,
    pub model: String,
    pub delta: DeltaContent,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaContent {
    #[serde(default)]
    pub content: String,
}

/// Terminal success marker for a pipeline stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoneMarker {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Structured error event; never a raw stack trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub error: ErrorDetail,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: String,
    pub message: String,
}

/// The outbound event union. Serialized untagged so each variant keeps
/// its natural wire shape. Ordering within one consultation is total and
/// delivery-ordered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StreamEvent {
    Stage(StageEvent),
    Token(TokenDelta),
    Done(DoneMarker),
    Error(ErrorEvent),
}

impl StreamEvent {
    pub fn stage_in_progress(stage: StageName, message: impl Into<String>) -> Self {
        StreamEvent::Stage(StageEvent {
            stage,
            status: StageStatus::InProgress,
            message: Some(message.into()),
            result: None,
            question: None,
        })
    }

    /// Incremental partial result from a streaming-capable stage.
    pub fn stage_streaming(stage: StageName, partial: StagePayload) -> Self {
        StreamEvent::Stage(StageEvent {
            stage,
            status: StageStatus::InProgress,
            message: None,
            result: Some(partial),
            question: None,
        })
    }

    pub fn stage_completed(stage: StageName, result: StagePayload) -> Self {
        StreamEvent::Stage(StageEvent {
            stage,
            status: StageStatus::Completed,
            message: None,
            result: Some(result),
            question: None,
        })
    }

    pub fn stage_failed(stage: StageName, reason: impl Into<String>) -> Self {
        StreamEvent::Stage(StageEvent {
            stage,
            status: StageStatus::Failed,
            message: Some(reason.into()),
            result: None,
            question: None,
        })
    }

    pub fn stage_question(stage: StageName, question: impl Into<String>) -> Self {
        StreamEvent::Stage(StageEvent {
            stage,
            status: StageStatus::InProgress,
            message: Some("Need additional information".into()),
            result: None,
            question: Some(question.into()),
        })
    }

    pub fn done(session_id: impl Into<String>) -> Self {
        StreamEvent::Done(DoneMarker {
            status: "complete".into(),
            session_id: Some(session_id.into()),
        })
    }

    pub fn error(kind: impl Into<String>, message: impl Into<String>) -> Self {
        StreamEvent::Error(ErrorEvent {
            error: ErrorDetail {
                kind: kind.into(),
                message: message.into(),
            },
            session_id: None,
        })
    }

    pub fn error_for_session(
        kind: impl Into<String>,
        message: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        StreamEvent::Error(ErrorEvent {
            error: ErrorDetail {
                kind: kind.into(),
                message: message.into(),
            },
            session_id: Some(session_id.into()),
        })
    }

    pub fn token(id: &str, model: &str, content: impl Into<String>) -> Self {
        StreamEvent::Token(TokenDelta {
            id: id.to_string(),
            object: "chunk".into(),
            model: model.to_string(),
            delta: DeltaContent {
                content: content.into(),
            },
            finish_reason: None,
        })
    }

    /// Final token event carrying `finish_reason: "stop"`.
    pub fn token_stop(id: &str, model: &str) -> Self {
        StreamEvent::Token(TokenDelta {
            id: id.to_string(),
            object: "chunk".into(),
            model: model.to_string(),
            delta: DeltaContent {
                content: String::new(),
            },
            finish_reason: Some("stop".into()),
        })
    }

    /// Whether this event terminates its stream.
    pub fn is_terminal(&self) -> bool {
        match self {
            StreamEvent::Done(_) | StreamEvent::Error(_) => true,
            StreamEvent::Token(delta) => delta.finish_reason.is_some(),
            StreamEvent::Stage(_) => false,
        }
    }
}

// ═══════════════════════════════════════════════════════════
// EventSink
// ═══════════════════════════════════════════════════════════

/// Where the orchestrator writes outbound events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: StreamEvent);
}

#[async_trait]
impl<T: EventSink + ?Sized> EventSink for Arc<T> {
    async fn emit(&self, event: StreamEvent) {
        (**self).emit(event).await;
    }
}

/// Fan one emit out to two sinks, in order. Used by the degraded mode
/// so buffered runs still feed any live subscriber.
pub struct TeeSink<A, B> {
    first: A,
    second: B,
}

impl<A: EventSink, B: EventSink> TeeSink<A, B> {
    pub fn new(first: A, second: B) -> Self {
        Self { first, second }
    }
}

#[async_trait]
impl<A: EventSink, B: EventSink> EventSink for TeeSink<A, B> {
    async fn emit(&self, event: StreamEvent) {
        self.first.emit(event.clone()).await;
        self.second.emit(event).await;
    }
}

/// Incremental delivery through a broadcast channel. Lost-subscriber
/// errors are ignored: the pipeline keeps running with nobody watching.
pub struct BroadcastSink {
    tx: broadcast::Sender<StreamEvent>,
}

impl BroadcastSink {
    pub fn new(tx: broadcast::Sender<StreamEvent>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl EventSink for BroadcastSink {
    async fn emit(&self, event: StreamEvent) {
        let _ = self.tx.send(event);
    }
}

/// Degraded-mode collector: buffers the whole sequence and hands it back
/// as one aggregate.
#[derive(Default)]
pub struct BufferingSink {
    events: tokio::sync::Mutex<Vec<StreamEvent>>,
}

impl BufferingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// The collected sequence, in emission order.
    pub async fn drain(&self) -> Vec<StreamEvent> {
        std::mem::take(&mut *self.events.lock().await)
    }
}

#[async_trait]
impl EventSink for BufferingSink {
    async fn emit(&self, event: StreamEvent) {
        self.events.lock().await.push(event);
    }
}

// ═══════════════════════════════════════════════════════════
// SSE framing
// ═══════════════════════════════════════════════════════════

/// Pass events through until (and including) the first terminal one,
/// then end the stream. Keeps SSE connections from outliving their
/// consultation.
pub fn take_through_terminal<S>(stream: S) -> impl futures_util::Stream<Item = StreamEvent>
where
    S: futures_util::Stream<Item = StreamEvent>,
{
    use futures_util::StreamExt;
    let mut terminated = false;
    stream.take_while(move |event| {
        let keep = !terminated;
        if event.is_terminal() {
            terminated = true;
        }
        futures_util::future::ready(keep)
    })
}

/// Frame one event as an SSE `data:` line.
pub fn sse_event(event: &StreamEvent) -> axum::response::sse::Event {
    let payload = serde_json::to_string(event).unwrap_or_else(|e| {
        format!(r#"{{"error":{{"kind":"serialization","message":"{e}"}}}}"#)
    });
    axum::response::sse::Event::default().data(payload)
}

/// The closing `data: [DONE]` frame.
pub fn sse_done() -> axum::response::sse::Event {
    axum::response::sse::Event::default().data(DONE_SENTINEL)
}

/// Fresh id for a direct-model stream.
pub fn generation_id() -> String {
    format!("gen-{}", uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SymptomReport;

    #[test]
    fn stage_event_wire_shape() {
        let event = StreamEvent::stage_completed(
            StageName::Intake,
            StagePayload::Symptoms(SymptomReport {
                symptoms: vec!["headache".into()],
                pregnancy_related: false,
            }),
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["stage"], "intake");
        assert_eq!(json["status"], "completed");
        assert_eq!(json["result"]["symptoms"][0], "headache");
        assert!(json.get("message").is_none());
        assert!(json.get("question").is_none());
    }

    #[test]
    fn token_delta_wire_shape() {
        let event = StreamEvent::token("gen-1", "gpt-5-nano", "Hel");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["id"], "gen-1");
        assert_eq!(json["object"], "chunk");
        assert_eq!(json["model"], "gpt-5-nano");
        assert_eq!(json["delta"]["content"], "Hel");
        assert_eq!(json["finish_reason"], serde_json::Value::Null);
    }

    #[test]
    fn done_marker_wire_shape() {
        let event = StreamEvent::done("session-1");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["status"], "complete");
        assert_eq!(json["session_id"], "session-1");
    }

    #[test]
    fn error_event_wire_shape() {
        let event = StreamEvent::error("upstream_error", "backend returned 502");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["error"]["kind"], "upstream_error");
        assert_eq!(json["error"]["message"], "backend returned 502");
    }

    #[test]
    fn events_round_trip_untagged() {
        let events = vec![
            StreamEvent::stage_in_progress(StageName::Icd, "Analyzing diagnostic codes..."),
            StreamEvent::token("gen-2", "gpt-5-nano", "hi"),
            StreamEvent::done("s"),
            StreamEvent::error("timeout", "request timed out after 30s"),
        ];
        for event in events {
            let json = serde_json::to_string(&event).unwrap();
            let back: StreamEvent = serde_json::from_str(&json).unwrap();
            assert_eq!(back, event);
        }
    }

    #[test]
    fn terminal_classification() {
        assert!(StreamEvent::done("s").is_terminal());
        assert!(StreamEvent::error("x", "y").is_terminal());
        assert!(StreamEvent::token_stop("g", "m").is_terminal());
        assert!(!StreamEvent::token("g", "m", "t").is_terminal());
        assert!(!StreamEvent::stage_in_progress(StageName::Cpt, "...").is_terminal());
    }

    #[tokio::test]
    async fn buffering_sink_collects_in_order() {
        let sink = BufferingSink::new();
        sink.emit(StreamEvent::stage_in_progress(StageName::Intake, "a"))
            .await;
        sink.emit(StreamEvent::done("s")).await;

        let events = sink.drain().await;
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], StreamEvent::Stage(_)));
        assert!(matches!(events[1], StreamEvent::Done(_)));
        assert!(sink.drain().await.is_empty());
    }

    #[tokio::test]
    async fn broadcast_sink_reaches_subscribers() {
        let (tx, mut rx) = broadcast::channel(8);
        let sink = BroadcastSink::new(tx);
        sink.emit(StreamEvent::done("s")).await;

        let received = rx.recv().await.unwrap();
        assert!(matches!(received, StreamEvent::Done(_)));
    }

    #[tokio::test]
    async fn broadcast_sink_without_subscribers_does_not_panic() {
        let (tx, _) = broadcast::channel(8);
        let sink = BroadcastSink::new(tx);
        sink.emit(StreamEvent::done("s")).await;
    }

    #[tokio::test]
    async fn tee_sink_fans_out_to_both_sinks() {
        let (tx, mut rx) = broadcast::channel(8);
        let buffer = Arc::new(BufferingSink::new());
        let tee = TeeSink::new(BroadcastSink::new(tx), Arc::clone(&buffer));

        tee.emit(StreamEvent::done("s")).await;

        assert!(matches!(rx.recv().await.unwrap(), StreamEvent::Done(_)));
        assert_eq!(buffer.drain().await.len(), 1);
    }

    #[test]
    fn generation_ids_are_unique() {
        assert_ne!(generation_id(), generation_id());
    }

    #[tokio::test]
    async fn take_through_terminal_includes_the_terminal_event() {
        use futures_util::StreamExt;
        let events = vec![
            StreamEvent::stage_in_progress(StageName::Intake, "a"),
            StreamEvent::done("s"),
            StreamEvent::stage_in_progress(StageName::Icd, "never delivered"),
        ];
        let collected: Vec<StreamEvent> =
            take_through_terminal(futures_util::stream::iter(events))
                .collect()
                .await;
        assert_eq!(collected.len(), 2);
        assert!(collected[1].is_terminal());
    }
}
