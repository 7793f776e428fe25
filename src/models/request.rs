//! Inbound request types for the consultation and direct-model endpoints.

use serde::{Deserialize, Serialize};

/// Patient demographic data attached to a consultation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatientData {
    #[serde(default)]
    pub age: Option<u32>,
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default)]
    pub weeks_pregnant: Option<u32>,
    #[serde(default)]
    pub pregnant: bool,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub insurance: Option<String>,
}

/// Request to start a consultation pipeline.
///
/// Immutable once accepted — the orchestrator stores it on the session
/// and never mutates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsultationRequest {
    /// Caller-supplied session identifier; generated when absent.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Free-text symptom narrative.
    pub symptoms: String,
    #[serde(default)]
    pub patient_data: Option<PatientData>,
    /// Incremental delivery requested. When false the caller gets the
    /// aggregated event list instead of a live stream.
    #[serde(default = "default_stream")]
    pub stream: bool,
}

fn default_stream() -> bool {
    true
}

/// Answer to a clarifying question from an AwaitingAnswer session.
#[derive(Debug, Clone, Deserialize)]
pub struct AnswerRequest {
    pub session_id: String,
    pub answer: String,
}

/// Request for additional provider recommendations after a completed
/// consultation.
#[derive(Debug, Clone, Deserialize)]
pub struct MoreProvidersRequest {
    pub session_id: String,
    #[serde(default = "default_provider_count")]
    pub count: usize,
}

fn default_provider_count() -> usize {
    3
}

/// One message of a direct chat-completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Direct single-model request (no pipeline).
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub stream: bool,
}

impl ChatRequest {
    /// Flatten the message list into a single prompt for the provider.
    /// System and history turns are kept as role-prefixed lines.
    pub fn to_prompt(&self) -> String {
        let mut lines = Vec::with_capacity(self.messages.len());
        for msg in &self.messages {
            match msg.role.as_str() {
                "user" => lines.push(msg.content.clone()),
                role => lines.push(format!("{role}: {}", msg.content)),
            }
        }
        lines.join("\n")
    }
}
