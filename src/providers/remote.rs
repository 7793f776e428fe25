//! Remote completion backend — an OpenAI-style hosted chat-completions
//! API reached over HTTPS, with SSE token streaming.

use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::{CapabilityProvider, GenerateParams, ProviderError, TokenChunk, TokenStream};

/// Connect timeout applied to every request; the full-request deadline
/// is applied per call so streams are not killed mid-flight.
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Client for a hosted chat-completions API.
pub struct RemoteProvider {
    base_url: String,
    api_key: Option<String>,
    /// Model used for health probes when no caller model applies.
    default_model: String,
    client: reqwest::Client,
    timeout_secs: u64,
}

impl RemoteProvider {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        default_model: &str,
        timeout_secs: u64,
    ) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .expect("failed to create HTTP client");

        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            default_model: default_model.to_string(),
            client,
            timeout_secs,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn request(&self, body: &ChatCompletionRequest<'_>) -> reqwest::RequestBuilder {
        let mut builder = self.client.post(self.completions_url()).json(body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        builder
    }
}

// ── Wire types ──────────────────────────────────────────────

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    temperature: f32,
    stream: bool,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Outcome of decoding one SSE data payload.
#[derive(Debug, PartialEq)]
enum ChunkEvent {
    /// `[DONE]` sentinel — stream is over.
    Done,
    /// Token content, plus whether the backend flagged completion.
    Delta { content: String, finished: bool },
    /// Keepalive or metadata chunk with nothing to forward.
    Skip,
}

/// Decode one SSE `data:` payload from the completions stream.
fn decode_chunk(data: &str) -> Result<ChunkEvent, ProviderError> {
    if data == "[DONE]" {
        return Ok(ChunkEvent::Done);
    }

    let value: serde_json::Value = serde_json::from_str(data)
        .map_err(|e| ProviderError::ResponseParsing(format!("bad stream chunk: {e}")))?;

    if let Some(error) = value.get("error") {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("streaming error")
            .to_string();
        return Err(ProviderError::Http(message));
    }

    let chunk: StreamChunk = serde_json::from_value(value)
        .map_err(|e| ProviderError::ResponseParsing(format!("bad stream chunk: {e}")))?;

    match chunk.choices.into_iter().next() {
        None => Ok(ChunkEvent::Skip),
        Some(choice) => Ok(ChunkEvent::Delta {
            content: choice.delta.content.unwrap_or_default(),
            finished: choice.finish_reason.as_deref() == Some("stop"),
        }),
    }
}

// ── Provider impl ───────────────────────────────────────────

#[async_trait::async_trait]
impl CapabilityProvider for RemoteProvider {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        params: &GenerateParams,
    ) -> Result<String, ProviderError> {
        let body = ChatCompletionRequest {
            model,
            messages: vec![WireMessage {
                role: "user",
                content: prompt,
            }],
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            stream: false,
        };

        let response = self
            .request(&body)
            .timeout(std::time::Duration::from_secs(self.timeout_secs))
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(e, &self.base_url, self.timeout_secs))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::ResponseParsing(e.to_string()))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ProviderError::ResponseParsing("no choices in completion".into()))
    }

    async fn stream_generate(
        &self,
        model: &str,
        prompt: &str,
        params: &GenerateParams,
    ) -> Result<TokenStream, ProviderError> {
        let body = ChatCompletionRequest {
            model,
            messages: vec![WireMessage {
                role: "user",
                content: prompt,
            }],
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            stream: true,
        };

        let response = self
            .request(&body)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(e, &self.base_url, self.timeout_secs))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        let (tx, rx) = mpsc::channel::<Result<TokenChunk, ProviderError>>(32);
        tokio::spawn(async move {
            let mut events = response.bytes_stream().eventsource();
            while let Some(event) = events.next().await {
                let event = match event {
                    Ok(event) => event,
                    Err(e) => {
                        let _ = tx.send(Err(ProviderError::Http(e.to_string()))).await;
                        return;
                    }
                };

                match decode_chunk(&event.data) {
                    Ok(ChunkEvent::Done) => {
                        let _ = tx.send(Ok(TokenChunk::end())).await;
                        return;
                    }
                    Ok(ChunkEvent::Delta { content, finished }) => {
                        if !content.is_empty()
                            && tx.send(Ok(TokenChunk::text(content))).await.is_err()
                        {
                            // Receiver dropped — stop reading the connection.
                            return;
                        }
                        if finished {
                            let _ = tx.send(Ok(TokenChunk::end())).await;
                            return;
                        }
                    }
                    Ok(ChunkEvent::Skip) => {}
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                }
            }
            // Stream closed without a sentinel; still terminate cleanly.
            let _ = tx.send(Ok(TokenChunk::end())).await;
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn health_check(&self) -> bool {
        let model = self.default_model.clone();
        self.generate(&model, "health", &GenerateParams::warmup())
            .await
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructor_trims_trailing_slash() {
        let provider = RemoteProvider::new("https://api.example.com/v1/", None, "gpt-5-nano", 30);
        assert_eq!(provider.base_url(), "https://api.example.com/v1");
        assert_eq!(
            provider.completions_url(),
            "https://api.example.com/v1/chat/completions"
        );
    }

    #[test]
    fn request_body_serializes_openai_shape() {
        let body = ChatCompletionRequest {
            model: "gpt-5-nano",
            messages: vec![WireMessage {
                role: "user",
                content: "hello",
            }],
            max_tokens: Some(5),
            temperature: 0.1,
            stream: false,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["model"], "gpt-5-nano");
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(json["max_tokens"], 5);
        assert_eq!(json["stream"], false);
    }

    #[test]
    fn request_body_omits_unset_max_tokens() {
        let body = ChatCompletionRequest {
            model: "gpt-5-nano",
            messages: vec![],
            max_tokens: None,
            temperature: 0.7,
            stream: true,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("max_tokens").is_none());
    }

    #[test]
    fn decode_chunk_done_sentinel() {
        assert_eq!(decode_chunk("[DONE]").unwrap(), ChunkEvent::Done);
    }

    #[test]
    fn decode_chunk_delta_content() {
        let data = r#"{"id":"c1","object":"chat.completion.chunk","choices":[{"index":0,"delta":{"content":"Hel"},"finish_reason":null}]}"#;
        assert_eq!(
            decode_chunk(data).unwrap(),
            ChunkEvent::Delta {
                content: "Hel".into(),
                finished: false
            }
        );
    }

    #[test]
    fn decode_chunk_finish_reason_stop() {
        let data = r#"{"choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#;
        assert_eq!(
            decode_chunk(data).unwrap(),
            ChunkEvent::Delta {
                content: String::new(),
                finished: true
            }
        );
    }

    #[test]
    fn decode_chunk_empty_choices_is_skip() {
        let data = r#"{"choices":[]}"#;
        assert_eq!(decode_chunk(data).unwrap(), ChunkEvent::Skip);
    }

    #[test]
    fn decode_chunk_error_payload() {
        let data = r#"{"error":{"message":"model overloaded","type":"server_error"}}"#;
        let err = decode_chunk(data).unwrap_err();
        assert!(matches!(err, ProviderError::Http(msg) if msg == "model overloaded"));
    }

    #[test]
    fn decode_chunk_garbage_is_parse_error() {
        let err = decode_chunk("not json").unwrap_err();
        assert!(matches!(err, ProviderError::ResponseParsing(_)));
    }
}
