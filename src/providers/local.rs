//! Local model backend — a self-hosted Ollama-style server reached over
//! HTTP on the local network, streaming newline-delimited JSON.

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::{CapabilityProvider, GenerateParams, ProviderError, TokenChunk, TokenStream};

const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Client for a locally hosted model server.
pub struct LocalProvider {
    base_url: String,
    client: reqwest::Client,
    timeout_secs: u64,
}

impl LocalProvider {
    pub fn new(base_url: &str, timeout_secs: u64) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .expect("failed to create HTTP client");

        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            timeout_secs,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn generate_url(&self) -> String {
        format!("{}/api/generate", self.base_url)
    }

    fn tags_url(&self) -> String {
        format!("{}/api/tags", self.base_url)
    }
}

// ── Wire types ──────────────────────────────────────────────

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f32,
    /// Backend name for the max-token cap.
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

impl GenerateOptions {
    fn from_params(params: &GenerateParams) -> Self {
        Self {
            temperature: params.temperature,
            num_predict: params.max_tokens,
        }
    }
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

#[derive(Deserialize)]
struct StreamLine {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
}

/// Decode one newline-delimited JSON line from the generate stream.
/// Blank lines are skipped; malformed lines are a parse error.
fn decode_line(line: &str) -> Result<Option<TokenChunk>, ProviderError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let parsed: StreamLine = serde_json::from_str(line)
        .map_err(|e| ProviderError::ResponseParsing(format!("bad stream line: {e}")))?;
    Ok(Some(TokenChunk {
        content: parsed.response,
        done: parsed.done,
    }))
}

// ── Provider impl ───────────────────────────────────────────

#[async_trait::async_trait]
impl CapabilityProvider for LocalProvider {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        params: &GenerateParams,
    ) -> Result<String, ProviderError> {
        let body = GenerateRequest {
            model,
            prompt,
            stream: false,
            options: GenerateOptions::from_params(params),
        };

        let response = self
            .client
            .post(self.generate_url())
            .json(&body)
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

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::ResponseParsing(e.to_string()))?;

        Ok(parsed.response)
    }

    async fn stream_generate(
        &self,
        model: &str,
        prompt: &str,
        params: &GenerateParams,
    ) -> Result<TokenStream, ProviderError> {
        let body = GenerateRequest {
            model,
            prompt,
            stream: true,
            options: GenerateOptions::from_params(params),
        };

        let response = self
            .client
            .post(self.generate_url())
            .json(&body)
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
            let mut bytes = response.bytes_stream();
            let mut buffer = String::new();
            while let Some(piece) = bytes.next().await {
                let piece = match piece {
                    Ok(piece) => piece,
                    Err(e) => {
                        let _ = tx.send(Err(ProviderError::Http(e.to_string()))).await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&piece));

                while let Some(newline) = buffer.find('\n') {
                    let line: String = buffer.drain(..=newline).collect();
                    match decode_line(&line) {
                        Ok(None) => {}
                        Ok(Some(chunk)) => {
                            let done = chunk.done;
                            if tx.send(Ok(chunk)).await.is_err() {
                                // Receiver dropped — release the connection.
                                return;
                            }
                            if done {
                                return;
                            }
                        }
                        Err(e) => {
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                    }
                }
            }
            // Connection closed without a done line; terminate cleanly.
            let _ = tx.send(Ok(TokenChunk::end())).await;
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn health_check(&self) -> bool {
        match self.client.get(self.tags_url()).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructor_trims_trailing_slash() {
        let provider = LocalProvider::new("http://localhost:11434/", 300);
        assert_eq!(provider.base_url(), "http://localhost:11434");
        assert_eq!(
            provider.generate_url(),
            "http://localhost:11434/api/generate"
        );
        assert_eq!(provider.tags_url(), "http://localhost:11434/api/tags");
    }

    #[test]
    fn request_body_maps_max_tokens_to_num_predict() {
        let body = GenerateRequest {
            model: "medgemma:27b",
            prompt: "test",
            stream: false,
            options: GenerateOptions::from_params(&GenerateParams::deterministic(1000)),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["model"], "medgemma:27b");
        assert_eq!(json["options"]["num_predict"], 1000);
        assert_eq!(json["options"]["temperature"], 0.0);
    }

    #[test]
    fn request_body_omits_unset_num_predict() {
        let body = GenerateRequest {
            model: "medgemma:27b",
            prompt: "test",
            stream: true,
            options: GenerateOptions::from_params(&GenerateParams::default()),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert!(json["options"].get("num_predict").is_none());
    }

    #[test]
    fn decode_line_token() {
        let chunk = decode_line(r#"{"response": "Hel", "done": false}"#)
            .unwrap()
            .unwrap();
        assert_eq!(chunk.content, "Hel");
        assert!(!chunk.done);
    }

    #[test]
    fn decode_line_done_marker() {
        let chunk = decode_line(r#"{"response": "", "done": true}"#)
            .unwrap()
            .unwrap();
        assert!(chunk.done);
    }

    #[test]
    fn decode_line_blank_skipped() {
        assert!(decode_line("").unwrap().is_none());
        assert!(decode_line("   ").unwrap().is_none());
    }

    #[test]
    fn decode_line_garbage_errors() {
        let err = decode_line("not json").unwrap_err();
        assert!(matches!(err, ProviderError::ResponseParsing(_)));
    }
}
