//! Capability providers — uniform async interface over the two model
//! backends: a remote completion API and a locally hosted model server.
//!
//! Both expose blocking (`generate`) and streaming (`stream_generate`)
//! generation plus an idempotent `warmup` whose failures are logged and
//! swallowed — warmup must never block real traffic.

pub mod local;
pub mod remote;

pub use local::LocalProvider;
pub use remote::RemoteProvider;

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use thiserror::Error;

// ═══════════════════════════════════════════════════════════
// Types
// ═══════════════════════════════════════════════════════════

/// Sampling parameters forwarded to the backend.
#[derive(Debug, Clone)]
pub struct GenerateParams {
    pub max_tokens: Option<u32>,
    pub temperature: f32,
}

impl Default for GenerateParams {
    fn default() -> Self {
        Self {
            max_tokens: None,
            temperature: 0.7,
        }
    }
}

impl GenerateParams {
    /// Minimal single-token request used for warmup probes.
    pub fn warmup() -> Self {
        Self {
            max_tokens: Some(1),
            temperature: 0.0,
        }
    }

    /// Deterministic structured-output params for coding agents.
    pub fn deterministic(max_tokens: u32) -> Self {
        Self {
            max_tokens: Some(max_tokens),
            temperature: 0.0,
        }
    }
}

/// One increment of a streaming generation. The chunk with `done` set is
/// the explicit end marker terminating the sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenChunk {
    pub content: String,
    pub done: bool,
}

impl TokenChunk {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            done: false,
        }
    }

    pub fn end() -> Self {
        Self {
            content: String::new(),
            done: true,
        }
    }
}

/// A finite stream of token chunks. Consumers must drain it fully or
/// drop it to release the underlying connection.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<TokenChunk, ProviderError>> + Send>>;

/// Errors from capability provider calls.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("backend unreachable at {0}")]
    Connection(String),

    #[error("backend returned error (status {status}): {body}")]
    Upstream { status: u16, body: String },

    #[error("request timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("transport error: {0}")]
    Http(String),

    #[error("malformed backend response: {0}")]
    ResponseParsing(String),
}

impl ProviderError {
    /// Classify a reqwest error against the backend it was sent to.
    pub(crate) fn from_reqwest(err: reqwest::Error, base_url: &str, timeout_secs: u64) -> Self {
        if err.is_connect() {
            ProviderError::Connection(base_url.to_string())
        } else if err.is_timeout() {
            ProviderError::Timeout { secs: timeout_secs }
        } else {
            ProviderError::Http(err.to_string())
        }
    }

    /// Stable error-kind string for structured wire errors.
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::Timeout { .. } => "timeout",
            ProviderError::Connection(_)
            | ProviderError::Upstream { .. }
            | ProviderError::Http(_)
            | ProviderError::ResponseParsing(_) => "upstream_error",
        }
    }
}

// ═══════════════════════════════════════════════════════════
// CapabilityProvider trait
// ═══════════════════════════════════════════════════════════

/// Uniform interface over a model backend.
#[async_trait]
pub trait CapabilityProvider: Send + Sync {
    /// Short backend name for logs and health reports.
    fn name(&self) -> &'static str;

    /// Generate the full completion, blocking until it is available.
    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        params: &GenerateParams,
    ) -> Result<String, ProviderError>;

    /// Generate as a lazy token stream terminated by an end-marker chunk.
    async fn stream_generate(
        &self,
        model: &str,
        prompt: &str,
        params: &GenerateParams,
    ) -> Result<TokenStream, ProviderError>;

    /// Force backend initialization with a minimal no-op generation.
    /// Idempotent; errors are logged and swallowed.
    async fn warmup(&self, model: &str) {
        if let Err(err) = self.generate(model, "test", &GenerateParams::warmup()).await {
            tracing::warn!(backend = self.name(), %err, "warmup failed");
        }
    }

    /// Cheap liveness probe. Never errors.
    async fn health_check(&self) -> bool;
}

// ═══════════════════════════════════════════════════════════
// MockProvider — scripted backend for tests
// ═══════════════════════════════════════════════════════════

/// Scripted provider for tests. Pops queued responses in order and falls
/// back to a default response once the script is exhausted.
pub struct MockProvider {
    default_response: String,
    script: std::sync::Mutex<std::collections::VecDeque<Result<String, ProviderError>>>,
    prompts: std::sync::Mutex<Vec<String>>,
    warmups: std::sync::atomic::AtomicUsize,
    delay: Option<std::time::Duration>,
    warmup_delay: Option<std::time::Duration>,
    healthy: bool,
}

impl MockProvider {
    pub fn new(default_response: &str) -> Self {
        Self {
            default_response: default_response.to_string(),
            script: std::sync::Mutex::new(std::collections::VecDeque::new()),
            prompts: std::sync::Mutex::new(Vec::new()),
            warmups: std::sync::atomic::AtomicUsize::new(0),
            delay: None,
            warmup_delay: None,
            healthy: true,
        }
    }

    /// Queue a scripted response, served before the default.
    pub fn push_response(&self, response: &str) {
        self.script
            .lock()
            .unwrap()
            .push_back(Ok(response.to_string()));
    }

    /// Queue a scripted error.
    pub fn push_error(&self, err: ProviderError) {
        self.script.lock().unwrap().push_back(Err(err));
    }

    /// Add an artificial per-generate delay.
    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Add an artificial warmup delay (for warmup-overlap tests).
    pub fn with_warmup_delay(mut self, delay: std::time::Duration) -> Self {
        self.warmup_delay = Some(delay);
        self
    }

    pub fn unhealthy(mut self) -> Self {
        self.healthy = false;
        self
    }

    /// Prompts received so far, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    pub fn warmup_count(&self) -> usize {
        self.warmups.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn next_response(&self, prompt: &str) -> Result<String, ProviderError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(self.default_response.clone()))
    }
}

#[async_trait]
impl CapabilityProvider for MockProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn generate(
        &self,
        _model: &str,
        prompt: &str,
        _params: &GenerateParams,
    ) -> Result<String, ProviderError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.next_response(prompt)
    }

    async fn stream_generate(
        &self,
        model: &str,
        prompt: &str,
        params: &GenerateParams,
    ) -> Result<TokenStream, ProviderError> {
        let full = self.generate(model, prompt, params).await?;
        let mut chunks: Vec<Result<TokenChunk, ProviderError>> = full
            .split_inclusive(' ')
            .map(|word| Ok(TokenChunk::text(word)))
            .collect();
        chunks.push(Ok(TokenChunk::end()));
        Ok(Box::pin(futures_util::stream::iter(chunks)))
    }

    async fn warmup(&self, _model: &str) {
        if let Some(delay) = self.warmup_delay {
            tokio::time::sleep(delay).await;
        }
        self.warmups
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }

    async fn health_check(&self) -> bool {
        self.healthy
    }
}
