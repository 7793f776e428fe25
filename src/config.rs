//! Service configuration, read from the environment at startup.

use std::net::SocketAddr;
use std::time::Duration;

use crate::agents::RetryPromptMode;
use crate::session::EvictionPolicy;

pub const APP_NAME: &str = "Triagent";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP server binds to.
    pub bind_addr: SocketAddr,
    /// Remote completion API base URL (chat-completions style).
    pub remote_base_url: String,
    /// Key for the remote API. Absent means unauthenticated requests,
    /// which works against self-hosted compatible endpoints.
    pub remote_api_key: Option<String>,
    /// Concrete model behind the remote aliases.
    pub remote_model: String,
    /// Local model server base URL.
    pub local_base_url: String,
    /// Concrete model behind the bare local family name.
    pub local_model: String,
    /// Per-request deadline for non-streaming backend calls.
    pub request_timeout_secs: u64,
    /// Inbound API key. Absent disables auth (development mode).
    pub service_api_key: Option<String>,
    /// Session registry eviction knobs.
    pub eviction: EvictionPolicy,
    /// How agents prompt their single retry after a parse failure.
    pub retry_prompt: RetryPromptMode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8000".parse().expect("valid default bind addr"),
            remote_base_url: "https://api.openai.com/v1".to_string(),
            remote_api_key: None,
            remote_model: "gpt-5-nano".to_string(),
            local_base_url: "http://localhost:11434".to_string(),
            local_model: "medgemma:27b".to_string(),
            request_timeout_secs: 30,
            service_api_key: None,
            eviction: EvictionPolicy::default(),
            retry_prompt: RetryPromptMode::default(),
        }
    }
}

impl Config {
    /// Load configuration from the environment, falling back to the
    /// defaults above. Malformed values fall back too, with a warning.
    pub fn from_env() -> Self {
        let defaults = Config::default();
        Self {
            bind_addr: parse_env("BIND_ADDR", defaults.bind_addr),
            remote_base_url: env_or("REMOTE_BASE_URL", &defaults.remote_base_url),
            remote_api_key: std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty()),
            remote_model: env_or("REMOTE_MODEL", &defaults.remote_model),
            local_base_url: env_or("OLLAMA_BASE_URL", &defaults.local_base_url),
            local_model: env_or("OLLAMA_MODEL", &defaults.local_model),
            request_timeout_secs: parse_env("REQUEST_TIMEOUT", defaults.request_timeout_secs),
            service_api_key: std::env::var("SERVICE_API_KEY").ok().filter(|k| !k.is_empty()),
            eviction: EvictionPolicy {
                ttl: Duration::from_secs(parse_env("SESSION_TTL_SECS", 3600)),
                max_sessions: parse_env("MAX_SESSIONS", 1024),
            },
            retry_prompt: parse_env("RETRY_PROMPT", defaults.retry_prompt),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_env<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + std::fmt::Debug,
{
    match std::env::var(key) {
        Err(_) => default,
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(key, %raw, default = ?default, "unparseable env value, using default");
                default
            }
        },
    }
}

/// Default `RUST_LOG` filter when none is set.
pub fn default_log_filter() -> String {
    "info,triagent=debug".to_string()
}
