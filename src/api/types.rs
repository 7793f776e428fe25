//! Shared types for the API layer: request context, inbound key
//! validation, and the sliding-window rate limiter.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use subtle::ConstantTimeEq;

use crate::orchestrator::Orchestrator;
use crate::router::ModelRouter;

// ═══════════════════════════════════════════════════════════
// API context
// ═══════════════════════════════════════════════════════════

/// Shared state for all routes and middleware.
#[derive(Clone)]
pub struct ApiContext {
    pub orchestrator: Arc<Orchestrator>,
    pub model_router: Arc<ModelRouter>,
    pub auth: Arc<KeyValidator>,
    pub rate_limiter: Arc<Mutex<RateLimiter>>,
}

impl ApiContext {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        model_router: Arc<ModelRouter>,
        service_api_key: Option<&str>,
    ) -> Self {
        Self {
            orchestrator,
            model_router,
            auth: Arc::new(KeyValidator::new(service_api_key)),
            rate_limiter: Arc::new(Mutex::new(RateLimiter::new())),
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Inbound key validation
// ═══════════════════════════════════════════════════════════

/// Hash a bearer key with SHA-256.
pub fn hash_key(key: &str) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hasher.finalize().into()
}

/// Generate a random service key (URL-safe base64, 32 bytes of entropy).
pub fn generate_key() -> String {
    use base64::Engine;
    let bytes: [u8; 32] = rand::random();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Validates inbound bearer keys against the configured service key.
/// With no key configured, validation is disabled (development mode).
pub struct KeyValidator {
    key_hash: Option<[u8; 32]>,
}

impl KeyValidator {
    pub fn new(service_api_key: Option<&str>) -> Self {
        if service_api_key.is_none() {
            tracing::warn!("SERVICE_API_KEY not set, inbound auth disabled");
        }
        Self {
            key_hash: service_api_key.map(hash_key),
        }
    }

    pub fn enabled(&self) -> bool {
        self.key_hash.is_some()
    }

    /// Constant-time comparison against the configured key hash.
    pub fn validate(&self, presented: Option<&str>) -> bool {
        match (&self.key_hash, presented) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(expected), Some(key)) => {
                hash_key(key)[..].ct_eq(&expected[..]).into()
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Rate limiter
// ═══════════════════════════════════════════════════════════

/// Per-key sliding-window rate limiter: requests per minute and per
/// hour, matching the limits the service has always enforced.
pub struct RateLimiter {
    windows: HashMap<String, Vec<Instant>>,
    per_minute: u32,
    per_hour: u32,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            windows: HashMap::new(),
            per_minute: 20,
            per_hour: 100,
        }
    }

    #[cfg(test)]
    fn with_limits(per_minute: u32, per_hour: u32) -> Self {
        Self {
            windows: HashMap::new(),
            per_minute,
            per_hour,
        }
    }

    /// Check one request against the key's windows. Returns
    /// `Err(retry_after_secs)` when a limit is exceeded.
    pub fn check(&mut self, key: &str) -> Result<(), u64> {
        let now = Instant::now();
        let entries = self.windows.entry(key.to_string()).or_default();

        entries.retain(|ts| now.duration_since(*ts) < Duration::from_secs(3600));

        let last_minute = entries
            .iter()
            .filter(|ts| now.duration_since(**ts) < Duration::from_secs(60))
            .count() as u32;
        if last_minute >= self.per_minute {
            return Err(60);
        }
        if entries.len() as u32 >= self.per_hour {
            return Err(3600);
        }

        entries.push(now);
        Ok(())
    }

    /// Drop keys whose whole window has aged out.
    pub fn cleanup(&mut self) {
        let now = Instant::now();
        self.windows.retain(|_, entries| {
            entries.retain(|ts| now.duration_since(*ts) < Duration::from_secs(3600));
            !entries.is_empty()
        });
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
