//! Model router — maps a logical model name to the capability provider
//! that serves it plus the concrete backend model tag.
//!
//! Pure lookup, no state; safe to call concurrently from any number of
//! callers.

use std::sync::Arc;

use thiserror::Error;

use crate::providers::CapabilityProvider;

/// Errors from model resolution.
#[derive(Debug, Clone, Error)]
pub enum RouterError {
    #[error("unknown model: {0}")]
    UnknownModel(String),
}

/// A resolved route: the provider to call and the concrete model tag to
/// send to it.
#[derive(Clone)]
pub struct Route {
    pub provider: Arc<dyn CapabilityProvider>,
    pub model: String,
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

/// Aggregate health of both backends.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RouterHealth {
    pub remote: bool,
    pub local: bool,
}

impl RouterHealth {
    pub fn all_healthy(&self) -> bool {
        self.remote && self.local
    }
}

/// Routes logical model names to the two capability providers.
pub struct ModelRouter {
    remote: Arc<dyn CapabilityProvider>,
    local: Arc<dyn CapabilityProvider>,
    /// Concrete tag behind the remote aliases (`phraser`, `main`).
    remote_default: String,
    /// Concrete tag behind the bare local family name.
    local_default: String,
}

impl ModelRouter {
    pub fn new(
        remote: Arc<dyn CapabilityProvider>,
        local: Arc<dyn CapabilityProvider>,
        remote_default: &str,
        local_default: &str,
    ) -> Self {
        Self {
            remote,
            local,
            remote_default: remote_default.to_string(),
            local_default: local_default.to_string(),
        }
    }

    /// Resolve a logical model name. Normalization is case-insensitive;
    /// a bare family name maps to its default-tagged variant.
    pub fn resolve(&self, model: &str) -> Result<Route, RouterError> {
        let normalized = model.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "phraser" | "main" => Ok(Route {
                provider: Arc::clone(&self.remote),
                model: self.remote_default.clone(),
            }),
            name if name.starts_with("gpt-") => Ok(Route {
                provider: Arc::clone(&self.remote),
                model: name.to_string(),
            }),
            // Bare family name maps to the default-tagged variant
            "medgemma" | "consult" => Ok(Route {
                provider: Arc::clone(&self.local),
                model: self.local_default.clone(),
            }),
            name if name.starts_with("medgemma:") => Ok(Route {
                provider: Arc::clone(&self.local),
                model: name.to_string(),
            }),
            _ => Err(RouterError::UnknownModel(model.to_string())),
        }
    }

    /// Logical model names accepted by `resolve`.
    pub fn available_models(&self) -> Vec<String> {
        vec![
            "phraser".to_string(),
            "main".to_string(),
            self.remote_default.clone(),
            "medgemma".to_string(),
            self.local_default.clone(),
            "consult".to_string(),
        ]
    }

    /// Probe both backends.
    pub async fn health_check(&self) -> RouterHealth {
        let (remote, local) =
            tokio::join!(self.remote.health_check(), self.local.health_check());
        RouterHealth { remote, local }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::MockProvider;

    fn router() -> ModelRouter {
        ModelRouter::new(
            Arc::new(MockProvider::new("remote-reply")),
            Arc::new(MockProvider::new("local-reply")),
            "gpt-5-nano",
            "medgemma:27b",
        )
    }

    #[test]
    fn phraser_and_main_route_to_remote_default() {
        let router = router();
        for alias in ["phraser", "main"] {
            let route = router.resolve(alias).unwrap();
            assert_eq!(route.model, "gpt-5-nano");
        }
    }

    #[test]
    fn gpt_names_pass_through_to_remote() {
        let route = router().resolve("gpt-4").unwrap();
        assert_eq!(route.model, "gpt-4");
    }

    #[test]
    fn bare_family_name_gets_default_tag() {
        let route = router().resolve("medgemma").unwrap();
        assert_eq!(route.model, "medgemma:27b");
    }

    #[test]
    fn tagged_local_name_passes_through() {
        let route = router().resolve("medgemma:4b").unwrap();
        assert_eq!(route.model, "medgemma:4b");
    }

    #[test]
    fn consult_alias_routes_to_local_default() {
        let route = router().resolve("consult").unwrap();
        assert_eq!(route.model, "medgemma:27b");
    }

    #[test]
    fn resolution_is_case_insensitive() {
        let router = router();
        assert_eq!(router.resolve("MedGemma").unwrap().model, "medgemma:27b");
        assert_eq!(router.resolve("PHRASER").unwrap().model, "gpt-5-nano");
        assert_eq!(router.resolve("  main  ").unwrap().model, "gpt-5-nano");
    }

    #[test]
    fn unknown_model_is_an_error() {
        let err = router().resolve("llama3:8b").unwrap_err();
        assert!(matches!(err, RouterError::UnknownModel(name) if name == "llama3:8b"));
    }

    #[test]
    fn available_models_lists_all_routes() {
        let models = router().available_models();
        assert!(models.contains(&"phraser".to_string()));
        assert!(models.contains(&"medgemma:27b".to_string()));
        assert!(models.contains(&"consult".to_string()));
    }

    #[tokio::test]
    async fn health_check_probes_both_backends() {
        let router = ModelRouter::new(
            Arc::new(MockProvider::new("ok")),
            Arc::new(MockProvider::new("ok").unhealthy()),
            "gpt-5-nano",
            "medgemma:27b",
        );
        let health = router.health_check().await;
        assert!(health.remote);
        assert!(!health.local);
        assert!(!health.all_healthy());
    }

    #[tokio::test]
    async fn resolved_route_reaches_the_right_backend() {
        let router = router();
        let route = router.resolve("medgemma").unwrap();
        let reply = route
            .provider
            .generate(&route.model, "hi", &crate::providers::GenerateParams::default())
            .await
            .unwrap();
        assert_eq!(reply, "local-reply");
    }
}
