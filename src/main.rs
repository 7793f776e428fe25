use std::sync::Arc;

use triagent::api::server::serve;
use triagent::api::types::ApiContext;
use triagent::config::{self, Config};
use triagent::orchestrator::Orchestrator;
use triagent::providers::{CapabilityProvider, LocalProvider, RemoteProvider};
use triagent::router::ModelRouter;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    triagent::init_tracing();

    let config = Config::from_env();
    tracing::info!(
        "{} starting v{} (remote: {}, local: {})",
        config::APP_NAME,
        config::APP_VERSION,
        config.remote_base_url,
        config.local_base_url,
    );
    if config.remote_api_key.is_none() {
        tracing::warn!("OPENAI_API_KEY not set, remote requests go unauthenticated");
    }

    let remote: Arc<dyn CapabilityProvider> = Arc::new(RemoteProvider::new(
        &config.remote_base_url,
        config.remote_api_key.clone(),
        &config.remote_model,
        config.request_timeout_secs,
    ));
    let local: Arc<dyn CapabilityProvider> = Arc::new(LocalProvider::new(
        &config.local_base_url,
        config.request_timeout_secs,
    ));

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&remote),
        Arc::clone(&local),
        &config.remote_model,
        &config.local_model,
        config.retry_prompt,
        config.eviction.clone(),
    ));
    let model_router = Arc::new(ModelRouter::new(
        Arc::clone(&remote),
        Arc::clone(&local),
        &config.remote_model,
        &config.local_model,
    ));

    // Startup warmup: overlap backend initialization with process start.
    // Failures are logged and swallowed; the server comes up regardless.
    orchestrator.warmup_all().await;

    let ctx = ApiContext::new(orchestrator, model_router, config.service_api_key.as_deref());
    serve(ctx, config.bind_addr).await
}
