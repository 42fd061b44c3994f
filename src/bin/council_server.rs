//! Entrypoint for the HTTP/WebSocket council server.

use std::sync::Arc;
use std::time::Duration;

use council_engine::cache::ResponseCache;
use council_engine::config::Config;
use council_engine::cost::CostAccountant;
use council_engine::model_client::OpenRouterClient;
use council_engine::persistence::MemoryStore;
use council_engine::query_cache::QueryResultCache;
use council_engine::resilience::ResilienceLayer;
use council_engine::server::{build_router, AppState};
use council_engine::session::RateLimiter;
use council_engine::StageOrchestrator;

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = Config::from_env().unwrap_or_else(|err| {
        log::error!("invalid configuration: {err}");
        std::process::exit(1);
    });

    let model_client = Arc::new(OpenRouterClient::new(config.openrouter_api_key.clone()));
    let response_cache = Arc::new(ResponseCache::in_memory(Duration::from_secs(config.cache_ttl_seconds)));
    let query_cache = Arc::new(QueryResultCache::new(Arc::clone(&response_cache)));
    let cost = Arc::new(CostAccountant::new(config.budget_ceiling_usd));
    let store = Arc::new(MemoryStore::new());
    let resilience = Arc::new(ResilienceLayer::new(
        model_client.clone(),
        config.quorum,
        config.retry_attempts,
        Duration::from_secs_f64(config.retry_base_delay_secs),
        Vec::new(),
    ));
    let orchestrator = Arc::new(StageOrchestrator::new(
        resilience,
        Arc::clone(&response_cache),
        query_cache,
        Arc::clone(&cost),
        store.clone(),
        Duration::from_secs(config.response_timeout_secs),
        config.quorum,
    ));
    let rate_limiter = Arc::new(RateLimiter::new(
        config.max_concurrent_connections_per_client as u32,
        config.rate_limit_requests_per_window as u32,
        Duration::from_secs(config.rate_limit_window_secs),
        config.hourly_cost_ceiling_usd,
    ));

    let state = Arc::new(AppState {
        orchestrator,
        store,
        cost,
        rate_limiter,
        model_client,
        use_query_cache: true,
    });

    let app = build_router(state, &config.cors_origins);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|err| {
            log::error!("failed to bind {addr}: {err}");
            std::process::exit(1);
        });
    log::info!("council-engine listening on {addr}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await
    .unwrap_or_else(|err| log::error!("server exited: {err}"));
}
