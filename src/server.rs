//! HTTP and WebSocket surface, gated behind the `server` feature. Routes
//! mirror the reference crate's axum adapter: small per-route handlers
//! reading from shared state behind `Arc`, JSON responses via `Json`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, Path, Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};

#[cfg(test)]
use crate::catalog::{reasoning_pattern as lookup_pattern, role_prompt};
use crate::cost::CostAccountant;
use crate::event::{CouncilEvent, EventSink};
use crate::graph::CouncilConfig;
use crate::model_client::ModelClient;
use crate::orchestrator::StageOrchestrator;
use crate::persistence::{CachedModelEntry, Store};
use crate::safety::sanitize_user_input;
use crate::session::{client_identity, RateLimiter};

pub struct AppState {
    pub orchestrator: Arc<StageOrchestrator>,
    pub store: Arc<dyn Store>,
    pub cost: Arc<CostAccountant>,
    pub rate_limiter: Arc<RateLimiter>,
    pub model_client: Arc<dyn ModelClient>,
    pub use_query_cache: bool,
}

pub fn build_router(state: Arc<AppState>, cors_origins: &[String]) -> Router {
    let cors = if cors_origins.is_empty() {
        CorsLayer::new().allow_origin(Any)
    } else {
        let origins: Vec<axum::http::HeaderValue> = cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new().allow_origin(origins)
    };

    Router::new()
        .route("/", get(liveness))
        .route("/api/models", get(list_models))
        .route("/api/roles", get(list_roles))
        .route("/api/patterns", get(list_patterns))
        .route("/api/history", get(history))
        .route("/api/logs/{conversation_id}", get(execution_logs))
        .route("/api/logs/{conversation_id}/decision-tree", get(decision_tree))
        .route("/ws/execute", get(ws_execute))
        .layer(cors)
        .with_state(state)
}

async fn liveness() -> impl IntoResponse {
    Json(json!({"status": "ok", "service": "council-engine"}))
}

const MODEL_CACHE_TTL_HOURS: i64 = 24;

#[derive(Deserialize)]
struct ModelsQuery {
    #[serde(default)]
    refresh: bool,
}

/// Served from the `cached_models` table unless the caller asks for a
/// refresh or the cache is older than 24h. The "refresh" here repopulates
/// the cache from the static built-in price table rather than a live
/// upstream catalog fetch (Model Client is a one-shot chat call only).
async fn list_models(State(state): State<Arc<AppState>>, Query(params): Query<ModelsQuery>) -> impl IntoResponse {
    let cached = state.store.cached_models();
    let stale = cached
        .iter()
        .map(|m| m.cached_at)
        .max()
        .map(|latest| Utc::now() - latest > chrono::Duration::hours(MODEL_CACHE_TTL_HOURS))
        .unwrap_or(true);

    if !params.refresh && !stale {
        return Json(json!({"models": cached}));
    }

    let refreshed: Vec<CachedModelEntry> = crate::cost::builtin_model_ids()
        .into_iter()
        .map(|id| CachedModelEntry {
            id: id.to_string(),
            name: id.to_string(),
            provider: id.split('/').next().unwrap_or(id).to_string(),
            tier: "standard".to_string(),
            context_length: 0,
            pricing: json!({}),
            cached_at: Utc::now(),
        })
        .collect();
    state.store.save_cached_models(refreshed.clone());
    Json(json!({"models": refreshed}))
}

async fn list_roles(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let custom = state.store.custom_roles();
    Json(json!({
        "builtin": ["analyst", "skeptic", "synthesizer", "chairman"],
        "custom": custom,
    }))
}

#[derive(Deserialize)]
struct PatternsQuery {
    #[serde(default)]
    category: Option<String>,
}

async fn list_patterns(Query(params): Query<PatternsQuery>) -> impl IntoResponse {
    let all = ["chain_of_thought", "devils_advocate", "concise"];
    let filtered: Vec<&str> = match params.category.as_deref() {
        Some(cat) => all.into_iter().filter(|p| *p == cat).collect(),
        None => all.to_vec(),
    };
    Json(json!({"patterns": filtered}))
}

#[derive(Deserialize)]
struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    limit: usize,
}

fn default_history_limit() -> usize {
    50
}

async fn history(State(state): State<Arc<AppState>>, Query(params): Query<HistoryQuery>) -> impl IntoResponse {
    Json(json!({"history": state.store.history(params.limit)}))
}

#[derive(Deserialize)]
struct LogsQuery {
    round_number: Option<u32>,
}

async fn execution_logs(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
    Query(params): Query<LogsQuery>,
) -> impl IntoResponse {
    Json(json!({"logs": state.store.execution_logs(&conversation_id, params.round_number)}))
}

async fn decision_tree(State(state): State<Arc<AppState>>, Path(conversation_id): Path<String>) -> impl IntoResponse {
    Json(json!({"decisions": state.store.decision_tree(&conversation_id)}))
}

async fn ws_execute(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let client_id = client_identity(&addr.ip().to_string());
    if let Err(err) = state.rate_limiter.acquire_connection(&client_id) {
        return (StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::TOO_MANY_REQUESTS), Json(json!({"error": err.reason()})))
            .into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state, client_id))
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InboundFrame {
    Execute { query: String, config: CouncilConfig },
}

struct WebSocketSink {
    sender: tokio::sync::Mutex<futures_channel_sender::Sender>,
}

mod futures_channel_sender {
    use axum::extract::ws::{Message, WebSocket};
    use futures_util::stream::SplitSink;
    use futures_util::SinkExt;

    pub struct Sender(pub SplitSink<WebSocket, Message>);

    impl Sender {
        pub async fn send_json(&mut self, value: &impl serde::Serialize) {
            if let Ok(text) = serde_json::to_string(value) {
                let _ = self.0.send(Message::Text(text.into())).await;
            }
        }
    }
}

#[async_trait::async_trait]
impl EventSink for WebSocketSink {
    async fn emit(&self, event: CouncilEvent) {
        let mut sender = self.sender.lock().await;
        sender.send_json(&event).await;
    }
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, client_id: String) {
    use futures_util::StreamExt;

    let (sink_half, mut stream_half) = socket.split();
    let sink = Arc::new(WebSocketSink {
        sender: tokio::sync::Mutex::new(futures_channel_sender::Sender(sink_half)),
    });

    while let Some(Ok(Message::Text(text))) = stream_half.next().await {
        if let Err(err) = state.rate_limiter.check_request(&client_id) {
            sink.emit(CouncilEvent::Error {
                conversation_id: String::new(),
                node_id: None,
                error: err.reason(),
            })
            .await;
            continue;
        }

        match serde_json::from_str::<InboundFrame>(&text) {
            Ok(InboundFrame::Execute { query, config }) => {
                let conversation_id = uuid::Uuid::new_v4().to_string();
                let sanitized = match sanitize_user_input(&query) {
                    Ok(clean) => clean,
                    Err(err) => {
                        sink.emit(CouncilEvent::Error {
                            conversation_id: conversation_id.clone(),
                            node_id: None,
                            error: err.reason(),
                        })
                        .await;
                        continue;
                    }
                };
                let outcome = state
                    .orchestrator
                    .execute(&conversation_id, &sanitized, &config, state.use_query_cache, sink.as_ref())
                    .await;
                state.rate_limiter.record_cost(&client_id, outcome.total_cost_usd);
            }
            Err(err) => {
                sink.emit(CouncilEvent::Error {
                    conversation_id: String::new(),
                    node_id: None,
                    error: format!("malformed request: {err}"),
                })
                .await;
            }
        }
    }

    state.rate_limiter.release_connection(&client_id);
}

pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_CATALOG_TIMEOUT: Duration = Duration::from_secs(30);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_and_pattern_lookups_do_not_panic() {
        assert!(!role_prompt("analyst").is_empty());
        assert!(lookup_pattern("chain_of_thought").is_some());
    }
}
