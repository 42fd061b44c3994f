//! Thin adapter over [`ResponseCache`] that memoizes a *complete* council
//! result keyed by the user's query.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::ResponseCache;
use crate::model_client::ChatMessage;

const SYNTHETIC_MODEL: &str = "council:complete";

/// The cached bundle: every stage's output plus metadata, enough to replay
/// a full set of streaming events without re-invoking any model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedCouncilResult {
    pub stage1: serde_json::Value,
    pub stage2: serde_json::Value,
    pub stage3: serde_json::Value,
    pub metadata: serde_json::Value,
    pub cached_at: DateTime<Utc>,
}

fn synthetic_messages(user_query: &str) -> Vec<ChatMessage> {
    vec![ChatMessage::user(user_query)]
}

pub struct QueryResultCache {
    cache: std::sync::Arc<ResponseCache>,
}

impl QueryResultCache {
    pub fn new(cache: std::sync::Arc<ResponseCache>) -> Self {
        QueryResultCache { cache }
    }

    pub async fn get(&self, user_query: &str) -> Option<CachedCouncilResult> {
        let raw = self.cache.get(SYNTHETIC_MODEL, &synthetic_messages(user_query)).await?;
        serde_json::from_str(&raw).ok()
    }

    pub async fn set(&self, user_query: &str, result: CachedCouncilResult) {
        if let Ok(raw) = serde_json::to_string(&result) {
            self.cache.set(SYNTHETIC_MODEL, &synthetic_messages(user_query), raw).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn round_trips_a_cached_result() {
        let backing = std::sync::Arc::new(ResponseCache::in_memory(Duration::from_secs(60)));
        let query_cache = QueryResultCache::new(backing);

        let result = CachedCouncilResult {
            stage1: serde_json::json!([{"node_id": "n1", "content": "Paris"}]),
            stage2: serde_json::json!([]),
            stage3: serde_json::json!(null),
            metadata: serde_json::json!({"models_used": 1}),
            cached_at: Utc::now(),
        };
        query_cache.set("what is the capital of france", result).await;

        let hit = query_cache.get("what is the capital of france").await;
        assert!(hit.is_some());
        assert_eq!(hit.unwrap().metadata["models_used"], 1);

        let miss = query_cache.get("a different query").await;
        assert!(miss.is_none());
    }
}
