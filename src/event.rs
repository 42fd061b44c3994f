//! Streaming execution events.
//!
//! Every frame serializes with a `type` discriminator and the session's
//! `conversationId`, matching the wire shape in §6. [`EventSink`] is the
//! dispatch seam: a streaming session implements it over a WebSocket
//! writer, while tests implement it over an in-memory `Vec`.

use async_trait::async_trait;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Idle,
    Active,
    Complete,
    Error,
}

/// One typed progress frame emitted during an execution.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CouncilEvent {
    StageUpdate {
        conversation_id: String,
        stage: u8,
    },
    NodeState {
        conversation_id: String,
        node_id: String,
        state: NodeState,
    },
    Response {
        conversation_id: String,
        node_id: String,
        content: String,
        input_tokens: u64,
        output_tokens: u64,
        cost_usd: f64,
    },
    Ranking {
        conversation_id: String,
        node_id: String,
        rankings: Vec<String>,
        reasoning: String,
    },
    FinalAnswer {
        conversation_id: String,
        content: String,
        input_tokens: u64,
        output_tokens: u64,
        cost_usd: f64,
    },
    Error {
        conversation_id: String,
        node_id: Option<String>,
        error: String,
    },
    Complete {
        conversation_id: String,
        total_tokens: u64,
        total_cost_usd: f64,
        cache_hit: bool,
    },
}

/// Destination for a stream of [`CouncilEvent`]s. Implemented by the
/// WebSocket session handler in [`crate::session`] and by test doubles.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: CouncilEvent);
}

/// An in-memory sink used by orchestrator tests to assert on event
/// ordering without a live connection.
#[derive(Default)]
pub struct RecordingSink {
    events: tokio::sync::Mutex<Vec<CouncilEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<CouncilEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn emit(&self, event: CouncilEvent) {
        self.events.lock().await.push(event);
    }
}
