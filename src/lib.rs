//! Council execution engine: graph-scheduled multi-model orchestration,
//! peer ranking, chairman synthesis, and a streaming event protocol.

pub mod cache;
pub mod catalog;
pub mod config;
pub mod cost;
pub mod error;
pub mod event;
pub mod graph;
pub mod model_client;
pub mod orchestrator;
pub mod persistence;
pub mod query_cache;
pub mod ranking;
pub mod resilience;
pub mod safety;
pub mod session;

#[cfg(feature = "server")]
pub mod server;

pub use error::CouncilError;
pub use event::{CouncilEvent, EventSink};
pub use graph::{AgentNode, CouncilConfig, Edge};
pub use model_client::{ChatMessage, ModelClient, ModelReply, OpenRouterClient};
pub use orchestrator::{ExecutionOutcome, ResponseRecord, StageOrchestrator};
