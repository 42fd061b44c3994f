//! Append-only execution logging and the row-store abstraction.
//!
//! `Store` is the out-of-scope persistence collaborator named in the
//! purpose statement: a trait with one in-process implementation here,
//! not a durable backend. Constructed once at process startup and
//! injected into the orchestrator/session, never reached through a
//! global.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One of the five `stage_start`/`response_generated`/`ranking_provided`/
/// `final_synthesis`/`execution_complete` decision kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionType {
    StageStart,
    ResponseGenerated,
    RankingProvided,
    FinalSynthesis,
    ExecutionComplete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub conversation_id: String,
    pub round_number: u32,
    pub stage: String,
    pub node_id: String,
    pub role_id: String,
    pub model_id: String,
    pub input_content: String,
    pub output_content: String,
    pub tokens_used: u64,
    pub cost_usd: f64,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionTreeEntry {
    pub conversation_id: String,
    pub round_number: u32,
    pub parent_node_id: Option<String>,
    pub node_id: String,
    pub decision_type: DecisionType,
    pub decision_data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub id: String,
    pub query: String,
    pub config: serde_json::Value,
    pub responses: serde_json::Value,
    pub final_answer: Option<String>,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomRole {
    pub id: String,
    pub name: String,
    pub description: String,
    pub icon: String,
    pub prompt: String,
    pub created_at: DateTime<Utc>,
}

/// One row of the `settings(key pk, value, updated_at)` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingEntry {
    pub key: String,
    pub value: String,
    pub updated_at: DateTime<Utc>,
}

/// One row of the `cached_models(id pk, name, provider, tier, context_length,
/// pricing, cached_at)` table — the model catalog snapshot served by
/// `GET /api/models` between refreshes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedModelEntry {
    pub id: String,
    pub name: String,
    pub provider: String,
    pub tier: String,
    pub context_length: u64,
    pub pricing: serde_json::Value,
    pub cached_at: DateTime<Utc>,
}

/// One row of the `favourite_models(model_id pk, added_at)` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FavouriteModelEntry {
    pub model_id: String,
    pub added_at: DateTime<Utc>,
}

/// The row-store contract backing the tables in §6. One in-process
/// implementation is provided; a networked/durable backend would satisfy
/// the same trait.
pub trait Store: Send + Sync {
    fn append_execution_log(&self, entry: ExecutionLogEntry);
    fn append_decision(&self, entry: DecisionTreeEntry);
    fn save_conversation(&self, record: ConversationRecord);
    fn execution_logs(&self, conversation_id: &str, round_number: Option<u32>) -> Vec<ExecutionLogEntry>;
    fn decision_tree(&self, conversation_id: &str) -> Vec<DecisionTreeEntry>;
    fn history(&self, limit: usize) -> Vec<ConversationRecord>;
    fn custom_roles(&self) -> Vec<CustomRole>;
    fn save_custom_role(&self, role: CustomRole);
    fn get_setting(&self, key: &str) -> Option<String>;
    fn save_setting(&self, key: &str, value: &str);
    fn cached_models(&self) -> Vec<CachedModelEntry>;
    fn save_cached_models(&self, models: Vec<CachedModelEntry>);
    fn favourite_models(&self) -> Vec<FavouriteModelEntry>;
    fn add_favourite_model(&self, model_id: &str);
    fn remove_favourite_model(&self, model_id: &str);
}

#[derive(Default)]
struct MemoryStoreState {
    execution_logs: Vec<ExecutionLogEntry>,
    decisions: Vec<DecisionTreeEntry>,
    conversations: Vec<ConversationRecord>,
    custom_roles: Vec<CustomRole>,
    settings: std::collections::HashMap<String, SettingEntry>,
    cached_models: Vec<CachedModelEntry>,
    favourite_models: Vec<FavouriteModelEntry>,
}

/// Not durable across process restarts, matching the Non-goal on durable
/// distributed state (single process).
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryStoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn append_execution_log(&self, entry: ExecutionLogEntry) {
        self.state.lock().expect("store mutex poisoned").execution_logs.push(entry);
    }

    fn append_decision(&self, entry: DecisionTreeEntry) {
        self.state.lock().expect("store mutex poisoned").decisions.push(entry);
    }

    fn save_conversation(&self, record: ConversationRecord) {
        self.state.lock().expect("store mutex poisoned").conversations.push(record);
    }

    fn execution_logs(&self, conversation_id: &str, round_number: Option<u32>) -> Vec<ExecutionLogEntry> {
        self.state
            .lock()
            .expect("store mutex poisoned")
            .execution_logs
            .iter()
            .filter(|e| e.conversation_id == conversation_id)
            .filter(|e| round_number.map(|r| e.round_number == r).unwrap_or(true))
            .cloned()
            .collect()
    }

    fn decision_tree(&self, conversation_id: &str) -> Vec<DecisionTreeEntry> {
        self.state
            .lock()
            .expect("store mutex poisoned")
            .decisions
            .iter()
            .filter(|d| d.conversation_id == conversation_id)
            .cloned()
            .collect()
    }

    fn history(&self, limit: usize) -> Vec<ConversationRecord> {
        let state = self.state.lock().expect("store mutex poisoned");
        let start = state.conversations.len().saturating_sub(limit);
        state.conversations[start..].to_vec()
    }

    fn custom_roles(&self) -> Vec<CustomRole> {
        self.state.lock().expect("store mutex poisoned").custom_roles.clone()
    }

    fn save_custom_role(&self, role: CustomRole) {
        self.state.lock().expect("store mutex poisoned").custom_roles.push(role);
    }

    fn get_setting(&self, key: &str) -> Option<String> {
        self.state
            .lock()
            .expect("store mutex poisoned")
            .settings
            .get(key)
            .map(|entry| entry.value.clone())
    }

    fn save_setting(&self, key: &str, value: &str) {
        let mut state = self.state.lock().expect("store mutex poisoned");
        state.settings.insert(
            key.to_string(),
            SettingEntry {
                key: key.to_string(),
                value: value.to_string(),
                updated_at: Utc::now(),
            },
        );
    }

    fn cached_models(&self) -> Vec<CachedModelEntry> {
        self.state.lock().expect("store mutex poisoned").cached_models.clone()
    }

    fn save_cached_models(&self, models: Vec<CachedModelEntry>) {
        self.state.lock().expect("store mutex poisoned").cached_models = models;
    }

    fn favourite_models(&self) -> Vec<FavouriteModelEntry> {
        self.state.lock().expect("store mutex poisoned").favourite_models.clone()
    }

    fn add_favourite_model(&self, model_id: &str) {
        let mut state = self.state.lock().expect("store mutex poisoned");
        if !state.favourite_models.iter().any(|f| f.model_id == model_id) {
            state.favourite_models.push(FavouriteModelEntry {
                model_id: model_id.to_string(),
                added_at: Utc::now(),
            });
        }
    }

    fn remove_favourite_model(&self, model_id: &str) {
        self.state
            .lock()
            .expect("store mutex poisoned")
            .favourite_models
            .retain(|f| f.model_id != model_id);
    }
}
