//! Drives the three-stage council protocol: individual responses, peer
//! rankings, chairman synthesis.
//!
//! Stage 1 calls are serialized in execution order — the topological
//! constraint would permit parallel siblings, but serializing keeps event
//! interleaving deterministic for a streaming client, matching the
//! reference implementation's own choice.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::cache::ResponseCache;
use crate::catalog::{chairman_role_prompt, reasoning_pattern, role_prompt};
use crate::cost::CostAccountant;
use crate::error::CouncilError;
use crate::event::{CouncilEvent, EventSink, NodeState};
use crate::graph::{compile, validate_council_config, CompiledGraph, CouncilConfig};
use crate::model_client::{ChatMessage, ModelReply, TokenUsage};
use crate::persistence::{DecisionTreeEntry, DecisionType, ExecutionLogEntry, Store};
use crate::query_cache::{CachedCouncilResult, QueryResultCache};
use crate::ranking::{calculate_aggregate_rankings, parse_ranking_from_text, AggregateRanking};
use crate::resilience::{partial_response_policy, PartialResponseDecision, ResilienceLayer};

const DEFAULT_TEMPERATURE: f32 = 0.7;

/// One agent's validated Stage 1/3 output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseRecord {
    pub node_id: String,
    pub model_id: String,
    pub content: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub duration_ms: u64,
}

/// One evaluator's Stage 2 output: the parsed label sequence plus the raw text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankingRecord {
    pub evaluator_node_id: String,
    pub parsed_labels: Vec<String>,
    pub raw_text: String,
}

/// The full result of one execution, whether freshly computed or replayed
/// from the query-result cache.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub stage1: Vec<ResponseRecord>,
    pub label_mapping: Vec<(String, String)>,
    pub stage2: Vec<RankingRecord>,
    pub aggregate_rankings: Vec<AggregateRanking>,
    pub final_answer: Option<ResponseRecord>,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
    pub cache_hit: bool,
    pub terminal_error: Option<CouncilError>,
}

#[derive(Serialize, Deserialize)]
struct CachedReply {
    content: String,
    input_tokens: u64,
    output_tokens: u64,
    duration_ms: u64,
}

impl From<&ModelReply> for CachedReply {
    fn from(reply: &ModelReply) -> Self {
        CachedReply {
            content: reply.content.clone(),
            input_tokens: reply.usage.input_tokens,
            output_tokens: reply.usage.output_tokens,
            duration_ms: reply.duration.as_millis() as u64,
        }
    }
}

impl From<CachedReply> for ModelReply {
    fn from(cached: CachedReply) -> Self {
        ModelReply {
            content: cached.content,
            usage: TokenUsage {
                input_tokens: cached.input_tokens,
                output_tokens: cached.output_tokens,
            },
            duration: Duration::from_millis(cached.duration_ms),
        }
    }
}

pub struct StageOrchestrator {
    resilience: Arc<ResilienceLayer>,
    response_cache: Arc<ResponseCache>,
    query_cache: Arc<QueryResultCache>,
    cost: Arc<CostAccountant>,
    store: Arc<dyn Store>,
    response_timeout: Duration,
    quorum: usize,
}

impl StageOrchestrator {
    pub fn new(
        resilience: Arc<ResilienceLayer>,
        response_cache: Arc<ResponseCache>,
        query_cache: Arc<QueryResultCache>,
        cost: Arc<CostAccountant>,
        store: Arc<dyn Store>,
        response_timeout: Duration,
        quorum: usize,
    ) -> Self {
        StageOrchestrator {
            resilience,
            response_cache,
            query_cache,
            cost,
            store,
            response_timeout,
            quorum,
        }
    }

    /// Run one execution of `config` against `query`, streaming events to
    /// `events` and persisting logs via the injected store.
    pub async fn execute(
        &self,
        conversation_id: &str,
        query: &str,
        config: &CouncilConfig,
        use_query_cache: bool,
        events: &dyn EventSink,
    ) -> ExecutionOutcome {
        if let Err(err) = validate_council_config(config) {
            events
                .emit(CouncilEvent::Error {
                    conversation_id: conversation_id.to_string(),
                    node_id: None,
                    error: err.reason(),
                })
                .await;
            return self.terminal(err, false);
        }

        if use_query_cache {
            if let Some(cached) = self.query_cache.get(query).await {
                return self.replay_cached(conversation_id, cached, events).await;
            }
        }

        let compiled = compile(config);

        let stage1 = self
            .run_stage1(conversation_id, query, &compiled, events)
            .await;

        let valid_count = stage1.len();
        match partial_response_policy(valid_count, self.quorum) {
            PartialResponseDecision::Abort => {
                let err = if valid_count == 0 {
                    CouncilError::NoResponses
                } else {
                    CouncilError::InsufficientResponses { valid: valid_count }
                };
                events
                    .emit(CouncilEvent::Error {
                        conversation_id: conversation_id.to_string(),
                        node_id: None,
                        error: err.reason(),
                    })
                    .await;
                return self.terminal(err, false);
            }
            PartialResponseDecision::ProceedWithWarning => {
                log::warn!(
                    "conversation {conversation_id}: proceeding with {valid_count} of {} stage 1 responses",
                    compiled.execution_order.len()
                );
            }
            PartialResponseDecision::Proceed => {}
        }

        let label_mapping: Vec<(String, String)> = stage1
            .iter()
            .enumerate()
            .map(|(idx, record)| (label_for_index(idx), record.node_id.clone()))
            .collect();

        let (stage2, aggregate_rankings) = if stage1.len() >= 2 {
            events
                .emit(CouncilEvent::StageUpdate {
                    conversation_id: conversation_id.to_string(),
                    stage: 2,
                })
                .await;
            self.run_stage2(conversation_id, query, &stage1, &label_mapping, events)
                .await
        } else {
            (Vec::new(), Vec::new())
        };

        let final_answer = if compiled.chairman_id.is_some() {
            events
                .emit(CouncilEvent::StageUpdate {
                    conversation_id: conversation_id.to_string(),
                    stage: 3,
                })
                .await;
            self.run_stage3(conversation_id, query, &compiled, &stage1, events)
                .await
        } else {
            None
        };

        let total_tokens: u64 = stage1
            .iter()
            .chain(final_answer.iter())
            .map(|r| r.input_tokens + r.output_tokens)
            .sum();
        let total_cost_usd: f64 = stage1.iter().chain(final_answer.iter()).map(|r| r.cost_usd).sum();

        if use_query_cache {
            let bundle = CachedCouncilResult {
                stage1: serde_json::to_value(&stage1).unwrap_or_default(),
                stage2: serde_json::to_value(&stage2).unwrap_or_default(),
                stage3: serde_json::to_value(&final_answer).unwrap_or_default(),
                metadata: serde_json::json!({
                    "label_mapping": label_mapping,
                    "aggregate_rankings": aggregate_rankings_json(&aggregate_rankings),
                    "total_tokens": total_tokens,
                    "total_cost_usd": total_cost_usd,
                }),
                cached_at: Utc::now(),
            };
            self.query_cache.set(query, bundle).await;
        }

        self.store.append_decision(DecisionTreeEntry {
            conversation_id: conversation_id.to_string(),
            round_number: 1,
            parent_node_id: None,
            node_id: "execution".to_string(),
            decision_type: DecisionType::ExecutionComplete,
            decision_data: serde_json::json!({"total_tokens": total_tokens, "total_cost_usd": total_cost_usd}),
            timestamp: Utc::now(),
        });

        events
            .emit(CouncilEvent::Complete {
                conversation_id: conversation_id.to_string(),
                total_tokens,
                total_cost_usd,
                cache_hit: false,
            })
            .await;

        ExecutionOutcome {
            stage1,
            label_mapping,
            stage2,
            aggregate_rankings,
            final_answer,
            total_tokens,
            total_cost_usd,
            cache_hit: false,
            terminal_error: None,
        }
    }

    fn terminal(&self, error: CouncilError, cache_hit: bool) -> ExecutionOutcome {
        ExecutionOutcome {
            stage1: Vec::new(),
            label_mapping: Vec::new(),
            stage2: Vec::new(),
            aggregate_rankings: Vec::new(),
            final_answer: None,
            total_tokens: 0,
            total_cost_usd: 0.0,
            cache_hit,
            terminal_error: Some(error),
        }
    }

    async fn replay_cached(
        &self,
        conversation_id: &str,
        cached: CachedCouncilResult,
        events: &dyn EventSink,
    ) -> ExecutionOutcome {
        let stage1: Vec<ResponseRecord> = serde_json::from_value(cached.stage1).unwrap_or_default();
        let stage2: Vec<RankingRecord> = serde_json::from_value(cached.stage2).unwrap_or_default();
        let final_answer: Option<ResponseRecord> = serde_json::from_value(cached.stage3).unwrap_or(None);

        events
            .emit(CouncilEvent::StageUpdate {
                conversation_id: conversation_id.to_string(),
                stage: 1,
            })
            .await;
        for record in &stage1 {
            events
                .emit(CouncilEvent::Response {
                    conversation_id: conversation_id.to_string(),
                    node_id: record.node_id.clone(),
                    content: record.content.clone(),
                    input_tokens: record.input_tokens,
                    output_tokens: record.output_tokens,
                    cost_usd: 0.0,
                })
                .await;
        }
        if !stage2.is_empty() {
            events
                .emit(CouncilEvent::StageUpdate {
                    conversation_id: conversation_id.to_string(),
                    stage: 2,
                })
                .await;
            for ranking in &stage2 {
                events
                    .emit(CouncilEvent::Ranking {
                        conversation_id: conversation_id.to_string(),
                        node_id: ranking.evaluator_node_id.clone(),
                        rankings: ranking.parsed_labels.clone(),
                        reasoning: ranking.raw_text.clone(),
                    })
                    .await;
            }
        }
        events
            .emit(CouncilEvent::StageUpdate {
                conversation_id: conversation_id.to_string(),
                stage: 3,
            })
            .await;
        if let Some(final_record) = &final_answer {
            events
                .emit(CouncilEvent::FinalAnswer {
                    conversation_id: conversation_id.to_string(),
                    content: final_record.content.clone(),
                    input_tokens: final_record.input_tokens,
                    output_tokens: final_record.output_tokens,
                    cost_usd: 0.0,
                })
                .await;
        }
        events
            .emit(CouncilEvent::Complete {
                conversation_id: conversation_id.to_string(),
                total_tokens: 0,
                total_cost_usd: 0.0,
                cache_hit: true,
            })
            .await;

        let label_mapping: Vec<(String, String)> = cached
            .metadata
            .get("label_mapping")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();

        ExecutionOutcome {
            stage1,
            label_mapping,
            stage2,
            aggregate_rankings: Vec::new(),
            final_answer,
            total_tokens: 0,
            total_cost_usd: 0.0,
            cache_hit: true,
            terminal_error: None,
        }
    }

    async fn run_stage1(
        &self,
        conversation_id: &str,
        query: &str,
        compiled: &CompiledGraph,
        events: &dyn EventSink,
    ) -> Vec<ResponseRecord> {
        events
            .emit(CouncilEvent::StageUpdate {
                conversation_id: conversation_id.to_string(),
                stage: 1,
            })
            .await;

        let mut responses: HashMap<String, ResponseRecord> = HashMap::new();
        let mut records = Vec::new();

        for node_id in &compiled.execution_order {
            let node = compiled.nodes.get(node_id).expect("execution order references a known node");

            let upstream_context = compiled
                .incoming
                .get(node_id)
                .into_iter()
                .flatten()
                .filter_map(|producer_id| responses.get(producer_id))
                .map(|record| {
                    let producer = compiled.nodes.get(&record.node_id);
                    let display = producer.map(|n| n.display()).unwrap_or(&record.node_id);
                    format!("\n{display}'s response:\n{}\n", record.content)
                })
                .collect::<Vec<_>>()
                .join("");

            let pattern = node.reasoning_pattern_id.as_deref().and_then(reasoning_pattern);
            let base_prompt = node
                .user_override_prompt
                .clone()
                .unwrap_or_else(|| role_prompt(&node.role_id).to_string());
            let system_prompt = match pattern {
                Some(p) => format!("{base_prompt}{}", p.prompt_prefix),
                None => base_prompt,
            };
            let suffix = pattern.map(|p| p.prompt_suffix).unwrap_or("");
            let user_message = format!("{query}{suffix}{upstream_context}");

            let temperature = pattern
                .and_then(|p| p.temperature)
                .or(node.temperature)
                .unwrap_or(DEFAULT_TEMPERATURE);

            events
                .emit(CouncilEvent::NodeState {
                    conversation_id: conversation_id.to_string(),
                    node_id: node_id.clone(),
                    state: NodeState::Active,
                })
                .await;

            let estimate = self.cost.estimate(&[node.model_id.clone()], 1500);
            if !self.cost.can_proceed(estimate) {
                events
                    .emit(CouncilEvent::NodeState {
                        conversation_id: conversation_id.to_string(),
                        node_id: node_id.clone(),
                        state: NodeState::Error,
                    })
                    .await;
                events
                    .emit(CouncilEvent::Error {
                        conversation_id: conversation_id.to_string(),
                        node_id: Some(node_id.clone()),
                        error: CouncilError::BudgetExceeded {
                            remaining: self.cost.remaining(),
                        }
                        .reason(),
                    })
                    .await;
                continue;
            }

            let messages = vec![ChatMessage::system(system_prompt.clone()), ChatMessage::user(user_message.clone())];

            self.store.append_decision(DecisionTreeEntry {
                conversation_id: conversation_id.to_string(),
                round_number: 1,
                parent_node_id: None,
                node_id: node_id.clone(),
                decision_type: DecisionType::StageStart,
                decision_data: serde_json::json!({"stage": 1}),
                timestamp: Utc::now(),
            });

            match self
                .call_model(&node.model_id, &messages, Some(temperature), self.response_timeout)
                .await
            {
                Ok(reply) => {
                    let cost_usd = self.cost.record(&node.model_id, reply.usage.input_tokens, reply.usage.output_tokens);
                    let record = ResponseRecord {
                        node_id: node_id.clone(),
                        model_id: node.model_id.clone(),
                        content: reply.content.clone(),
                        input_tokens: reply.usage.input_tokens,
                        output_tokens: reply.usage.output_tokens,
                        cost_usd,
                        duration_ms: reply.duration.as_millis() as u64,
                    };

                    events
                        .emit(CouncilEvent::Response {
                            conversation_id: conversation_id.to_string(),
                            node_id: node_id.clone(),
                            content: record.content.clone(),
                            input_tokens: record.input_tokens,
                            output_tokens: record.output_tokens,
                            cost_usd: record.cost_usd,
                        })
                        .await;
                    events
                        .emit(CouncilEvent::NodeState {
                            conversation_id: conversation_id.to_string(),
                            node_id: node_id.clone(),
                            state: NodeState::Complete,
                        })
                        .await;

                    self.store.append_execution_log(ExecutionLogEntry {
                        conversation_id: conversation_id.to_string(),
                        round_number: 1,
                        stage: "stage1".to_string(),
                        node_id: node_id.clone(),
                        role_id: node.role_id.clone(),
                        model_id: node.model_id.clone(),
                        input_content: user_message,
                        output_content: record.content.clone(),
                        tokens_used: record.input_tokens + record.output_tokens,
                        cost_usd: record.cost_usd,
                        duration_ms: record.duration_ms,
                        timestamp: Utc::now(),
                    });
                    self.store.append_decision(DecisionTreeEntry {
                        conversation_id: conversation_id.to_string(),
                        round_number: 1,
                        parent_node_id: None,
                        node_id: node_id.clone(),
                        decision_type: DecisionType::ResponseGenerated,
                        decision_data: serde_json::json!({"tokens": record.input_tokens + record.output_tokens}),
                        timestamp: Utc::now(),
                    });

                    responses.insert(node_id.clone(), record.clone());
                    records.push(record);
                }
                Err(err) => {
                    log::error!("conversation {conversation_id}: node {node_id} failed stage 1: {err}");
                    events
                        .emit(CouncilEvent::NodeState {
                            conversation_id: conversation_id.to_string(),
                            node_id: node_id.clone(),
                            state: NodeState::Error,
                        })
                        .await;
                    events
                        .emit(CouncilEvent::Error {
                            conversation_id: conversation_id.to_string(),
                            node_id: Some(node_id.clone()),
                            error: err.reason(),
                        })
                        .await;
                    self.store.append_execution_log(ExecutionLogEntry {
                        conversation_id: conversation_id.to_string(),
                        round_number: 1,
                        stage: "stage1".to_string(),
                        node_id: node_id.clone(),
                        role_id: node.role_id.clone(),
                        model_id: node.model_id.clone(),
                        input_content: user_message,
                        output_content: err.reason(),
                        tokens_used: 0,
                        cost_usd: 0.0,
                        duration_ms: 0,
                        timestamp: Utc::now(),
                    });
                }
            }
        }

        records
    }

    async fn run_stage2(
        &self,
        conversation_id: &str,
        query: &str,
        stage1: &[ResponseRecord],
        label_mapping: &[(String, String)],
        events: &dyn EventSink,
    ) -> (Vec<RankingRecord>, Vec<AggregateRanking>) {
        let corpus = label_mapping
            .iter()
            .map(|(label, node_id)| {
                let content = stage1
                    .iter()
                    .find(|r| &r.node_id == node_id)
                    .map(|r| r.content.as_str())
                    .unwrap_or("");
                format!("{label}:\n{content}\n")
            })
            .collect::<Vec<_>>()
            .join("\n");

        let ranking_prompt = format!(
            "The original query was:\n{query}\n\nHere are the responses from the other participants:\n\n{corpus}\n\
             Rank the responses from best to worst. End your reply with a block in the exact form:\n\
             FINAL RANKING:\n1. Response X\n2. Response Y\n..."
        );

        let mut rankings = Vec::new();
        let mut parsed_lists = Vec::new();

        for (_, node_id) in label_mapping {
            let node_model = stage1.iter().find(|r| &r.node_id == node_id).map(|r| r.model_id.clone());
            let Some(model_id) = node_model else { continue };

            let messages = vec![
                ChatMessage::system("You are evaluating council responses for quality and ranking them."),
                ChatMessage::user(ranking_prompt.clone()),
            ];

            match self
                .call_model(&model_id, &messages, Some(0.3), self.response_timeout)
                .await
            {
                Ok(reply) => {
                    self.cost.record(&model_id, reply.usage.input_tokens, reply.usage.output_tokens);
                    let parsed = parse_ranking_from_text(&reply.content);
                    let mapped: Vec<String> = parsed
                        .iter()
                        .filter_map(|label| {
                            label_mapping
                                .iter()
                                .find(|(l, _)| l == label)
                                .map(|(_, nid)| nid.clone())
                        })
                        .collect();

                    events
                        .emit(CouncilEvent::Ranking {
                            conversation_id: conversation_id.to_string(),
                            node_id: node_id.clone(),
                            rankings: parsed.clone(),
                            reasoning: reply.content.clone(),
                        })
                        .await;

                    self.store.append_decision(DecisionTreeEntry {
                        conversation_id: conversation_id.to_string(),
                        round_number: 1,
                        parent_node_id: None,
                        node_id: node_id.clone(),
                        decision_type: DecisionType::RankingProvided,
                        decision_data: serde_json::json!({"rankings": parsed}),
                        timestamp: Utc::now(),
                    });

                    if !mapped.is_empty() {
                        parsed_lists.push(mapped);
                    }
                    rankings.push(RankingRecord {
                        evaluator_node_id: node_id.clone(),
                        parsed_labels: parsed,
                        raw_text: reply.content,
                    });
                }
                Err(err) => {
                    log::warn!("conversation {conversation_id}: node {node_id} failed stage 2 ranking: {err}");
                }
            }
        }

        let aggregate_rankings = calculate_aggregate_rankings(&parsed_lists);
        (rankings, aggregate_rankings)
    }

    async fn run_stage3(
        &self,
        conversation_id: &str,
        query: &str,
        compiled: &CompiledGraph,
        stage1: &[ResponseRecord],
        events: &dyn EventSink,
    ) -> Option<ResponseRecord> {
        let chairman_id = compiled.chairman_id.as_ref()?;
        let chairman = compiled.nodes.get(chairman_id)?;

        let incoming = compiled.incoming.get(chairman_id).cloned().unwrap_or_default();
        let contributing: Vec<&ResponseRecord> = if incoming.is_empty() {
            stage1.iter().collect()
        } else {
            stage1.iter().filter(|r| incoming.contains(&r.node_id)).collect()
        };

        let corpus = contributing
            .iter()
            .map(|r| {
                let display = compiled.nodes.get(&r.node_id).map(|n| n.display()).unwrap_or(&r.node_id);
                format!("{display}'s response:\n{}\n", r.content)
            })
            .collect::<Vec<_>>()
            .join("\n");

        let system_prompt = chairman
            .user_override_prompt
            .clone()
            .unwrap_or_else(|| chairman_role_prompt().to_string());
        let user_message = format!("Original query:\n{query}\n\nParticipant responses:\n\n{corpus}");
        let messages = vec![ChatMessage::system(system_prompt), ChatMessage::user(user_message.clone())];
        let temperature = chairman.temperature.unwrap_or(DEFAULT_TEMPERATURE);

        events
            .emit(CouncilEvent::NodeState {
                conversation_id: conversation_id.to_string(),
                node_id: chairman_id.clone(),
                state: NodeState::Active,
            })
            .await;

        match self
            .call_model(&chairman.model_id, &messages, Some(temperature), self.response_timeout)
            .await
        {
            Ok(reply) => {
                let cost_usd = self.cost.record(&chairman.model_id, reply.usage.input_tokens, reply.usage.output_tokens);
                let record = ResponseRecord {
                    node_id: chairman_id.clone(),
                    model_id: chairman.model_id.clone(),
                    content: reply.content.clone(),
                    input_tokens: reply.usage.input_tokens,
                    output_tokens: reply.usage.output_tokens,
                    cost_usd,
                    duration_ms: reply.duration.as_millis() as u64,
                };

                events
                    .emit(CouncilEvent::FinalAnswer {
                        conversation_id: conversation_id.to_string(),
                        content: record.content.clone(),
                        input_tokens: record.input_tokens,
                        output_tokens: record.output_tokens,
                        cost_usd: record.cost_usd,
                    })
                    .await;
                events
                    .emit(CouncilEvent::NodeState {
                        conversation_id: conversation_id.to_string(),
                        node_id: chairman_id.clone(),
                        state: NodeState::Complete,
                    })
                    .await;

                self.store.append_execution_log(ExecutionLogEntry {
                    conversation_id: conversation_id.to_string(),
                    round_number: 1,
                    stage: "stage3".to_string(),
                    node_id: chairman_id.clone(),
                    role_id: chairman.role_id.clone(),
                    model_id: chairman.model_id.clone(),
                    input_content: user_message,
                    output_content: record.content.clone(),
                    tokens_used: record.input_tokens + record.output_tokens,
                    cost_usd: record.cost_usd,
                    duration_ms: record.duration_ms,
                    timestamp: Utc::now(),
                });
                self.store.append_decision(DecisionTreeEntry {
                    conversation_id: conversation_id.to_string(),
                    round_number: 1,
                    parent_node_id: None,
                    node_id: chairman_id.clone(),
                    decision_type: DecisionType::FinalSynthesis,
                    decision_data: serde_json::json!({"tokens": record.input_tokens + record.output_tokens}),
                    timestamp: Utc::now(),
                });

                Some(record)
            }
            Err(err) => {
                log::error!("conversation {conversation_id}: chairman {chairman_id} failed stage 3: {err}");
                events
                    .emit(CouncilEvent::NodeState {
                        conversation_id: conversation_id.to_string(),
                        node_id: chairman_id.clone(),
                        state: NodeState::Error,
                    })
                    .await;
                events
                    .emit(CouncilEvent::Error {
                        conversation_id: conversation_id.to_string(),
                        node_id: Some(chairman_id.clone()),
                        error: err.reason(),
                    })
                    .await;
                None
            }
        }
    }

    async fn call_model(
        &self,
        model_id: &str,
        messages: &[ChatMessage],
        temperature: Option<f32>,
        timeout: Duration,
    ) -> Result<ModelReply, CouncilError> {
        if let Some(cached) = self.response_cache.get(model_id, messages).await {
            if let Ok(cached_reply) = serde_json::from_str::<CachedReply>(&cached) {
                return Ok(cached_reply.into());
            }
        }

        let reply = self.resilience.call_with_retry(model_id, messages, temperature, timeout).await?;

        if let Ok(json) = serde_json::to_string(&CachedReply::from(&reply)) {
            self.response_cache.set(model_id, messages, json).await;
        }

        Ok(reply)
    }
}

/// Spreadsheet-style base-26 letters: A, B, ..., Z, AA, AB, ..., so labels
/// stay a bijection with the node ids no matter how many participants a
/// council has.
fn label_for_index(idx: usize) -> String {
    let mut n = idx;
    let mut letters = Vec::new();
    loop {
        letters.push((b'A' + (n % 26) as u8) as char);
        if n < 26 {
            break;
        }
        n = n / 26 - 1;
    }
    letters.reverse();
    format!("Response {}", letters.into_iter().collect::<String>())
}

fn aggregate_rankings_json(aggregates: &[AggregateRanking]) -> serde_json::Value {
    serde_json::json!(aggregates
        .iter()
        .map(|a| serde_json::json!({
            "node_id": a.node_id,
            "mean_position": a.mean_position,
            "vote_count": a.vote_count,
        }))
        .collect::<Vec<_>>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::RecordingSink;
    use crate::graph::{AgentNode, Edge};
    use crate::model_client::ModelClient;
    use crate::persistence::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StaticClient {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ModelClient for StaticClient {
        async fn call(
            &self,
            model_id: &str,
            _messages: &[ChatMessage],
            _temperature: Option<f32>,
            _timeout: Duration,
        ) -> Result<ModelReply, CouncilError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ModelReply {
                content: format!("a substantive answer from {model_id} about the topic at hand"),
                usage: TokenUsage {
                    input_tokens: 50,
                    output_tokens: 50,
                },
                duration: Duration::from_millis(1),
            })
        }
    }

    fn node(id: &str, speaking_order: i64, is_chairman: bool) -> AgentNode {
        AgentNode {
            id: id.to_string(),
            model_id: format!("test/{id}"),
            role_id: "analyst".to_string(),
            reasoning_pattern_id: None,
            user_override_prompt: None,
            speaking_order,
            temperature: None,
            is_chairman,
            display_name: None,
        }
    }

    fn build_orchestrator(client: Arc<dyn ModelClient>) -> StageOrchestrator {
        let resilience = Arc::new(ResilienceLayer::new(client, 3, 0, Duration::from_millis(1), vec![]));
        let response_cache = Arc::new(ResponseCache::in_memory(Duration::from_secs(60)));
        let query_cache = Arc::new(QueryResultCache::new(Arc::clone(&response_cache)));
        let cost = Arc::new(CostAccountant::new(100.0));
        let store = Arc::new(MemoryStore::new());
        StageOrchestrator::new(resilience, response_cache, query_cache, cost, store, Duration::from_secs(5), 3)
    }

    #[tokio::test]
    async fn single_node_no_chairman_skips_stage2_and_stage3() {
        let client = Arc::new(StaticClient { calls: AtomicUsize::new(0) });
        let orchestrator = build_orchestrator(client);
        let config = CouncilConfig {
            name: "solo".to_string(),
            nodes: vec![node("a", 0, false)],
            edges: vec![],
        };
        let sink = RecordingSink::new();
        let outcome = orchestrator.execute("c1", "what is rust?", &config, false, &sink).await;

        assert!(outcome.terminal_error.is_none());
        assert_eq!(outcome.stage1.len(), 1);
        assert!(outcome.stage2.is_empty());
        assert!(outcome.final_answer.is_none());
    }

    #[tokio::test]
    async fn three_parallel_nodes_with_chairman_no_incoming_edges() {
        let client = Arc::new(StaticClient { calls: AtomicUsize::new(0) });
        let orchestrator = build_orchestrator(client);
        let config = CouncilConfig {
            name: "panel".to_string(),
            nodes: vec![
                node("a", 0, false),
                node("b", 1, false),
                node("c", 2, false),
                node("chair", 3, true),
            ],
            edges: vec![],
        };
        let sink = RecordingSink::new();
        let outcome = orchestrator.execute("c2", "debate the best sorting algorithm", &config, false, &sink).await;

        assert_eq!(outcome.stage1.len(), 3);
        assert_eq!(outcome.label_mapping.len(), 3);
        assert!(outcome.final_answer.is_some());
    }

    #[tokio::test]
    async fn chairman_with_specific_incoming_edges_only_sees_those_responses() {
        let client = Arc::new(StaticClient { calls: AtomicUsize::new(0) });
        let orchestrator = build_orchestrator(client);
        let config = CouncilConfig {
            name: "filtered".to_string(),
            nodes: vec![node("a", 0, false), node("b", 1, false), node("chair", 2, true)],
            edges: vec![Edge {
                source_id: "a".to_string(),
                target_id: "chair".to_string(),
            }],
        };
        let sink = RecordingSink::new();
        let outcome = orchestrator.execute("c3", "pick a database", &config, false, &sink).await;

        let final_answer = outcome.final_answer.expect("chairman should respond");
        assert!(final_answer.content.contains("test/chair"));
    }

    #[tokio::test]
    async fn repeat_query_is_served_from_query_cache() {
        let client = Arc::new(StaticClient { calls: AtomicUsize::new(0) });
        let orchestrator = build_orchestrator(client.clone());
        let config = CouncilConfig {
            name: "cached".to_string(),
            nodes: vec![node("a", 0, false), node("b", 1, false)],
            edges: vec![],
        };
        let sink = RecordingSink::new();
        let first = orchestrator.execute("c4", "what is caching?", &config, true, &sink).await;
        assert!(!first.cache_hit);

        let calls_after_first = client.calls.load(Ordering::SeqCst);
        let second = orchestrator.execute("c4", "what is caching?", &config, true, &sink).await;
        assert!(second.cache_hit);
        assert_eq!(client.calls.load(Ordering::SeqCst), calls_after_first);
    }

    #[tokio::test]
    async fn budget_exhaustion_stops_further_stage1_dispatch() {
        let client = Arc::new(StaticClient { calls: AtomicUsize::new(0) });
        let resilience = Arc::new(ResilienceLayer::new(client, 3, 0, Duration::from_millis(1), vec![]));
        let response_cache = Arc::new(ResponseCache::in_memory(Duration::from_secs(60)));
        let query_cache = Arc::new(QueryResultCache::new(Arc::clone(&response_cache)));
        let cost = Arc::new(CostAccountant::new(0.0));
        let store = Arc::new(MemoryStore::new());
        let orchestrator = StageOrchestrator::new(resilience, response_cache, query_cache, cost, store, Duration::from_secs(5), 3);

        let config = CouncilConfig {
            name: "broke".to_string(),
            nodes: vec![node("a", 0, false), node("b", 1, false)],
            edges: vec![],
        };
        let sink = RecordingSink::new();
        let outcome = orchestrator.execute("c5", "anything", &config, false, &sink).await;

        assert!(matches!(outcome.terminal_error, Some(CouncilError::NoResponses)));
    }

    struct FailThenSucceedClient {
        fail_models: Vec<String>,
    }

    #[async_trait]
    impl ModelClient for FailThenSucceedClient {
        async fn call(
            &self,
            model_id: &str,
            _messages: &[ChatMessage],
            _temperature: Option<f32>,
            _timeout: Duration,
        ) -> Result<ModelReply, CouncilError> {
            if self.fail_models.iter().any(|m| m == model_id) {
                Err(CouncilError::Unexpected {
                    detail: "simulated upstream failure".to_string(),
                })
            } else {
                Ok(ModelReply {
                    content: format!("a substantive answer from {model_id} about the topic"),
                    usage: TokenUsage {
                        input_tokens: 10,
                        output_tokens: 10,
                    },
                    duration: Duration::from_millis(1),
                })
            }
        }
    }

    #[tokio::test]
    async fn partial_stage1_failures_still_allow_stage2_with_remaining_labels() {
        let client = Arc::new(FailThenSucceedClient {
            fail_models: vec!["test/a".to_string()],
        });
        let orchestrator = build_orchestrator(client);
        let config = CouncilConfig {
            name: "partial".to_string(),
            nodes: vec![node("a", 0, false), node("b", 1, false), node("c", 2, false)],
            edges: vec![],
        };
        let sink = RecordingSink::new();
        let outcome = orchestrator.execute("c6", "compare options", &config, false, &sink).await;

        assert_eq!(outcome.stage1.len(), 2);
        assert_eq!(outcome.label_mapping.len(), 2);
        assert!(outcome.terminal_error.is_none());
    }

    #[test]
    fn label_for_index_stays_a_bijection_past_26_participants() {
        let labels: Vec<String> = (0..30).map(label_for_index).collect();
        assert_eq!(labels[0], "Response A");
        assert_eq!(labels[25], "Response Z");
        assert_eq!(labels[26], "Response AA");
        assert_eq!(labels[29], "Response AD");

        let unique: std::collections::HashSet<&String> = labels.iter().collect();
        assert_eq!(unique.len(), labels.len());
    }
}
