//! Council data model and topological scheduling.
//!
//! A council is two flat collections — nodes and edges — addressed by
//! stable string ids, plus adjacency maps and an execution order computed
//! here. There are no owning back-references between nodes; the compiler is
//! the only place that understands graph shape.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::CouncilError;

/// One participant in a council.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentNode {
    pub id: String,
    pub model_id: String,
    pub role_id: String,
    #[serde(default)]
    pub reasoning_pattern_id: Option<String>,
    #[serde(default)]
    pub user_override_prompt: Option<String>,
    #[serde(default)]
    pub speaking_order: i64,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub is_chairman: bool,
    /// Display name used in upstream-context injection; falls back to `id`.
    #[serde(default)]
    pub display_name: Option<String>,
}

impl AgentNode {
    pub fn display(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.id)
    }
}

/// A directed edge `(source_id, target_id)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Edge {
    pub source_id: String,
    pub target_id: String,
}

/// A council configuration: a name, a set of nodes, a set of edges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouncilConfig {
    pub name: String,
    pub nodes: Vec<AgentNode>,
    pub edges: Vec<Edge>,
}

/// Validate the invariants in the data model: at most one chairman, no
/// self-loops, edges reference known nodes.
pub fn validate_council_config(config: &CouncilConfig) -> Result<(), CouncilError> {
    let chairman_count = config.nodes.iter().filter(|n| n.is_chairman).count();
    if chairman_count > 1 {
        return Err(CouncilError::InvalidCouncilConfig {
            detail: format!("council has {chairman_count} chairman nodes, at most 1 allowed"),
        });
    }
    let ids: HashSet<&str> = config.nodes.iter().map(|n| n.id.as_str()).collect();
    for edge in &config.edges {
        if edge.source_id == edge.target_id {
            return Err(CouncilError::InvalidCouncilConfig {
                detail: format!("self-loop on node '{}'", edge.source_id),
            });
        }
        if !ids.contains(edge.source_id.as_str()) || !ids.contains(edge.target_id.as_str()) {
            return Err(CouncilError::InvalidCouncilConfig {
                detail: format!(
                    "edge ({}, {}) references an unknown node",
                    edge.source_id, edge.target_id
                ),
            });
        }
    }
    Ok(())
}

/// The compiled output of [`compile`]: adjacency maps and the deterministic
/// participant execution order (chairman excluded).
pub struct CompiledGraph {
    pub nodes: HashMap<String, AgentNode>,
    pub incoming: HashMap<String, Vec<String>>,
    pub outgoing: HashMap<String, Vec<String>>,
    pub execution_order: Vec<String>,
    pub chairman_id: Option<String>,
}

/// Build the compiled graph for one council: adjacency, topological
/// execution order via Kahn's algorithm with a deterministic tiebreak, and
/// a topologically-oblivious fallback when a cycle is present.
pub fn compile(config: &CouncilConfig) -> CompiledGraph {
    let mut nodes: HashMap<String, AgentNode> = HashMap::new();
    let mut incoming: HashMap<String, Vec<String>> = HashMap::new();
    let mut outgoing: HashMap<String, Vec<String>> = HashMap::new();
    let mut chairman_id = None;

    for node in &config.nodes {
        if node.is_chairman {
            chairman_id = Some(node.id.clone());
        }
        nodes.insert(node.id.clone(), node.clone());
        incoming.entry(node.id.clone()).or_default();
        outgoing.entry(node.id.clone()).or_default();
    }

    // Duplicate edges collapse to one.
    let mut seen_edges: HashSet<(String, String)> = HashSet::new();
    for edge in &config.edges {
        if edge.source_id == edge.target_id {
            continue;
        }
        let key = (edge.source_id.clone(), edge.target_id.clone());
        if !seen_edges.insert(key) {
            continue;
        }
        outgoing.entry(edge.source_id.clone()).or_default().push(edge.target_id.clone());
        incoming.entry(edge.target_id.clone()).or_default().push(edge.source_id.clone());
    }

    let participant_ids: Vec<String> = config
        .nodes
        .iter()
        .filter(|n| Some(&n.id) != chairman_id.as_ref())
        .map(|n| n.id.clone())
        .collect();

    let execution_order = topological_order(&nodes, &incoming, &outgoing, &participant_ids);

    CompiledGraph {
        nodes,
        incoming,
        outgoing,
        execution_order,
        chairman_id,
    }
}

fn speaking_order_key<'a>(nodes: &'a HashMap<String, AgentNode>, id: &'a str) -> (i64, &'a str) {
    let order = nodes.get(id).map(|n| n.speaking_order).unwrap_or(0);
    (order, id)
}

fn topological_order(
    nodes: &HashMap<String, AgentNode>,
    incoming: &HashMap<String, Vec<String>>,
    outgoing: &HashMap<String, Vec<String>>,
    participant_ids: &[String],
) -> Vec<String> {
    let participant_set: HashSet<&str> = participant_ids.iter().map(|s| s.as_str()).collect();

    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    for id in participant_ids {
        let degree = incoming
            .get(id)
            .map(|preds| preds.iter().filter(|p| participant_set.contains(p.as_str())).count())
            .unwrap_or(0);
        in_degree.insert(id.as_str(), degree);
    }

    let mut ready: Vec<&str> = in_degree
        .iter()
        .filter(|(_, &deg)| deg == 0)
        .map(|(&id, _)| id)
        .collect();
    ready.sort_by_key(|id| speaking_order_key(nodes, id));

    let mut order = Vec::with_capacity(participant_ids.len());
    let mut remaining_in_degree = in_degree.clone();

    while !ready.is_empty() {
        ready.sort_by_key(|id| speaking_order_key(nodes, id));
        let next = ready.remove(0);
        order.push(next.to_string());

        if let Some(successors) = outgoing.get(next) {
            for succ in successors {
                if !participant_set.contains(succ.as_str()) {
                    continue;
                }
                if let Some(deg) = remaining_in_degree.get_mut(succ.as_str()) {
                    *deg -= 1;
                    if *deg == 0 {
                        ready.push(succ.as_str());
                    }
                }
            }
        }
    }

    if order.len() == participant_ids.len() {
        order
    } else {
        log::warn!("council graph contains a cycle; falling back to speaking-order scheduling");
        let mut fallback: Vec<String> = participant_ids.to_vec();
        fallback.sort_by(|a, b| speaking_order_key(nodes, a).cmp(&speaking_order_key(nodes, b)));
        fallback
    }
}
