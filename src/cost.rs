//! Budget tracking and the query-complexity model tier selector.

use std::collections::HashMap;
use std::sync::Mutex;

/// Per-1M-token input/output prices in USD.
#[derive(Debug, Clone, Copy)]
pub struct ModelPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

const DEFAULT_COST_PER_1K: f64 = 0.001;

fn price_table() -> HashMap<&'static str, ModelPricing> {
    let mut table = HashMap::new();
    table.insert(
        "anthropic/claude-3.5-sonnet",
        ModelPricing {
            input_per_million: 3.0,
            output_per_million: 15.0,
        },
    );
    table.insert(
        "anthropic/claude-3.5-haiku",
        ModelPricing {
            input_per_million: 0.8,
            output_per_million: 4.0,
        },
    );
    table.insert(
        "anthropic/claude-3-opus",
        ModelPricing {
            input_per_million: 15.0,
            output_per_million: 75.0,
        },
    );
    table.insert(
        "openai/gpt-4o",
        ModelPricing {
            input_per_million: 2.5,
            output_per_million: 10.0,
        },
    );
    table.insert(
        "openai/gpt-4o-mini",
        ModelPricing {
            input_per_million: 0.15,
            output_per_million: 0.6,
        },
    );
    table.insert(
        "google/gemini-1.5-pro",
        ModelPricing {
            input_per_million: 1.25,
            output_per_million: 5.0,
        },
    );
    table.insert(
        "google/gemini-1.5-flash",
        ModelPricing {
            input_per_million: 0.075,
            output_per_million: 0.3,
        },
    );
    table.insert(
        "deepseek/deepseek-chat",
        ModelPricing {
            input_per_million: 0.14,
            output_per_million: 0.28,
        },
    );
    table
}

fn lookup_pricing(model_id: &str) -> Option<ModelPricing> {
    price_table().get(model_id).copied()
}

/// Model ids known to the built-in price table, used to serve `/api/models`
/// without a live upstream catalog fetch.
pub fn builtin_model_ids() -> Vec<&'static str> {
    let mut ids: Vec<&'static str> = price_table().into_keys().collect();
    ids.sort_unstable();
    ids
}

/// One completed call's cost breakdown, kept in the accountant's history.
#[derive(Debug, Clone)]
pub struct CostRecord {
    pub model_id: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, Default)]
pub struct ModelRollup {
    pub calls: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

/// A point-in-time view of spend vs. budget, suitable for a `Summary()`
/// response.
#[derive(Debug, Clone)]
pub struct BudgetSummary {
    pub spend_usd: f64,
    pub ceiling_usd: f64,
    pub remaining_usd: f64,
    pub budget_used_percent: f64,
    pub calls: usize,
}

struct Ledger {
    spend_usd: f64,
    history: Vec<CostRecord>,
    rollup: HashMap<String, ModelRollup>,
}

/// Tracks spend against a budget ceiling and enforces it before calls are
/// dispatched.
pub struct CostAccountant {
    ceiling_usd: f64,
    ledger: Mutex<Ledger>,
}

impl CostAccountant {
    pub fn new(ceiling_usd: f64) -> Self {
        CostAccountant {
            ceiling_usd,
            ledger: Mutex::new(Ledger {
                spend_usd: 0.0,
                history: Vec::new(),
                rollup: HashMap::new(),
            }),
        }
    }

    /// Estimate the USD cost of querying `models` for `approx_tokens` total
    /// tokens, using the average of a model's input/output price per 1K
    /// tokens. Unknown models fall back to the conservative default.
    pub fn estimate(&self, models: &[String], approx_tokens: u64) -> f64 {
        models
            .iter()
            .map(|model_id| {
                let per_k = match lookup_pricing(model_id) {
                    Some(pricing) => {
                        (pricing.input_per_million / 1000.0 + pricing.output_per_million / 1000.0)
                            / 2.0
                    }
                    None => DEFAULT_COST_PER_1K,
                };
                (approx_tokens as f64 / 1000.0) * per_k
            })
            .sum()
    }

    pub fn can_proceed(&self, estimate: f64) -> bool {
        let ledger = self.ledger.lock().expect("ledger mutex poisoned");
        ledger.spend_usd + estimate <= self.ceiling_usd
    }

    /// Record actual usage for a completed call and return its cost.
    pub fn record(&self, model_id: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        let cost = match lookup_pricing(model_id) {
            Some(pricing) => {
                (input_tokens as f64 / 1_000_000.0) * pricing.input_per_million
                    + (output_tokens as f64 / 1_000_000.0) * pricing.output_per_million
            }
            None => {
                let total = input_tokens + output_tokens;
                (total as f64 / 1000.0) * DEFAULT_COST_PER_1K
            }
        };

        let mut ledger = self.ledger.lock().expect("ledger mutex poisoned");
        ledger.spend_usd += cost;
        ledger.history.push(CostRecord {
            model_id: model_id.to_string(),
            input_tokens,
            output_tokens,
            cost_usd: cost,
        });
        let entry = ledger.rollup.entry(model_id.to_string()).or_default();
        entry.calls += 1;
        entry.input_tokens += input_tokens;
        entry.output_tokens += output_tokens;
        entry.cost_usd += cost;
        cost
    }

    pub fn remaining(&self) -> f64 {
        let ledger = self.ledger.lock().expect("ledger mutex poisoned");
        (self.ceiling_usd - ledger.spend_usd).max(0.0)
    }

    pub fn summary(&self) -> BudgetSummary {
        let ledger = self.ledger.lock().expect("ledger mutex poisoned");
        let budget_used_percent = if self.ceiling_usd > 0.0 {
            (ledger.spend_usd / self.ceiling_usd) * 100.0
        } else {
            0.0
        };
        BudgetSummary {
            spend_usd: ledger.spend_usd,
            ceiling_usd: self.ceiling_usd,
            remaining_usd: (self.ceiling_usd - ledger.spend_usd).max(0.0),
            budget_used_percent,
            calls: ledger.history.len(),
        }
    }

    pub fn reset(&self) {
        let mut ledger = self.ledger.lock().expect("ledger mutex poisoned");
        ledger.spend_usd = 0.0;
        ledger.history.clear();
        ledger.rollup.clear();
    }
}

/// Query-complexity classification used by [`select_model_tier`] when no
/// council configuration is supplied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Complexity {
    Simple,
    Medium,
    Complex,
}

const SIMPLE_KEYWORDS: &[&str] = &[
    "what is", "when is", "who is", "where is", "define", "meaning of", "capital of",
    "how many",
];
const COMPLEX_KEYWORDS: &[&str] = &[
    "evaluate", "critique", "synthesize", "design", "architect", "optimize", "prove",
    "derive", "implement", "debug", "refactor",
];

pub fn assess_complexity(query: &str) -> Complexity {
    let lower = query.to_lowercase();
    if COMPLEX_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
        return Complexity::Complex;
    }
    if SIMPLE_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
        return Complexity::Simple;
    }
    Complexity::Medium
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelTier {
    Budget,
    Standard,
    Premium,
}

/// Map a query and the remaining budget to an ordered model pool. Only
/// consulted when the caller did not supply an explicit council
/// configuration — a supplied configuration is always authoritative.
pub fn select_model_tier(query: &str, budget_remaining_usd: f64) -> (ModelTier, Vec<&'static str>) {
    let complexity = assess_complexity(query);
    let mut tier = if budget_remaining_usd < 0.5 {
        ModelTier::Budget
    } else {
        match complexity {
            Complexity::Simple => ModelTier::Budget,
            Complexity::Medium => ModelTier::Standard,
            Complexity::Complex => ModelTier::Premium,
        }
    };
    if budget_remaining_usd < 1.0 && tier == ModelTier::Premium {
        tier = ModelTier::Standard;
    }

    let models: Vec<&'static str> = match tier {
        ModelTier::Budget => vec![
            "deepseek/deepseek-chat",
            "anthropic/claude-3.5-haiku",
            "openai/gpt-4o-mini",
            "google/gemini-1.5-flash",
        ],
        ModelTier::Standard => vec![
            "anthropic/claude-3.5-sonnet",
            "openai/gpt-4o",
            "google/gemini-1.5-pro",
            "deepseek/deepseek-chat",
        ],
        ModelTier::Premium => vec![
            "anthropic/claude-3.5-sonnet",
            "anthropic/claude-3-opus",
            "openai/gpt-4o",
            "google/gemini-1.5-pro",
        ],
    };
    (tier, models)
}
