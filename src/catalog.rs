//! Built-in lookup tables for roles and reasoning patterns.
//!
//! These are static data, not a managed content system: the out-of-scope
//! "static catalog of models/roles/reasoning-pattern prompt fragments" named
//! in the purpose statement. Custom roles persisted by a caller live in
//! [`crate::persistence::Store`] instead.

/// A role's prompt fragment, looked up by `role_id`.
#[derive(Debug, Clone)]
pub struct RoleDefinition {
    pub id: &'static str,
    pub prompt: &'static str,
}

const BUILTIN_ROLES: &[RoleDefinition] = &[
    RoleDefinition {
        id: "analyst",
        prompt: "You are a rigorous analyst. Answer precisely and cite your reasoning.",
    },
    RoleDefinition {
        id: "skeptic",
        prompt: "You are a skeptic. Challenge assumptions and look for weaknesses in arguments.",
    },
    RoleDefinition {
        id: "synthesizer",
        prompt: "You synthesize multiple viewpoints into a coherent, balanced answer.",
    },
    RoleDefinition {
        id: "chairman",
        prompt: "You are the council chairman. Read the other participants' responses and \
                  produce one final, authoritative answer to the original query.",
    },
];

pub fn role_prompt(role_id: &str) -> &'static str {
    BUILTIN_ROLES
        .iter()
        .find(|r| r.id == role_id)
        .map(|r| r.prompt)
        .unwrap_or("You are a helpful assistant participating in a council discussion.")
}

pub fn chairman_role_prompt() -> &'static str {
    role_prompt("chairman")
}

/// A reasoning pattern's prompt fragments and suggested sampling
/// temperature, looked up by `reasoning_pattern_id`.
#[derive(Debug, Clone, Copy)]
pub struct ReasoningPattern {
    pub id: &'static str,
    pub prompt_prefix: &'static str,
    pub prompt_suffix: &'static str,
    pub temperature: Option<f32>,
}

const BUILTIN_PATTERNS: &[ReasoningPattern] = &[
    ReasoningPattern {
        id: "chain_of_thought",
        prompt_prefix: " Think step by step before answering.",
        prompt_suffix: "\n\nShow your reasoning, then give a final answer.",
        temperature: Some(0.3),
    },
    ReasoningPattern {
        id: "devils_advocate",
        prompt_prefix: " Argue against the obvious answer first, then reconsider.",
        prompt_suffix: "\n\nConsider the strongest counter-argument before concluding.",
        temperature: Some(0.8),
    },
    ReasoningPattern {
        id: "concise",
        prompt_prefix: " Be direct and concise.",
        prompt_suffix: "",
        temperature: Some(0.2),
    },
];

pub fn reasoning_pattern(id: &str) -> Option<&'static ReasoningPattern> {
    BUILTIN_PATTERNS.iter().find(|p| p.id == id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_role_falls_back_to_generic_prompt() {
        assert!(!role_prompt("does-not-exist").is_empty());
    }

    #[test]
    fn known_pattern_is_found() {
        assert!(reasoning_pattern("chain_of_thought").is_some());
        assert!(reasoning_pattern("nonexistent").is_none());
    }
}
