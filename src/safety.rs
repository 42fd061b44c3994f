//! Prompt-injection rejection and PII redaction.

use regex::Regex;

use crate::error::CouncilError;

const DEFAULT_MAX_LENGTH: usize = 10_000;

fn injection_patterns() -> Vec<(&'static str, Regex)> {
    vec![
        (
            r"ignore\s+(all\s+)?previous\s+instructions",
            Regex::new(r"(?i)ignore\s+(all\s+)?previous\s+instructions").unwrap(),
        ),
        (
            r"disregard\s+(all\s+)?prior\s+context",
            Regex::new(r"(?i)disregard\s+(all\s+)?prior\s+context").unwrap(),
        ),
        (
            r"forget\s+everything",
            Regex::new(r"(?i)forget\s+everything").unwrap(),
        ),
        (r"you\s+are\s+now", Regex::new(r"(?i)you\s+are\s+now").unwrap()),
        (r"new\s+instructions", Regex::new(r"(?i)new\s+instructions").unwrap()),
        (r"system\s*:\s*", Regex::new(r"(?i)system\s*:\s*").unwrap()),
        (r"assistant\s*:\s*", Regex::new(r"(?i)assistant\s*:\s*").unwrap()),
        (r"<\|.*?\|>", Regex::new(r"(?i)<\|.*?\|>").unwrap()),
        (r"\[SYSTEM\]", Regex::new(r"(?i)\[SYSTEM\]").unwrap()),
        (r"\[INST\]", Regex::new(r"(?i)\[INST\]").unwrap()),
        (r"</s>", Regex::new(r"(?i)</s>").unwrap()),
        (r"<s>", Regex::new(r"(?i)<s>").unwrap()),
    ]
}

/// Reject input that is empty, too long, or matches a known
/// prompt-injection pattern. Returns the whitespace-normalized input on
/// success.
pub fn sanitize_user_input(input: &str) -> Result<String, CouncilError> {
    sanitize_user_input_with_limit(input, DEFAULT_MAX_LENGTH)
}

pub fn sanitize_user_input_with_limit(input: &str, max_length: usize) -> Result<String, CouncilError> {
    if input.trim().is_empty() {
        return Err(CouncilError::InvalidCouncilConfig {
            detail: "empty input not allowed".to_string(),
        });
    }
    if input.chars().count() > max_length {
        return Err(CouncilError::InvalidCouncilConfig {
            detail: format!("input exceeds maximum length of {max_length} characters"),
        });
    }
    for (label, pattern) in injection_patterns() {
        if pattern.is_match(input) {
            return Err(CouncilError::InjectionDetected {
                pattern: label.to_string(),
            });
        }
    }
    Ok(input.split_whitespace().collect::<Vec<_>>().join(" "))
}

struct PiiPattern {
    regex: Regex,
    placeholder: &'static str,
}

fn pii_patterns() -> Vec<PiiPattern> {
    vec![
        PiiPattern {
            regex: Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").unwrap(),
            placeholder: "[EMAIL_REDACTED]",
        },
        PiiPattern {
            regex: Regex::new(r"\b(?:\+?1[-.]?)?\d{3}[-.]?\d{3}[-.]?\d{4}\b").unwrap(),
            placeholder: "[PHONE_REDACTED]",
        },
        PiiPattern {
            regex: Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").unwrap(),
            placeholder: "[SSN_REDACTED]",
        },
        PiiPattern {
            regex: Regex::new(r"\b\d{4}[-\s]?\d{4}[-\s]?\d{4}[-\s]?\d{4}\b").unwrap(),
            placeholder: "[CARD_REDACTED]",
        },
        PiiPattern {
            regex: Regex::new(r"\b(?:sk-|pk-)[A-Za-z0-9_-]{32,}\b").unwrap(),
            placeholder: "[API_KEY_REDACTED]",
        },
        PiiPattern {
            regex: Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").unwrap(),
            placeholder: "[IP_REDACTED]",
        },
    ]
}

/// Rewrite emails, phones, SSNs, card numbers, IP addresses and bearer-like
/// secrets to tagged placeholders, for use in logs and decision-tree
/// payloads. Truncates to `max_length` when given.
pub fn redact_pii(text: &str, max_length: Option<usize>) -> String {
    if text.is_empty() {
        return String::new();
    }
    let mut redacted = text.to_string();
    for pattern in pii_patterns() {
        redacted = pattern.regex.replace_all(&redacted, pattern.placeholder).into_owned();
    }
    if let Some(limit) = max_length {
        if redacted.chars().count() > limit {
            let truncated: String = redacted.chars().take(limit).collect();
            redacted = format!("{truncated}...");
        }
    }
    redacted
}
