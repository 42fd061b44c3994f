//! Typed failures surfaced by every layer of the council engine.
//!
//! Upstream and session-level failures are collapsed into one [`CouncilError`]
//! so that HTTP handlers, WebSocket frames and internal control flow can all
//! pattern-match on the same discriminator rather than downcasting boxed
//! errors or matching on string content.

use std::fmt;

/// Every failure kind the engine can produce, from a single model call up to
/// a session-level rejection.
#[derive(Debug, Clone, PartialEq)]
pub enum CouncilError {
    /// The upstream call did not complete within its deadline.
    TransportTimeout { detail: String },
    /// The upstream responded with a non-2xx HTTP status.
    HttpStatus { status: u16, detail: String },
    /// The upstream response body could not be parsed into the expected shape.
    MalformedResponse { detail: String },
    /// The configured credential was rejected by the upstream.
    Unauthorized { detail: String },
    /// The upstream reported a rate limit.
    RateLimited { detail: String },
    /// The upstream reported an exhausted quota.
    QuotaExceeded { detail: String },
    /// The session's budget ceiling was reached mid-execution.
    BudgetExceeded { remaining: f64 },
    /// Stage 1 produced zero valid responses.
    NoResponses,
    /// Stage 1 produced fewer than two valid responses.
    InsufficientResponses { valid: usize },
    /// The supplied council configuration failed validation.
    InvalidCouncilConfig { detail: String },
    /// User input matched a prompt-injection pattern.
    InjectionDetected { pattern: String },
    /// A per-client request-rate limit was exceeded.
    RateLimitClient,
    /// A per-client concurrent-connection limit was exceeded.
    ConnectionLimitClient,
    /// Anything that does not fit a more specific kind above.
    Unexpected { detail: String },
}

impl CouncilError {
    /// The short, stable string a client-visible error frame carries. Never
    /// includes raw provider payloads.
    pub fn reason(&self) -> String {
        match self {
            CouncilError::TransportTimeout { .. } => "transport_timeout".to_string(),
            CouncilError::HttpStatus { .. } => "http_status".to_string(),
            CouncilError::MalformedResponse { .. } => "malformed_response".to_string(),
            CouncilError::Unauthorized { .. } => "unauthorized".to_string(),
            CouncilError::RateLimited { .. } => "rate_limited".to_string(),
            CouncilError::QuotaExceeded { .. } => "quota_exceeded".to_string(),
            CouncilError::BudgetExceeded { .. } => "budget_exceeded".to_string(),
            CouncilError::NoResponses => "no_responses".to_string(),
            CouncilError::InsufficientResponses { .. } => "insufficient_responses".to_string(),
            CouncilError::InvalidCouncilConfig { .. } => "invalid_council_config".to_string(),
            CouncilError::InjectionDetected { .. } => "injection_detected".to_string(),
            CouncilError::RateLimitClient => "rate_limit_client".to_string(),
            CouncilError::ConnectionLimitClient => "connection_limit_client".to_string(),
            CouncilError::Unexpected { .. } => "unexpected".to_string(),
        }
    }

    /// The HTTP status this error maps to at the entry points in §6 of the
    /// engine's external interface.
    pub fn http_status(&self) -> u16 {
        match self {
            CouncilError::InvalidCouncilConfig { .. } | CouncilError::InjectionDetected { .. } => {
                400
            }
            CouncilError::BudgetExceeded { .. } => 402,
            CouncilError::RateLimitClient | CouncilError::ConnectionLimitClient => 429,
            _ => 500,
        }
    }
}

impl fmt::Display for CouncilError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CouncilError::TransportTimeout { detail } => {
                write!(f, "transport timeout: {detail}")
            }
            CouncilError::HttpStatus { status, detail } => {
                write!(f, "upstream http {status}: {detail}")
            }
            CouncilError::MalformedResponse { detail } => {
                write!(f, "malformed upstream response: {detail}")
            }
            CouncilError::Unauthorized { detail } => write!(f, "unauthorized: {detail}"),
            CouncilError::RateLimited { detail } => write!(f, "rate limited: {detail}"),
            CouncilError::QuotaExceeded { detail } => write!(f, "quota exceeded: {detail}"),
            CouncilError::BudgetExceeded { remaining } => {
                write!(f, "budget exceeded, ${remaining:.4} remaining")
            }
            CouncilError::NoResponses => write!(f, "stage 1 produced no valid responses"),
            CouncilError::InsufficientResponses { valid } => {
                write!(f, "stage 1 produced only {valid} valid response(s)")
            }
            CouncilError::InvalidCouncilConfig { detail } => {
                write!(f, "invalid council configuration: {detail}")
            }
            CouncilError::InjectionDetected { pattern } => {
                write!(f, "input matched injection pattern '{pattern}'")
            }
            CouncilError::RateLimitClient => write!(f, "client request rate exceeded"),
            CouncilError::ConnectionLimitClient => {
                write!(f, "client concurrent connection limit exceeded")
            }
            CouncilError::Unexpected { detail } => write!(f, "unexpected error: {detail}"),
        }
    }
}

impl std::error::Error for CouncilError {}

/// Coarse recovery strategy an upstream failure maps to, used by the
/// resilience layer to decide whether to retry, fall back, or give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStrategy {
    RateLimit,
    Timeout,
    AuthError,
    QuotaExceeded,
    Unknown,
}

impl RecoveryStrategy {
    /// `quota_exceeded` and `rate_limit` signal that the caller should
    /// consider downgrading to a cheaper model tier before retrying.
    pub fn should_downgrade_tier(&self) -> bool {
        matches!(
            self,
            RecoveryStrategy::QuotaExceeded | RecoveryStrategy::RateLimit
        )
    }

    pub fn classify(error: &CouncilError) -> Self {
        match error {
            CouncilError::RateLimited { .. } => RecoveryStrategy::RateLimit,
            CouncilError::TransportTimeout { .. } => RecoveryStrategy::Timeout,
            CouncilError::Unauthorized { .. } => RecoveryStrategy::AuthError,
            CouncilError::QuotaExceeded { .. } => RecoveryStrategy::QuotaExceeded,
            _ => RecoveryStrategy::Unknown,
        }
    }
}
