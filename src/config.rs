//! Environment-driven configuration.
//!
//! Mirrors the reference crate's `config.rs` philosophy: a small, hand
//! constructed struct with no TOML/YAML parsing dependency. Values are read
//! once at startup via [`Config::from_env`].

use crate::error::CouncilError;

const PLACEHOLDER_KEYS: &[&str] = &[
    "test-key-12345",
    "sk-test",
    "sk-placeholder",
    "your-api-key-here",
    "REPLACE_ME",
    "INSERT_KEY_HERE",
    "CHANGEME",
    "",
];

/// Process-wide configuration assembled from environment variables.
pub struct Config {
    pub openrouter_api_key: String,
    pub port: u16,
    pub host: String,
    pub cors_origins: Vec<String>,
    pub budget_ceiling_usd: f64,
    pub cache_ttl_seconds: u64,
    pub response_timeout_secs: u64,
    pub catalog_timeout_secs: u64,
    pub quorum: usize,
    pub retry_attempts: u32,
    pub retry_base_delay_secs: f64,
    pub max_concurrent_connections_per_client: usize,
    pub rate_limit_requests_per_window: usize,
    pub rate_limit_window_secs: u64,
    pub hourly_cost_ceiling_usd: f64,
}

impl Config {
    /// Load configuration from the process environment, validating the
    /// OpenRouter key the way the original's `APIKeyValidator` does.
    pub fn from_env() -> Result<Self, CouncilError> {
        let openrouter_api_key = std::env::var("OPENROUTER_API_KEY").unwrap_or_default();
        validate_openrouter_key(&openrouter_api_key)?;

        let port = std::env::var("PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8080);
        let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let cors_origins = std::env::var("CORS_ORIGINS")
            .ok()
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Config {
            openrouter_api_key,
            port,
            host,
            cors_origins,
            budget_ceiling_usd: env_f64("COUNCIL_BUDGET_CEILING_USD", 5.0),
            cache_ttl_seconds: env_u64("COUNCIL_CACHE_TTL_SECONDS", 24 * 60 * 60),
            response_timeout_secs: env_u64("COUNCIL_RESPONSE_TIMEOUT_SECS", 120),
            catalog_timeout_secs: env_u64("COUNCIL_CATALOG_TIMEOUT_SECS", 30),
            quorum: env_u64("COUNCIL_QUORUM", 3) as usize,
            retry_attempts: env_u64("COUNCIL_RETRY_ATTEMPTS", 2) as u32,
            retry_base_delay_secs: env_f64("COUNCIL_RETRY_BASE_DELAY_SECS", 1.0),
            max_concurrent_connections_per_client: env_u64(
                "COUNCIL_MAX_CONNECTIONS_PER_CLIENT",
                3,
            ) as usize,
            rate_limit_requests_per_window: env_u64("COUNCIL_RATE_LIMIT_REQUESTS", 10) as usize,
            rate_limit_window_secs: env_u64("COUNCIL_RATE_LIMIT_WINDOW_SECS", 60),
            hourly_cost_ceiling_usd: env_f64("COUNCIL_HOURLY_COST_CEILING_USD", 5.0),
        })
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_f64(name: &str, default: f64) -> f64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Validate an OpenRouter-shaped API key: not a known placeholder, at least
/// 32 characters, and restricted to `[A-Za-z0-9_-]`.
pub fn validate_openrouter_key(key: &str) -> Result<(), CouncilError> {
    if PLACEHOLDER_KEYS.contains(&key) {
        return Err(CouncilError::Unauthorized {
            detail: "OPENROUTER_API_KEY matches a known placeholder value".to_string(),
        });
    }
    if key.len() < 32 {
        return Err(CouncilError::Unauthorized {
            detail: "OPENROUTER_API_KEY is shorter than 32 characters".to_string(),
        });
    }
    if !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return Err(CouncilError::Unauthorized {
            detail: "OPENROUTER_API_KEY contains characters outside [A-Za-z0-9_-]".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_known_placeholders() {
        assert!(validate_openrouter_key("CHANGEME").is_err());
        assert!(validate_openrouter_key("").is_err());
    }

    #[test]
    fn rejects_short_keys() {
        assert!(validate_openrouter_key("short-key").is_err());
    }

    #[test]
    fn rejects_keys_with_invalid_characters() {
        let key = "a".repeat(32) + "!";
        assert!(validate_openrouter_key(&key).is_err());
    }

    #[test]
    fn accepts_well_formed_keys() {
        let key = "sk-or-v1-".to_string() + &"a".repeat(40);
        assert!(validate_openrouter_key(&key).is_ok());
    }
}
