//! Retry, fallback and quorum logic wrapped around the model client.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{CouncilError, RecoveryStrategy};
use crate::model_client::{ChatMessage, ModelClient, ModelReply};

const ERROR_CONTENT_PATTERNS: &[&str] = &[
    "error:",
    "failed to",
    "unable to",
    "rate limit",
    "quota exceeded",
];

/// Reject responses that are absent, too short, or open with a known error
/// phrase in their first 100 characters.
pub fn validate_response(content: &str) -> bool {
    if content.trim().len() < 10 {
        return false;
    }
    let head: String = content.chars().take(100).collect::<String>().to_lowercase();
    !ERROR_CONTENT_PATTERNS.iter().any(|pattern| head.contains(pattern))
}

/// Wraps a [`ModelClient`] with retry, fallback-substitution and quorum
/// enforcement, matching the original `ResilientCouncil`.
pub struct ResilienceLayer {
    client: Arc<dyn ModelClient>,
    quorum: usize,
    retry_attempts: u32,
    retry_base_delay: Duration,
    fallback_pool: Vec<String>,
}

impl ResilienceLayer {
    pub fn new(
        client: Arc<dyn ModelClient>,
        quorum: usize,
        retry_attempts: u32,
        retry_base_delay: Duration,
        fallback_pool: Vec<String>,
    ) -> Self {
        ResilienceLayer {
            client,
            quorum,
            retry_attempts,
            retry_base_delay,
            fallback_pool,
        }
    }

    /// Call a single model with exponential backoff: delay `d * 2^(i-1)` for
    /// retry attempt `i >= 1`. Returns the first valid reply, or the last
    /// observed error if every attempt failed or was invalid.
    pub async fn call_with_retry(
        &self,
        model_id: &str,
        messages: &[ChatMessage],
        temperature: Option<f32>,
        timeout: Duration,
    ) -> Result<ModelReply, CouncilError> {
        let mut last_err = CouncilError::Unexpected {
            detail: "no attempts made".to_string(),
        };
        for attempt in 0..=self.retry_attempts {
            if attempt > 0 {
                let delay = self.retry_base_delay.mul_f64(2f64.powi(attempt as i32 - 1));
                log::info!("retry {attempt} for {model_id} after {delay:?}");
                tokio::time::sleep(delay).await;
            }
            match self.client.call(model_id, messages, temperature, timeout).await {
                Ok(reply) if validate_response(&reply.content) => return Ok(reply),
                Ok(reply) => {
                    last_err = CouncilError::MalformedResponse {
                        detail: format!("response failed validation: {:.60}", reply.content),
                    };
                }
                Err(err) => {
                    log::error!("attempt {} for {model_id} failed: {err}", attempt + 1);
                    last_err = err;
                }
            }
        }
        log::error!("all {} attempts failed for {model_id}", self.retry_attempts + 1);
        Err(last_err)
    }

    /// Fan out to every primary model, then top up with unused fallbacks
    /// until quorum is met or the fallback pool is exhausted.
    pub async fn execute_with_fallback(
        &self,
        primary_models: &[String],
        messages: &[ChatMessage],
        temperature: Option<f32>,
        timeout: Duration,
    ) -> HashMap<String, Option<ModelReply>> {
        let mut responses = self
            .fan_out(primary_models, messages, temperature, timeout)
            .await;

        let valid_count = responses.values().filter(|v| v.is_some()).count();
        if valid_count >= self.quorum {
            return responses;
        }

        let needed = self.quorum - valid_count;
        let used: Vec<&String> = responses.keys().collect();
        let available_fallbacks: Vec<String> = self
            .fallback_pool
            .iter()
            .filter(|m| !primary_models.contains(m) && !used.contains(m))
            .cloned()
            .collect();

        if !available_fallbacks.is_empty() {
            let fallback_batch: Vec<String> = available_fallbacks.into_iter().take(needed).collect();
            log::info!("need {needed} more responses, trying fallbacks: {fallback_batch:?}");
            let fallback_responses = self.fan_out(&fallback_batch, messages, temperature, timeout).await;
            responses.extend(fallback_responses);
        }

        responses
    }

    async fn fan_out(
        &self,
        models: &[String],
        messages: &[ChatMessage],
        temperature: Option<f32>,
        timeout: Duration,
    ) -> HashMap<String, Option<ModelReply>> {
        let mut handles = Vec::with_capacity(models.len());
        for model_id in models {
            let model_id = model_id.clone();
            let messages = messages.to_vec();
            let client = Arc::clone(&self.client);
            let quorum = self.quorum;
            let retry_attempts = self.retry_attempts;
            let retry_base_delay = self.retry_base_delay;
            let fallback_pool = Vec::new();
            handles.push(tokio::spawn(async move {
                let layer = ResilienceLayer {
                    client,
                    quorum,
                    retry_attempts,
                    retry_base_delay,
                    fallback_pool,
                };
                let reply = layer
                    .call_with_retry(&model_id, &messages, temperature, timeout)
                    .await
                    .ok();
                (model_id, reply)
            }));
        }

        let mut responses = HashMap::with_capacity(handles.len());
        for handle in handles {
            if let Ok((model_id, reply)) = handle.await {
                responses.insert(model_id, reply);
            }
        }
        responses
    }
}

/// Consulted after Stage 1 to decide whether the execution can continue.
pub enum PartialResponseDecision {
    /// Fewer than two valid responses: abort before Stage 2.
    Abort,
    /// Between two and the quorum: proceed, but no further fallbacks.
    ProceedWithWarning,
    /// At or above quorum: proceed normally.
    Proceed,
}

pub fn partial_response_policy(valid_count: usize, quorum: usize) -> PartialResponseDecision {
    if valid_count < 2 {
        PartialResponseDecision::Abort
    } else if valid_count < quorum {
        PartialResponseDecision::ProceedWithWarning
    } else {
        PartialResponseDecision::Proceed
    }
}

pub fn classify_error(error: &CouncilError) -> RecoveryStrategy {
    RecoveryStrategy::classify(error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedClient {
        calls: AtomicUsize,
        succeed_on_attempt: usize,
    }

    #[async_trait]
    impl ModelClient for ScriptedClient {
        async fn call(
            &self,
            _model_id: &str,
            _messages: &[ChatMessage],
            _temperature: Option<f32>,
            _timeout: Duration,
        ) -> Result<ModelReply, CouncilError> {
            let call_index = self.calls.fetch_add(1, Ordering::SeqCst);
            if call_index + 1 >= self.succeed_on_attempt {
                Ok(ModelReply {
                    content: "a valid response with enough length".to_string(),
                    usage: Default::default(),
                    duration: Duration::from_millis(1),
                })
            } else {
                Err(CouncilError::Unexpected {
                    detail: "scripted failure".to_string(),
                })
            }
        }
    }

    struct AlwaysFailClient;

    #[async_trait]
    impl ModelClient for AlwaysFailClient {
        async fn call(
            &self,
            _model_id: &str,
            _messages: &[ChatMessage],
            _temperature: Option<f32>,
            _timeout: Duration,
        ) -> Result<ModelReply, CouncilError> {
            Err(CouncilError::Unexpected {
                detail: "always fails".to_string(),
            })
        }
    }

    struct AlwaysSucceedClient;

    #[async_trait]
    impl ModelClient for AlwaysSucceedClient {
        async fn call(
            &self,
            model_id: &str,
            _messages: &[ChatMessage],
            _temperature: Option<f32>,
            _timeout: Duration,
        ) -> Result<ModelReply, CouncilError> {
            Ok(ModelReply {
                content: format!("a valid response from {model_id}"),
                usage: Default::default(),
                duration: Duration::from_millis(1),
            })
        }
    }

    #[test]
    fn validate_response_rejects_short_and_error_bodies() {
        assert!(!validate_response("short"));
        assert!(!validate_response("Error: rate limit exceeded, try later"));
        assert!(validate_response("This is a perfectly fine and complete answer."));
    }

    #[tokio::test]
    async fn retry_succeeds_after_transient_failures() {
        let client = Arc::new(ScriptedClient {
            calls: AtomicUsize::new(0),
            succeed_on_attempt: 2,
        });
        let layer = ResilienceLayer::new(client, 3, 2, Duration::from_millis(1), vec![]);
        let result = layer
            .call_with_retry("m", &[ChatMessage::user("hi")], None, Duration::from_secs(1))
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn retry_exhausts_and_returns_last_error() {
        let client = Arc::new(AlwaysFailClient);
        let layer = ResilienceLayer::new(client, 3, 2, Duration::from_millis(1), vec![]);
        let result = layer
            .call_with_retry("m", &[ChatMessage::user("hi")], None, Duration::from_secs(1))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn quorum_met_by_primaries_skips_fallback() {
        let client = Arc::new(AlwaysSucceedClient);
        let layer = ResilienceLayer::new(
            client,
            2,
            0,
            Duration::from_millis(1),
            vec!["fallback-a".to_string()],
        );
        let primaries = vec!["m1".to_string(), "m2".to_string()];
        let responses = layer
            .execute_with_fallback(&primaries, &[ChatMessage::user("hi")], None, Duration::from_secs(1))
            .await;
        assert_eq!(responses.len(), 2);
        assert!(!responses.contains_key("fallback-a"));
    }

    #[tokio::test]
    async fn below_quorum_invokes_only_needed_fallbacks() {
        let client = Arc::new(AlwaysFailClient);
        let layer = ResilienceLayer::new(
            client,
            3,
            0,
            Duration::from_millis(1),
            vec!["fb1".to_string(), "fb2".to_string(), "fb3".to_string()],
        );
        let primaries = vec!["m1".to_string()];
        let responses = layer
            .execute_with_fallback(&primaries, &[ChatMessage::user("hi")], None, Duration::from_secs(1))
            .await;
        // quorum 3, 0 primary successes => need 3, only 3 fallbacks available.
        assert_eq!(responses.len(), 1 + 3);
    }

    #[test]
    fn partial_response_policy_thresholds() {
        assert!(matches!(partial_response_policy(1, 3), PartialResponseDecision::Abort));
        assert!(matches!(
            partial_response_policy(2, 3),
            PartialResponseDecision::ProceedWithWarning
        ));
        assert!(matches!(partial_response_policy(3, 3), PartialResponseDecision::Proceed));
    }
}
