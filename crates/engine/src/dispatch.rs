//! Decision dispatch.
//!
//! Sends a decision request to its callback, enforcing the per-attempt
//! timeout and the node's retry policy, and checks the response against the
//! outcomes the node declares. Only transport failures and timeouts are
//! retried; a malformed or undeclared answer is final on the first attempt.

use std::sync::Arc;
use std::time::Duration;

use relay_workflow::RetryPolicy;
use tracing::warn;

use crate::error::EngineError;
use crate::registry::{CallbackFailure, DecisionCallback, DecisionRequest};

/// A resolved decision.
#[derive(Debug, Clone)]
pub struct DecisionOutcome {
    /// Chosen outcome label, guaranteed to be one of the declared outcomes.
    pub outcome: String,

    /// Metadata the callback attached, if any.
    pub metadata: Option<serde_json::Value>,

    /// Attempts made, including the successful one.
    pub attempts: u32,
}

/// A decision that could not be resolved.
#[derive(Debug)]
pub struct DispatchFailure {
    /// Final error. [`EngineError::RetryExhausted`] when at least one retry
    /// was attempted; otherwise the underlying error itself.
    pub error: EngineError,

    /// Attempts made.
    pub attempts: u32,
}

/// Dispatches decision requests under a timeout and retry policy.
#[derive(Debug, Clone)]
pub struct DecisionDispatcher {
    timeout: Duration,
    retry: RetryPolicy,
}

impl DecisionDispatcher {
    pub fn new(timeout: Duration, retry: RetryPolicy) -> Self {
        Self { timeout, retry }
    }

    /// Resolve one decision.
    ///
    /// The returned outcome is validated: non-empty and declared by the
    /// node's outgoing edges. An undeclared outcome is never retried; the
    /// callback gave a well-formed answer the graph cannot route.
    pub async fn dispatch(
        &self,
        callback: Arc<dyn DecisionCallback>,
        request: DecisionRequest,
    ) -> Result<DecisionOutcome, DispatchFailure> {
        let node_id = request.node_id.clone();
        let mut delay = self.retry.initial_delay();
        let mut attempts = 0u32;

        loop {
            attempts += 1;

            let error = match tokio::time::timeout(self.timeout, callback.decide(request.clone()))
                .await
            {
                Err(_) => EngineError::DecisionTimeout {
                    node_id: node_id.clone(),
                    timeout_secs: self.timeout.as_secs(),
                },
                Ok(Err(CallbackFailure::Transport(reason))) => EngineError::Execution {
                    node_id: node_id.clone(),
                    reason,
                },
                Ok(Err(CallbackFailure::Rejected(reason))) => {
                    return Err(DispatchFailure {
                        error: EngineError::InvalidDecisionResponse {
                            node_id,
                            reason,
                        },
                        attempts,
                    });
                }
                Ok(Ok(response)) => {
                    if response.outcome.is_empty() {
                        return Err(DispatchFailure {
                            error: EngineError::InvalidDecisionResponse {
                                node_id,
                                reason: "empty outcome".to_string(),
                            },
                            attempts,
                        });
                    }
                    if !request.possible_outcomes.contains(&response.outcome) {
                        return Err(DispatchFailure {
                            error: EngineError::UnknownOutcome {
                                node_id,
                                outcome: response.outcome,
                            },
                            attempts,
                        });
                    }
                    return Ok(DecisionOutcome {
                        outcome: response.outcome,
                        metadata: response.metadata,
                        attempts,
                    });
                }
            };

            if attempts > self.retry.max_retries {
                let error = if self.retry.max_retries == 0 {
                    error
                } else {
                    EngineError::RetryExhausted {
                        node_id,
                        attempts,
                        last_error: error.to_string(),
                    }
                };
                return Err(DispatchFailure { error, attempts });
            }

            warn!(
                node_id = %node_id,
                attempt = attempts,
                max_retries = self.retry.max_retries,
                error = %error,
                "Decision attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
            delay = self.retry.next_delay(delay);
        }
    }
}
