//! Engine error types.

use relay_workflow::{ConditionError, ValidationResult};
use thiserror::Error;

/// Errors produced by the execution engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A workflow failed structural validation.
    #[error("workflow validation failed: {0:?}")]
    Validation(ValidationResult),

    /// A referenced workflow is not registered.
    #[error("workflow '{id}' version '{version}' is not registered")]
    WorkflowNotFound { id: String, version: String },

    /// A workflow with the same id and version is already registered.
    #[error("workflow '{id}' version '{version}' is already registered")]
    WorkflowConflict { id: String, version: String },

    /// A node references a callback that is not registered.
    #[error("callback '{0}' is not registered")]
    CallbackNotFound(String),

    /// A decision callback did not answer within its timeout.
    #[error("decision '{node_id}' timed out after {timeout_secs}s")]
    DecisionTimeout { node_id: String, timeout_secs: u64 },

    /// A decision callback answered with a malformed response.
    #[error("decision '{node_id}' returned an invalid response: {reason}")]
    InvalidDecisionResponse { node_id: String, reason: String },

    /// A decision callback chose an outcome no outgoing edge declares.
    #[error("decision '{node_id}' chose undeclared outcome '{outcome}'")]
    UnknownOutcome { node_id: String, outcome: String },

    /// A condition expression failed to evaluate.
    #[error("condition on '{node_id}' failed: {source}")]
    ConditionEvaluation {
        node_id: String,
        #[source]
        source: ConditionError,
    },

    /// A node's external call failed.
    #[error("node '{node_id}' failed: {reason}")]
    Execution { node_id: String, reason: String },

    /// A node exhausted its retry budget.
    #[error("node '{node_id}' exhausted {attempts} attempts: {last_error}")]
    RetryExhausted {
        node_id: String,
        attempts: u32,
        last_error: String,
    },

    /// A state transition that the execution state machine forbids.
    #[error("illegal transition for node '{node_id}': {reason}")]
    IllegalTransition { node_id: String, reason: String },

    /// The execution was cancelled.
    #[error("execution was cancelled")]
    Cancelled,

    /// Unclassified internal failure.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_)
            | EngineError::WorkflowNotFound { .. }
            | EngineError::WorkflowConflict { .. } => "VALIDATION_ERROR",
            EngineError::DecisionTimeout { .. } => "DECISION_TIMEOUT",
            EngineError::InvalidDecisionResponse { .. } => "INVALID_DECISION_RESPONSE",
            EngineError::UnknownOutcome { .. } => "UNKNOWN_OUTCOME",
            EngineError::ConditionEvaluation { .. } => "CONDITION_EVALUATION_ERROR",
            EngineError::RetryExhausted { .. } => "RETRY_EXHAUSTED",
            EngineError::Execution { .. }
            | EngineError::CallbackNotFound(_)
            | EngineError::IllegalTransition { .. }
            | EngineError::Internal(_) => "EXECUTION_ERROR",
            EngineError::Cancelled => "EXECUTION_CANCELLED",
        }
    }

}

/// Convenience alias used across the engine.
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = EngineError::DecisionTimeout {
            node_id: "check".to_string(),
            timeout_secs: 30,
        };
        assert_eq!(err.code(), "DECISION_TIMEOUT");

        let err = EngineError::UnknownOutcome {
            node_id: "check".to_string(),
            outcome: "maybe".to_string(),
        };
        assert_eq!(err.code(), "UNKNOWN_OUTCOME");

        let err = EngineError::CallbackNotFound("cb.missing".to_string());
        assert_eq!(err.code(), "EXECUTION_ERROR");
    }
}
