//! Callback registry and wire protocol.
//!
//! The engine never executes work itself; every task, tool, and callback
//! decision is delegated to a registered callback. Callbacks are looked up
//! by the stable capability id the workflow definition names.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use relay_workflow::{CallbackId, NodeId, StateMap};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Request sent to a task or tool executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Execution this request belongs to.
    pub execution_id: Uuid,

    /// Node being executed.
    pub node_id: NodeId,

    /// Read-only snapshot of execution state at dispatch time.
    pub state: StateMap,
}

/// Terminal status of a task attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompletionStatus {
    Completed,
    Failed,
}

/// Completion reported by a task or tool executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCompletion {
    /// Whether the attempt succeeded.
    pub status: CompletionStatus,

    /// Key-value outputs to merge into execution state. Applied atomically,
    /// and only when the attempt completed.
    #[serde(default)]
    pub outputs: StateMap,

    /// Failure description when the attempt failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskCompletion {
    /// Successful completion with the given outputs.
    pub fn completed(outputs: StateMap) -> Self {
        Self {
            status: CompletionStatus::Completed,
            outputs,
            error: None,
        }
    }

    /// Failed completion with an error description.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: CompletionStatus::Failed,
            outputs: StateMap::new(),
            error: Some(error.into()),
        }
    }
}

/// Request sent to a decision callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRequest {
    /// Execution this request belongs to.
    pub execution_id: Uuid,

    /// Decision node being resolved.
    pub node_id: NodeId,

    /// Read-only snapshot of execution state at dispatch time.
    pub state: StateMap,

    /// Outcome labels declared on the node's outgoing edges, in edge order.
    pub possible_outcomes: Vec<String>,
}

/// Response from a decision callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionResponse {
    /// Chosen outcome label.
    pub outcome: String,

    /// Opaque metadata recorded alongside the decision, never merged into
    /// execution state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Failure modes of a single callback invocation.
#[derive(Debug, Error)]
pub enum CallbackFailure {
    /// The callback could not be reached or answered with a transient
    /// failure; the attempt may be retried.
    #[error("callback transport failure: {0}")]
    Transport(String),

    /// The callback rejected the request outright; retrying the same
    /// request will not help.
    #[error("callback rejected request: {0}")]
    Rejected(String),
}

/// An external executor for task and tool nodes.
#[async_trait]
pub trait TaskCallback: Send + Sync {
    /// Perform the work for one node attempt.
    async fn invoke(&self, request: TaskRequest) -> Result<TaskCompletion, CallbackFailure>;
}

/// An external decider for callback-mode decision nodes.
#[async_trait]
pub trait DecisionCallback: Send + Sync {
    /// Choose one of the offered outcomes.
    async fn decide(&self, request: DecisionRequest) -> Result<DecisionResponse, CallbackFailure>;
}

/// Registry of callback capabilities, keyed by stable id.
#[derive(Default)]
pub struct CallbackRegistry {
    tasks: HashMap<CallbackId, Arc<dyn TaskCallback>>,
    decisions: HashMap<CallbackId, Arc<dyn DecisionCallback>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task executor under the given capability id. Replaces any
    /// previous registration for the same id.
    pub fn register_task(&mut self, id: impl Into<CallbackId>, callback: Arc<dyn TaskCallback>) {
        self.tasks.insert(id.into(), callback);
    }

    /// Register a decision callback under the given capability id.
    pub fn register_decision(
        &mut self,
        id: impl Into<CallbackId>,
        callback: Arc<dyn DecisionCallback>,
    ) {
        self.decisions.insert(id.into(), callback);
    }

    /// Look up a task executor.
    pub fn task(&self, id: &str) -> Option<Arc<dyn TaskCallback>> {
        self.tasks.get(id).cloned()
    }

    /// Look up a decision callback.
    pub fn decision(&self, id: &str) -> Option<Arc<dyn DecisionCallback>> {
        self.decisions.get(id).cloned()
    }
}

impl std::fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("tasks", &self.tasks.keys().collect::<Vec<_>>())
            .field("decisions", &self.decisions.keys().collect::<Vec<_>>())
            .finish()
    }
}
