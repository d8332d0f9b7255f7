//! Execution state machine.
//!
//! An [`Execution`] tracks one run of a workflow: the execution-level
//! lifecycle, a per-node record for every node in the graph, and the shared
//! key-value state. All transitions are checked; a forbidden transition
//! returns [`EngineError::IllegalTransition`] and leaves the execution
//! untouched.
//!
//! Readiness follows edge resolution: an incoming edge is resolved once its
//! source node reached a terminal status, and activated when the source
//! completed and the edge's outcome guard (if any) matches the source's
//! selected outcome. A pending node becomes ready when every incoming edge
//! is resolved and at least one is activated; when all resolve deactivated
//! the node is skipped, and skips propagate downstream to a fixpoint.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use relay_workflow::{NodeId, StateMap, Workflow};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};

/// Execution-level lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Created,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// Terminal statuses admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

/// Per-node lifecycle status within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Pending,
    Ready,
    Running,
    WaitingDecision,
    Completed,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeStatus::Completed | NodeStatus::Failed | NodeStatus::Skipped
        )
    }
}

/// Record of one node within an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecution {
    /// Node this record tracks.
    pub node_id: NodeId,

    /// Current status.
    pub status: NodeStatus,

    /// Attempts made so far.
    pub attempts: u32,

    /// Outcome selected by a decision node. Written exactly once.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_outcome: Option<String>,

    /// Last error, for failed nodes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// When the first attempt started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// When the node reached a terminal status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl NodeExecution {
    fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            status: NodeStatus::Pending,
            attempts: 0,
            selected_outcome: None,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Why an execution failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Node whose failure ended the execution.
    pub node_id: NodeId,

    /// Machine-readable error code.
    pub code: String,

    /// Human-readable description.
    pub message: String,
}

/// One run of a workflow.
#[derive(Debug, Clone)]
pub struct Execution {
    /// Unique execution id.
    pub id: Uuid,

    /// The definition being executed.
    pub workflow: Arc<Workflow>,

    status: ExecutionStatus,
    state: StateMap,
    nodes: HashMap<NodeId, NodeExecution>,
    failure: Option<FailureRecord>,

    /// When the execution was created.
    pub created_at: DateTime<Utc>,

    /// When the execution reached a terminal status.
    pub finished_at: Option<DateTime<Utc>>,
}

impl Execution {
    /// Create an execution in `CREATED` with the given input as initial
    /// state. Every node gets a `PENDING` record up front.
    pub fn new(workflow: Arc<Workflow>, input: StateMap) -> Self {
        let nodes = workflow
            .nodes
            .iter()
            .map(|n| (n.id.clone(), NodeExecution::new(n.id.clone())))
            .collect();

        Self {
            id: Uuid::new_v4(),
            workflow,
            status: ExecutionStatus::Created,
            state: input,
            nodes,
            failure: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Current execution status.
    pub fn status(&self) -> ExecutionStatus {
        self.status
    }

    /// Why the execution failed, if it did.
    pub fn failure(&self) -> Option<&FailureRecord> {
        self.failure.as_ref()
    }

    /// Copy of the current key-value state.
    pub fn state_snapshot(&self) -> StateMap {
        self.state.clone()
    }

    /// Record for one node.
    pub fn node(&self, node_id: &str) -> Option<&NodeExecution> {
        self.nodes.get(node_id)
    }

    /// Status of one node.
    pub fn node_status(&self, node_id: &str) -> Option<NodeStatus> {
        self.nodes.get(node_id).map(|n| n.status)
    }

    /// Nodes that are ready, running, or waiting on a decision.
    pub fn active_nodes(&self) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter(|n| {
                matches!(
                    n.status,
                    NodeStatus::Ready | NodeStatus::Running | NodeStatus::WaitingDecision
                )
            })
            .map(|n| n.node_id.clone())
            .collect()
    }

    /// Whether any node is not yet terminal.
    pub fn has_unsettled_nodes(&self) -> bool {
        self.nodes.values().any(|n| !n.status.is_terminal())
    }

    /// Transition `CREATED` -> `RUNNING`.
    pub fn start(&mut self) -> EngineResult<()> {
        if self.status != ExecutionStatus::Created {
            return Err(EngineError::IllegalTransition {
                node_id: String::new(),
                reason: format!("cannot start execution in status {:?}", self.status),
            });
        }
        self.status = ExecutionStatus::Running;
        Ok(())
    }

    /// Promote every pending node whose incoming edges are settled.
    ///
    /// Returns the node ids that became ready and those that were skipped
    /// (including downstream of skips, to a fixpoint).
    pub fn promote_ready(&mut self) -> (Vec<NodeId>, Vec<NodeId>) {
        let mut ready = Vec::new();
        let mut skipped = Vec::new();

        if self.status != ExecutionStatus::Running {
            return (ready, skipped);
        }

        loop {
            let mut changed = false;

            let pending: Vec<NodeId> = self
                .nodes
                .values()
                .filter(|n| n.status == NodeStatus::Pending)
                .map(|n| n.node_id.clone())
                .collect();

            for node_id in pending {
                match self.settle_pending(&node_id) {
                    Some(NodeStatus::Ready) => {
                        self.nodes.get_mut(&node_id).expect("node seeded").status =
                            NodeStatus::Ready;
                        ready.push(node_id);
                        changed = true;
                    }
                    Some(NodeStatus::Skipped) => {
                        let record = self.nodes.get_mut(&node_id).expect("node seeded");
                        record.status = NodeStatus::Skipped;
                        record.finished_at = Some(Utc::now());
                        skipped.push(node_id);
                        changed = true;
                    }
                    _ => {}
                }
            }

            if !changed {
                break;
            }
        }

        (ready, skipped)
    }

    /// Decide whether a pending node is ready, skipped, or still blocked.
    fn settle_pending(&self, node_id: &str) -> Option<NodeStatus> {
        let mut any_edge = false;
        let mut any_activated = false;

        for edge in self.workflow.incoming(node_id) {
            any_edge = true;
            match self.edge_state(edge) {
                EdgeState::Unresolved => return None,
                EdgeState::Activated => any_activated = true,
                EdgeState::Deactivated => {}
            }
        }

        if !any_edge || any_activated {
            Some(NodeStatus::Ready)
        } else {
            Some(NodeStatus::Skipped)
        }
    }

    fn edge_state(&self, edge: &relay_workflow::Edge) -> EdgeState {
        let source = match self.nodes.get(&edge.from) {
            Some(record) => record,
            None => return EdgeState::Deactivated,
        };

        match source.status {
            NodeStatus::Completed => match (&edge.outcome, &source.selected_outcome) {
                (None, _) => EdgeState::Activated,
                (Some(guard), Some(selected)) if guard == selected => EdgeState::Activated,
                (Some(_), _) => EdgeState::Deactivated,
            },
            NodeStatus::Skipped | NodeStatus::Failed => EdgeState::Deactivated,
            _ => EdgeState::Unresolved,
        }
    }

    /// Transition a node `READY` -> `RUNNING`, timestamping the first
    /// attempt.
    pub fn mark_running(&mut self, node_id: &str) -> EngineResult<()> {
        self.ensure_running()?;
        let record = self.node_mut(node_id)?;
        if record.status != NodeStatus::Ready {
            return Err(EngineError::IllegalTransition {
                node_id: node_id.to_string(),
                reason: format!("cannot run node in status {:?}", record.status),
            });
        }
        record.status = NodeStatus::Running;
        record.started_at.get_or_insert_with(Utc::now);
        Ok(())
    }

    /// Transition a decision node `RUNNING` -> `WAITING_DECISION`.
    pub fn mark_waiting_decision(&mut self, node_id: &str) -> EngineResult<()> {
        self.ensure_running()?;
        let record = self.node_mut(node_id)?;
        if record.status != NodeStatus::Running {
            return Err(EngineError::IllegalTransition {
                node_id: node_id.to_string(),
                reason: format!("cannot wait on decision in status {:?}", record.status),
            });
        }
        record.status = NodeStatus::WaitingDecision;
        Ok(())
    }

    /// Complete a task or tool node, merging its outputs into execution
    /// state atomically. Outputs overwrite existing keys.
    pub fn complete_task(
        &mut self,
        node_id: &str,
        outputs: StateMap,
        attempts: u32,
    ) -> EngineResult<()> {
        self.ensure_running()?;
        let record = self.node_mut(node_id)?;
        if record.status != NodeStatus::Running {
            return Err(EngineError::IllegalTransition {
                node_id: node_id.to_string(),
                reason: format!("cannot complete node in status {:?}", record.status),
            });
        }
        record.status = NodeStatus::Completed;
        record.attempts = attempts;
        record.finished_at = Some(Utc::now());

        self.state.extend(outputs);
        Ok(())
    }

    /// Complete a decision node with its selected outcome. The outcome is
    /// recorded exactly once; decisions never write execution state.
    pub fn complete_decision(
        &mut self,
        node_id: &str,
        outcome: String,
        attempts: u32,
    ) -> EngineResult<()> {
        self.ensure_running()?;
        let record = self.node_mut(node_id)?;
        if !matches!(
            record.status,
            NodeStatus::Running | NodeStatus::WaitingDecision
        ) {
            return Err(EngineError::IllegalTransition {
                node_id: node_id.to_string(),
                reason: format!("cannot resolve decision in status {:?}", record.status),
            });
        }
        if record.selected_outcome.is_some() {
            return Err(EngineError::IllegalTransition {
                node_id: node_id.to_string(),
                reason: "decision outcome already recorded".to_string(),
            });
        }
        record.status = NodeStatus::Completed;
        record.attempts = attempts;
        record.selected_outcome = Some(outcome);
        record.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Fail a node and the execution with it. Remaining non-terminal nodes
    /// are skipped.
    pub fn fail_node(&mut self, node_id: &str, error: &EngineError, attempts: u32) -> EngineResult<()> {
        self.ensure_running()?;
        let code = error.code().to_string();
        let message = error.to_string();

        let record = self.node_mut(node_id)?;
        if record.status.is_terminal() {
            return Err(EngineError::IllegalTransition {
                node_id: node_id.to_string(),
                reason: format!("cannot fail node in status {:?}", record.status),
            });
        }
        record.status = NodeStatus::Failed;
        record.attempts = attempts;
        record.error = Some(message.clone());
        record.finished_at = Some(Utc::now());

        self.failure = Some(FailureRecord {
            node_id: node_id.to_string(),
            code,
            message,
        });
        self.status = ExecutionStatus::Failed;
        self.finished_at = Some(Utc::now());
        self.skip_unsettled();
        Ok(())
    }

    /// Fail the execution without attributing the failure to a node. Used
    /// for scheduler invariant breaches. No-op once terminal.
    pub fn fail(&mut self, error: &EngineError) {
        if self.status.is_terminal() {
            return;
        }
        self.failure = Some(FailureRecord {
            node_id: String::new(),
            code: error.code().to_string(),
            message: error.to_string(),
        });
        self.status = ExecutionStatus::Failed;
        self.finished_at = Some(Utc::now());
        self.skip_unsettled();
    }

    /// Cancel the execution. Idempotent once terminal.
    pub fn cancel(&mut self) {
        if self.status.is_terminal() {
            return;
        }
        self.status = ExecutionStatus::Cancelled;
        self.finished_at = Some(Utc::now());
        self.skip_unsettled();
    }

    /// Complete the execution once every node is terminal.
    pub fn finish_if_settled(&mut self) -> bool {
        if self.status != ExecutionStatus::Running || self.has_unsettled_nodes() {
            return false;
        }
        self.status = ExecutionStatus::Completed;
        self.finished_at = Some(Utc::now());
        true
    }

    /// Merge a completed subgraph's terminal state into this execution,
    /// last writer wins.
    pub fn merge_child_state(&mut self, child_state: StateMap) {
        self.state.extend(child_state);
    }

    fn skip_unsettled(&mut self) {
        let now = Utc::now();
        for record in self.nodes.values_mut() {
            if !record.status.is_terminal() {
                record.status = NodeStatus::Skipped;
                record.finished_at = Some(now);
            }
        }
    }

    fn ensure_running(&self) -> EngineResult<()> {
        if self.status != ExecutionStatus::Running {
            return Err(EngineError::IllegalTransition {
                node_id: String::new(),
                reason: format!("execution is {:?}", self.status),
            });
        }
        Ok(())
    }

    fn node_mut(&mut self, node_id: &str) -> EngineResult<&mut NodeExecution> {
        self.nodes
            .get_mut(node_id)
            .ok_or_else(|| EngineError::IllegalTransition {
                node_id: node_id.to_string(),
                reason: "node not part of this execution".to_string(),
            })
    }
}

enum EdgeState {
    Unresolved,
    Activated,
    Deactivated,
}
