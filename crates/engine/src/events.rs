//! Execution lifecycle events.
//!
//! The scheduler emits an event for every observable transition. Sinks are
//! pluggable; the default sink drops everything.

use chrono::{DateTime, Utc};
use relay_workflow::NodeId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single observable transition during an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExecutionEvent {
    ExecutionStarted {
        execution_id: Uuid,
        workflow_id: String,
        timestamp: DateTime<Utc>,
    },
    NodeStarted {
        execution_id: Uuid,
        node_id: NodeId,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },
    NodeCompleted {
        execution_id: Uuid,
        node_id: NodeId,
        attempts: u32,
        timestamp: DateTime<Utc>,
    },
    NodeFailed {
        execution_id: Uuid,
        node_id: NodeId,
        error_code: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
    NodeSkipped {
        execution_id: Uuid,
        node_id: NodeId,
        timestamp: DateTime<Utc>,
    },
    DecisionResolved {
        execution_id: Uuid,
        node_id: NodeId,
        outcome: String,
        timestamp: DateTime<Utc>,
    },
    ExecutionCompleted {
        execution_id: Uuid,
        timestamp: DateTime<Utc>,
    },
    ExecutionFailed {
        execution_id: Uuid,
        error_code: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
    ExecutionCancelled {
        execution_id: Uuid,
        timestamp: DateTime<Utc>,
    },
}

/// Receives execution events. Emission is fire-and-forget; a slow or broken
/// sink must never block the scheduler.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: ExecutionEvent);
}

/// Sink that discards every event.
#[derive(Debug, Default)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: ExecutionEvent) {}
}

/// Sink that forwards events over an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: tokio::sync::mpsc::UnboundedSender<ExecutionEvent>,
}

impl ChannelSink {
    /// Create a sink and the receiver that drains it.
    pub fn new() -> (Self, tokio::sync::mpsc::UnboundedReceiver<ExecutionEvent>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: ExecutionEvent) {
        // Receiver may be gone; events are best-effort.
        let _ = self.tx.send(event);
    }
}
