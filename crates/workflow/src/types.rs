//! Workflow data model.
//!
//! Definitions are plain serde structs so callers can parse them from any
//! transport. A workflow is immutable once registered; node ids never change
//! after creation.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::condition::ConditionLanguage;

/// Stable identifier of a registered callback capability.
pub type CallbackId = String;

/// Node identifier, unique within a workflow.
pub type NodeId = String;

/// Workflow identifier.
pub type WorkflowId = String;

/// Outcome label produced by a condition decision that evaluated to true.
pub const OUTCOME_TRUE: &str = "true";

/// Outcome label produced by a condition decision that evaluated to false.
pub const OUTCOME_FALSE: &str = "false";

/// An immutable workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// Workflow identifier.
    pub id: WorkflowId,

    /// Semantic version of this definition.
    pub version: String,

    /// Human-readable name.
    pub name: String,

    /// Ordered node set; ids must be unique.
    pub nodes: Vec<Node>,

    /// Directed edges between nodes.
    #[serde(default)]
    pub edges: Vec<Edge>,

    /// Declared input schema.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<serde_json::Value>,

    /// Declared output schema.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<serde_json::Value>,
}

impl Workflow {
    /// Look up a node by id.
    pub fn get_node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Edges leaving the given node.
    pub fn outgoing<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.from == id)
    }

    /// Edges entering the given node.
    pub fn incoming<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.to == id)
    }

    /// Nodes with no incoming edges.
    pub fn start_nodes(&self) -> Vec<&Node> {
        self.nodes
            .iter()
            .filter(|n| self.incoming(&n.id).next().is_none())
            .collect()
    }

    /// The set of outcome labels declared on a decision node's outgoing
    /// edges, in edge order.
    pub fn declared_outcomes(&self, node_id: &str) -> Vec<String> {
        self.outgoing(node_id)
            .filter_map(|e| e.outcome.clone())
            .collect()
    }
}

/// A single unit of the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Node identifier, immutable post-creation.
    pub id: NodeId,

    /// Display name.
    pub name: String,

    /// Node variant.
    #[serde(flatten)]
    pub kind: NodeKind,

    /// Retry policy for this node's external calls.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,

    /// Timeout policy for this node's external calls.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<TimeoutPolicy>,
}

/// Closed set of node variants.
///
/// Dispatch matches exhaustively on this enum; adding a variant is a
/// breaking schema change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    /// Delegates work to an external task executor. May write execution
    /// state through its completion outputs.
    Task {
        /// Callback capability that executes this task.
        executor: CallbackId,
    },

    /// Delegates work to an external tool executor. Same contract as Task.
    Tool {
        /// Callback capability that executes this tool.
        executor: CallbackId,
    },

    /// Selects an outgoing edge by outcome label. Read-only: a decision
    /// never mutates execution state.
    Decision {
        /// How the outcome is resolved.
        decider: DecisionSpec,
    },

    /// Runs another registered workflow and merges its terminal state into
    /// the parent on completion.
    Subgraph {
        /// Referenced workflow id.
        workflow_id: WorkflowId,
        /// Referenced workflow version.
        workflow_version: String,
    },
}

impl NodeKind {
    /// Short label used in logs.
    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::Task { .. } => "task",
            NodeKind::Tool { .. } => "tool",
            NodeKind::Decision { .. } => "decision",
            NodeKind::Subgraph { .. } => "subgraph",
        }
    }
}

/// How a decision node resolves its outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DecisionSpec {
    /// Evaluate an expression against execution state. Outcomes are the
    /// fixed labels `"true"` and `"false"`.
    Condition {
        /// Expression document in the declared language.
        expression: serde_json::Value,
        /// Expression grammar.
        #[serde(default)]
        language: ConditionLanguage,
    },

    /// Ask an external callback to choose among the outcomes declared on
    /// the node's outgoing edges.
    Callback {
        /// Callback capability that makes the decision.
        callback: CallbackId,
    },
}

/// A directed edge, optionally guarded by a decision outcome label.
///
/// Self-loops are forbidden. Edges leaving a decision node must carry an
/// outcome; edges leaving any other node must not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    /// Source node id.
    pub from: NodeId,

    /// Target node id.
    pub to: NodeId,

    /// Outcome label guarding this edge.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
}

impl Edge {
    /// Unconditional edge between two nodes.
    pub fn new(from: &str, to: &str) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
            outcome: None,
        }
    }

    /// Edge guarded by a decision outcome.
    pub fn with_outcome(from: &str, to: &str, outcome: &str) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
            outcome: Some(outcome.to_string()),
        }
    }
}

/// Retry policy for a node's external calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial delay between retries in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Exponential backoff multiplier.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    10000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before the first retry.
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    /// The delay following `current`, multiplied and capped.
    pub fn next_delay(&self, current: Duration) -> Duration {
        let scaled = current.as_millis() as f64 * self.backoff_multiplier;
        Duration::from_millis((scaled as u64).min(self.max_delay_ms))
    }
}

/// Timeout policy for a node's external calls.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimeoutPolicy {
    /// Seconds before a single attempt is abandoned.
    pub timeout_seconds: u64,
}

impl TimeoutPolicy {
    /// The timeout as a `Duration`.
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}
