//! Relay workflow definitions.
//!
//! A workflow is an immutable directed acyclic graph of typed nodes. Nodes
//! never carry logic, only the stable identifier of an external callback
//! capability that performs the work.
//!
//! This crate provides:
//! - The workflow data model (nodes, edges, retry/timeout policies)
//! - Graph validation for workflows entering the registry
//! - Condition evaluation for expression-routed decisions
//!
//! Everything here is pure and synchronous; the asynchronous execution side
//! lives in `relay-engine`.

pub mod condition;
pub mod types;
pub mod validator;

pub use condition::{evaluate, ConditionError, ConditionLanguage, StateMap};
pub use types::{
    CallbackId, DecisionSpec, Edge, Node, NodeId, NodeKind, RetryPolicy, TimeoutPolicy, Workflow,
    WorkflowId, OUTCOME_FALSE, OUTCOME_TRUE,
};
pub use validator::{
    validate, NoSubgraphs, SubgraphResolver, ValidationResult, Violation, ViolationCode,
};
