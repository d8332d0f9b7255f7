//! Relay execution engine.
//!
//! Executes registered workflow definitions from `relay-workflow`. The
//! engine owns orchestration only: readiness, ordering, retries, timeouts,
//! and state transitions. All actual work is delegated to callbacks
//! registered in the [`registry::CallbackRegistry`].
//!
//! Typical wiring:
//! 1. Register workflows in a [`store::WorkflowStore`] (validated on entry)
//! 2. Register task and decision callbacks in a `CallbackRegistry`
//! 3. Start executions through a [`scheduler::Scheduler`] and observe them
//!    via the returned [`scheduler::ExecutionHandle`]

pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod execution;
pub mod http;
pub mod registry;
pub mod scheduler;
pub mod store;

pub use config::EngineConfig;
pub use dispatch::{DecisionDispatcher, DecisionOutcome, DispatchFailure};
pub use error::{EngineError, EngineResult};
pub use events::{ChannelSink, EventSink, ExecutionEvent, NoopSink};
pub use execution::{Execution, ExecutionStatus, FailureRecord, NodeExecution, NodeStatus};
pub use http::HttpCallback;
pub use registry::{
    CallbackFailure, CallbackRegistry, CompletionStatus, DecisionCallback, DecisionRequest,
    DecisionResponse, TaskCallback, TaskCompletion, TaskRequest,
};
pub use scheduler::{ExecutionHandle, Scheduler};
pub use store::WorkflowStore;
