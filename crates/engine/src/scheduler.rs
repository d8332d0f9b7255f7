//! Execution scheduler.
//!
//! Drives one execution at a time from a background task: promotes nodes
//! whose dependencies settled, runs them concurrently up to the configured
//! limit, applies their results under the execution lock, and finishes the
//! execution when every node is terminal. Cancellation is cooperative via a
//! [`CancellationToken`]; results arriving after an execution turned
//! terminal are discarded.

use std::sync::Arc;

use chrono::Utc;
use relay_workflow::{
    evaluate, DecisionSpec, Node, NodeKind, StateMap, Workflow, OUTCOME_FALSE, OUTCOME_TRUE,
};
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::dispatch::DecisionDispatcher;
use crate::error::{EngineError, EngineResult};
use crate::events::{EventSink, ExecutionEvent, NoopSink};
use crate::execution::{Execution, ExecutionStatus, FailureRecord, NodeStatus};
use crate::registry::{CallbackFailure, CallbackRegistry, DecisionRequest, TaskRequest};
use crate::registry::CompletionStatus;
use crate::store::WorkflowStore;

/// Schedules and drives workflow executions.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    store: Arc<WorkflowStore>,
    registry: Arc<CallbackRegistry>,
    config: EngineConfig,
    events: Arc<dyn EventSink>,
}

/// Handle to a running execution.
#[derive(Debug, Clone)]
pub struct ExecutionHandle {
    id: Uuid,
    execution: Arc<Mutex<Execution>>,
    cancel: CancellationToken,
    status_rx: watch::Receiver<ExecutionStatus>,
}

impl ExecutionHandle {
    /// Execution id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Current execution status.
    pub async fn status(&self) -> ExecutionStatus {
        self.execution.lock().await.status()
    }

    /// Copy of the current key-value state.
    pub async fn state_snapshot(&self) -> StateMap {
        self.execution.lock().await.state_snapshot()
    }

    /// Status of one node.
    pub async fn node_status(&self, node_id: &str) -> Option<NodeStatus> {
        self.execution.lock().await.node_status(node_id)
    }

    /// Attempts recorded for one node.
    pub async fn node_attempts(&self, node_id: &str) -> Option<u32> {
        self.execution.lock().await.node(node_id).map(|n| n.attempts)
    }

    /// Outcome a decision node selected, once resolved.
    pub async fn selected_outcome(&self, node_id: &str) -> Option<String> {
        self.execution
            .lock()
            .await
            .node(node_id)
            .and_then(|n| n.selected_outcome.clone())
    }

    /// Nodes that are ready, running, or waiting on a decision.
    pub async fn active_nodes(&self) -> Vec<String> {
        self.execution.lock().await.active_nodes()
    }

    /// Why the execution failed, if it did.
    pub async fn failure(&self) -> Option<FailureRecord> {
        self.execution.lock().await.failure().cloned()
    }

    /// Request cancellation. Returns immediately; `wait` observes the
    /// terminal status.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait until the execution reaches a terminal status.
    pub async fn wait(&self) -> ExecutionStatus {
        let mut rx = self.status_rx.clone();
        loop {
            let status = *rx.borrow_and_update();
            if status.is_terminal() {
                return status;
            }
            if rx.changed().await.is_err() {
                return *rx.borrow();
            }
        }
    }
}

/// Outcome of one node task, applied under the execution lock.
enum NodeResult {
    Completed {
        node_id: String,
        outputs: StateMap,
        attempts: u32,
    },
    Decided {
        node_id: String,
        outcome: String,
        attempts: u32,
    },
    Failed {
        node_id: String,
        error: EngineError,
        attempts: u32,
    },
}

struct NodeCtx {
    scheduler: Scheduler,
    execution: Arc<Mutex<Execution>>,
    execution_id: Uuid,
    node: Node,
    cancel: CancellationToken,
    semaphore: Arc<Semaphore>,
}

impl Scheduler {
    pub fn new(store: Arc<WorkflowStore>, registry: Arc<CallbackRegistry>) -> Self {
        Self::with_events(store, registry, EngineConfig::default(), Arc::new(NoopSink))
    }

    pub fn with_events(
        store: Arc<WorkflowStore>,
        registry: Arc<CallbackRegistry>,
        config: EngineConfig,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                store,
                registry,
                config,
                events,
            }),
        }
    }

    /// Start an execution of a registered workflow.
    pub fn start(
        &self,
        workflow_id: &str,
        version: &str,
        input: StateMap,
    ) -> EngineResult<ExecutionHandle> {
        let workflow = self.inner.store.get(workflow_id, version)?;
        self.launch(workflow, input, CancellationToken::new())
    }

    fn launch(
        &self,
        workflow: Arc<Workflow>,
        input: StateMap,
        cancel: CancellationToken,
    ) -> EngineResult<ExecutionHandle> {
        let mut execution = Execution::new(workflow.clone(), input);
        execution.start()?;
        let execution_id = execution.id;

        info!(
            execution_id = %execution_id,
            workflow_id = %workflow.id,
            version = %workflow.version,
            "Starting execution"
        );
        self.emit(ExecutionEvent::ExecutionStarted {
            execution_id,
            workflow_id: workflow.id.clone(),
            timestamp: Utc::now(),
        });

        let execution = Arc::new(Mutex::new(execution));
        let (status_tx, status_rx) = watch::channel(ExecutionStatus::Running);

        let handle = ExecutionHandle {
            id: execution_id,
            execution: execution.clone(),
            cancel: cancel.clone(),
            status_rx,
        };

        let scheduler = self.clone();
        tokio::spawn(async move {
            scheduler
                .drive(execution, workflow, cancel, status_tx)
                .await;
        });

        Ok(handle)
    }

    async fn drive(
        self,
        execution: Arc<Mutex<Execution>>,
        workflow: Arc<Workflow>,
        cancel: CancellationToken,
        status_tx: watch::Sender<ExecutionStatus>,
    ) {
        let execution_id = { execution.lock().await.id };
        let semaphore = Arc::new(Semaphore::new(self.inner.config.max_concurrent_nodes));
        let mut join_set: JoinSet<NodeResult> = JoinSet::new();

        let final_status = loop {
            let (ready, skipped) = {
                let mut ex = execution.lock().await;
                ex.promote_ready()
            };

            for node_id in &skipped {
                self.emit(ExecutionEvent::NodeSkipped {
                    execution_id,
                    node_id: node_id.clone(),
                    timestamp: Utc::now(),
                });
            }

            for node_id in ready {
                let node = match workflow.get_node(&node_id) {
                    Some(node) => node.clone(),
                    None => continue,
                };
                if execution.lock().await.mark_running(&node_id).is_err() {
                    continue;
                }
                let ctx = NodeCtx {
                    scheduler: self.clone(),
                    execution: execution.clone(),
                    execution_id,
                    node,
                    cancel: cancel.clone(),
                    semaphore: semaphore.clone(),
                };
                join_set.spawn(run_node(ctx));
            }

            {
                let mut ex = execution.lock().await;
                if ex.finish_if_settled() {
                    drop(ex);
                    info!(execution_id = %execution_id, "Execution completed");
                    self.emit(ExecutionEvent::ExecutionCompleted {
                        execution_id,
                        timestamp: Utc::now(),
                    });
                    break ExecutionStatus::Completed;
                }
                if ex.status().is_terminal() {
                    break ex.status();
                }
            }

            if join_set.is_empty() {
                // Nothing in flight and nothing promotable: validated
                // graphs cannot reach this, but never spin.
                warn!(execution_id = %execution_id, "Scheduler stalled with unsettled nodes");
                let error = EngineError::Execution {
                    node_id: String::new(),
                    reason: "no runnable node while unsettled nodes remain".to_string(),
                };
                let status = {
                    let mut ex = execution.lock().await;
                    ex.fail(&error);
                    ex.status()
                };
                self.emit(ExecutionEvent::ExecutionFailed {
                    execution_id,
                    error_code: error.code().to_string(),
                    error: error.to_string(),
                    timestamp: Utc::now(),
                });
                break status;
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    let status = {
                        let mut ex = execution.lock().await;
                        ex.cancel();
                        ex.status()
                    };
                    info!(execution_id = %execution_id, "Execution cancelled");
                    self.emit(ExecutionEvent::ExecutionCancelled {
                        execution_id,
                        timestamp: Utc::now(),
                    });
                    break status;
                }
                joined = join_set.join_next() => {
                    let result = match joined {
                        Some(Ok(result)) => result,
                        Some(Err(join_error)) => {
                            debug!(execution_id = %execution_id, error = %join_error, "Node task panicked");
                            continue;
                        }
                        None => continue,
                    };
                    self.apply(&execution, execution_id, result).await;
                }
            }
        };

        // In-flight callback invocations are never forcibly aborted: detach
        // them so they run to completion, and let their late results be
        // discarded against the now-terminal execution.
        join_set.detach_all();
        let _ = status_tx.send(final_status);
    }

    /// Apply one node result. Results for executions that already turned
    /// terminal are discarded.
    async fn apply(
        &self,
        execution: &Arc<Mutex<Execution>>,
        execution_id: Uuid,
        result: NodeResult,
    ) {
        match result {
            NodeResult::Completed {
                node_id,
                outputs,
                attempts,
            } => {
                let applied = {
                    let mut ex = execution.lock().await;
                    ex.complete_task(&node_id, outputs, attempts)
                };
                match applied {
                    Ok(()) => self.emit(ExecutionEvent::NodeCompleted {
                        execution_id,
                        node_id,
                        attempts,
                        timestamp: Utc::now(),
                    }),
                    Err(_) => {
                        debug!(execution_id = %execution_id, node_id = %node_id, "Discarding late node result");
                    }
                }
            }
            NodeResult::Decided {
                node_id,
                outcome,
                attempts,
            } => {
                let applied = {
                    let mut ex = execution.lock().await;
                    ex.complete_decision(&node_id, outcome.clone(), attempts)
                };
                match applied {
                    Ok(()) => {
                        self.emit(ExecutionEvent::DecisionResolved {
                            execution_id,
                            node_id: node_id.clone(),
                            outcome,
                            timestamp: Utc::now(),
                        });
                        self.emit(ExecutionEvent::NodeCompleted {
                            execution_id,
                            node_id,
                            attempts,
                            timestamp: Utc::now(),
                        });
                    }
                    Err(_) => {
                        debug!(execution_id = %execution_id, node_id = %node_id, "Discarding late decision result");
                    }
                }
            }
            NodeResult::Failed {
                node_id,
                error,
                attempts,
            } => {
                let applied = {
                    let mut ex = execution.lock().await;
                    ex.fail_node(&node_id, &error, attempts)
                };
                match applied {
                    Ok(()) => {
                        warn!(
                            execution_id = %execution_id,
                            node_id = %node_id,
                            error = %error,
                            "Node failed, failing execution"
                        );
                        self.emit(ExecutionEvent::NodeFailed {
                            execution_id,
                            node_id,
                            error_code: error.code().to_string(),
                            error: error.to_string(),
                            timestamp: Utc::now(),
                        });
                        self.emit(ExecutionEvent::ExecutionFailed {
                            execution_id,
                            error_code: error.code().to_string(),
                            error: error.to_string(),
                            timestamp: Utc::now(),
                        });
                    }
                    Err(_) => {
                        debug!(execution_id = %execution_id, node_id = %node_id, "Discarding late node failure");
                    }
                }
            }
        }
    }

    fn emit(&self, event: ExecutionEvent) {
        self.inner.events.emit(event);
    }
}

/// Run one node to a result. Never touches execution state directly except
/// to snapshot it and to mark callback decisions as waiting.
async fn run_node(ctx: NodeCtx) -> NodeResult {
    let _permit = ctx.semaphore.clone().acquire_owned().await.ok();
    let node_id = ctx.node.id.clone();

    match &ctx.node.kind {
        NodeKind::Task { executor } | NodeKind::Tool { executor } => {
            run_external_task(&ctx, executor.clone()).await
        }
        NodeKind::Decision { decider } => match decider.clone() {
            DecisionSpec::Condition {
                expression,
                language,
            } => {
                ctx.scheduler.emit(ExecutionEvent::NodeStarted {
                    execution_id: ctx.execution_id,
                    node_id: node_id.clone(),
                    attempt: 1,
                    timestamp: Utc::now(),
                });
                let state = ctx.execution.lock().await.state_snapshot();
                match evaluate(&expression, language, &state) {
                    Ok(true) => NodeResult::Decided {
                        node_id,
                        outcome: OUTCOME_TRUE.to_string(),
                        attempts: 1,
                    },
                    Ok(false) => NodeResult::Decided {
                        node_id,
                        outcome: OUTCOME_FALSE.to_string(),
                        attempts: 1,
                    },
                    Err(source) => NodeResult::Failed {
                        node_id: node_id.clone(),
                        error: EngineError::ConditionEvaluation { node_id, source },
                        attempts: 1,
                    },
                }
            }
            DecisionSpec::Callback { callback } => run_callback_decision(&ctx, callback).await,
        },
        NodeKind::Subgraph {
            workflow_id,
            workflow_version,
        } => run_subgraph(&ctx, workflow_id.clone(), workflow_version.clone()).await,
    }
}

async fn run_external_task(ctx: &NodeCtx, executor: String) -> NodeResult {
    let node_id = ctx.node.id.clone();
    let callback = match ctx.scheduler.inner.registry.task(&executor) {
        Some(callback) => callback,
        None => {
            return NodeResult::Failed {
                node_id,
                error: EngineError::CallbackNotFound(executor),
                attempts: 0,
            };
        }
    };

    let retry = ctx
        .node
        .retry
        .clone()
        .unwrap_or_else(|| ctx.scheduler.inner.config.default_retry.clone());
    let timeout = ctx
        .node
        .timeout
        .map(|t| t.duration())
        .unwrap_or(ctx.scheduler.inner.config.default_task_timeout);

    let mut delay = retry.initial_delay();
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        ctx.scheduler.emit(ExecutionEvent::NodeStarted {
            execution_id: ctx.execution_id,
            node_id: node_id.clone(),
            attempt: attempts,
            timestamp: Utc::now(),
        });

        let state = ctx.execution.lock().await.state_snapshot();
        let request = TaskRequest {
            execution_id: ctx.execution_id,
            node_id: node_id.clone(),
            state,
        };

        let error = match tokio::time::timeout(timeout, callback.invoke(request)).await {
            Ok(Ok(completion)) if completion.status == CompletionStatus::Completed => {
                return NodeResult::Completed {
                    node_id,
                    outputs: completion.outputs,
                    attempts,
                };
            }
            // Failed attempts commit nothing; outputs are dropped here.
            Ok(Ok(completion)) => EngineError::Execution {
                node_id: node_id.clone(),
                reason: completion
                    .error
                    .unwrap_or_else(|| "callback reported failure".to_string()),
            },
            Ok(Err(CallbackFailure::Transport(reason))) => EngineError::Execution {
                node_id: node_id.clone(),
                reason,
            },
            Ok(Err(CallbackFailure::Rejected(reason))) => {
                return NodeResult::Failed {
                    node_id: node_id.clone(),
                    error: EngineError::Execution { node_id, reason },
                    attempts,
                };
            }
            Err(_) => EngineError::Execution {
                node_id: node_id.clone(),
                reason: format!("attempt timed out after {}s", timeout.as_secs()),
            },
        };

        if attempts > retry.max_retries {
            let error = if retry.max_retries == 0 {
                error
            } else {
                EngineError::RetryExhausted {
                    node_id: node_id.clone(),
                    attempts,
                    last_error: error.to_string(),
                }
            };
            return NodeResult::Failed {
                node_id,
                error,
                attempts,
            };
        }

        warn!(
            node_id = %node_id,
            attempt = attempts,
            max_retries = retry.max_retries,
            error = %error,
            "Task attempt failed, retrying"
        );
        tokio::time::sleep(delay).await;
        delay = retry.next_delay(delay);
    }
}

async fn run_callback_decision(ctx: &NodeCtx, callback_id: String) -> NodeResult {
    let node_id = ctx.node.id.clone();

    ctx.scheduler.emit(ExecutionEvent::NodeStarted {
        execution_id: ctx.execution_id,
        node_id: node_id.clone(),
        attempt: 1,
        timestamp: Utc::now(),
    });

    let callback = match ctx.scheduler.inner.registry.decision(&callback_id) {
        Some(callback) => callback,
        None => {
            return NodeResult::Failed {
                node_id,
                error: EngineError::CallbackNotFound(callback_id),
                attempts: 0,
            };
        }
    };

    let (state, possible_outcomes) = {
        let mut ex = ctx.execution.lock().await;
        if ex.mark_waiting_decision(&node_id).is_err() {
            return NodeResult::Failed {
                node_id: node_id.clone(),
                error: EngineError::Cancelled,
                attempts: 0,
            };
        }
        (
            ex.state_snapshot(),
            ex.workflow.declared_outcomes(&node_id),
        )
    };

    let retry = ctx
        .node
        .retry
        .clone()
        .unwrap_or_else(|| ctx.scheduler.inner.config.default_retry.clone());
    let timeout = ctx
        .node
        .timeout
        .map(|t| t.duration())
        .unwrap_or(ctx.scheduler.inner.config.default_decision_timeout);

    let dispatcher = DecisionDispatcher::new(timeout, retry);
    let request = DecisionRequest {
        execution_id: ctx.execution_id,
        node_id: node_id.clone(),
        state,
        possible_outcomes,
    };

    match dispatcher.dispatch(callback, request).await {
        Ok(outcome) => NodeResult::Decided {
            node_id,
            outcome: outcome.outcome,
            attempts: outcome.attempts,
        },
        Err(failure) => NodeResult::Failed {
            node_id,
            error: failure.error,
            attempts: failure.attempts,
        },
    }
}

async fn run_subgraph(ctx: &NodeCtx, workflow_id: String, workflow_version: String) -> NodeResult {
    let node_id = ctx.node.id.clone();

    ctx.scheduler.emit(ExecutionEvent::NodeStarted {
        execution_id: ctx.execution_id,
        node_id: node_id.clone(),
        attempt: 1,
        timestamp: Utc::now(),
    });

    let child_workflow = match ctx.scheduler.inner.store.get(&workflow_id, &workflow_version) {
        Ok(workflow) => workflow,
        Err(error) => {
            return NodeResult::Failed {
                node_id,
                error,
                attempts: 1,
            };
        }
    };

    let input = ctx.execution.lock().await.state_snapshot();
    let child = match ctx
        .scheduler
        .launch(child_workflow, input, ctx.cancel.child_token())
    {
        Ok(handle) => handle,
        Err(error) => {
            return NodeResult::Failed {
                node_id,
                error,
                attempts: 1,
            };
        }
    };

    match child.wait().await {
        ExecutionStatus::Completed => NodeResult::Completed {
            node_id,
            outputs: child.state_snapshot().await,
            attempts: 1,
        },
        ExecutionStatus::Cancelled => NodeResult::Failed {
            node_id,
            error: EngineError::Cancelled,
            attempts: 1,
        },
        _ => {
            let reason = child
                .failure()
                .await
                .map(|f| f.message)
                .unwrap_or_else(|| "subgraph execution failed".to_string());
            NodeResult::Failed {
                node_id: node_id.clone(),
                error: EngineError::Execution { node_id, reason },
                attempts: 1,
            }
        }
    }
}
