//! Workflow registry.
//!
//! Registered definitions are immutable; re-registering the same id and
//! version is a conflict rather than an overwrite. Registration validates
//! the definition, resolving subgraph references against everything
//! registered so far.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use relay_workflow::{validate, SubgraphResolver, Workflow};
use tracing::info;

use crate::error::{EngineError, EngineResult};

/// In-memory store of validated workflow definitions.
#[derive(Debug, Default)]
pub struct WorkflowStore {
    workflows: RwLock<HashMap<(String, String), Arc<Workflow>>>,
}

impl WorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and register a workflow.
    ///
    /// Fails with a conflict when the id and version are already taken, and
    /// with the validation result when the graph is rejected.
    pub fn register(&self, workflow: Workflow) -> EngineResult<Arc<Workflow>> {
        let key = (workflow.id.clone(), workflow.version.clone());

        {
            let workflows = self.workflows.read().expect("store lock poisoned");
            if workflows.contains_key(&key) {
                return Err(EngineError::WorkflowConflict {
                    id: key.0,
                    version: key.1,
                });
            }
        }

        // Validate without holding the lock; the resolver takes its own
        // read locks while walking subgraph references.
        let result = validate(&workflow, self);
        if !result.is_valid() {
            return Err(EngineError::Validation(result));
        }

        let workflow = Arc::new(workflow);
        let mut workflows = self.workflows.write().expect("store lock poisoned");
        if workflows.contains_key(&key) {
            return Err(EngineError::WorkflowConflict {
                id: key.0,
                version: key.1,
            });
        }
        workflows.insert(key, workflow.clone());

        info!(
            workflow_id = %workflow.id,
            version = %workflow.version,
            nodes = workflow.nodes.len(),
            "Registered workflow"
        );
        Ok(workflow)
    }

    /// Fetch a registered workflow.
    pub fn get(&self, id: &str, version: &str) -> EngineResult<Arc<Workflow>> {
        self.resolve(id, version)
            .ok_or_else(|| EngineError::WorkflowNotFound {
                id: id.to_string(),
                version: version.to_string(),
            })
    }
}

impl SubgraphResolver for WorkflowStore {
    fn resolve(&self, workflow_id: &str, version: &str) -> Option<Arc<Workflow>> {
        self.workflows
            .read()
            .expect("store lock poisoned")
            .get(&(workflow_id.to_string(), version.to_string()))
            .cloned()
    }
}
