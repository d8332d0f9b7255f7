//! Graph validation.
//!
//! `validate` runs the structural checks a workflow must pass before it is
//! admitted to the registry. Checks run in a fixed order and stop at the
//! first failing check, reporting every instance that check found. The
//! function is pure and idempotent; malformed-but-parseable definitions are
//! reported as violations, never as panics.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::types::{DecisionSpec, NodeId, NodeKind, Workflow, OUTCOME_FALSE, OUTCOME_TRUE};

/// Machine-readable violation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViolationCode {
    /// Two nodes share an id.
    DuplicateNodeId,
    /// An edge references a node id that does not exist.
    UnknownEdgeEndpoint,
    /// An edge connects a node to itself.
    SelfLoop,
    /// The graph contains a cycle.
    CycleDetected,
    /// No node has zero incoming edges.
    NoStartNode,
    /// A node cannot be reached from any start node.
    UnreachableNode,
    /// A decision node has no outgoing edges.
    DanglingDecision,
    /// A task or tool node has an empty executor reference.
    MissingExecutor,
    /// A subgraph reference is empty or not registered.
    MissingSubgraph,
    /// A subgraph reference cycles back to this workflow.
    SubgraphCycle,
    /// A decision edge carries no outcome, or a condition decision does not
    /// declare exactly the true/false outcomes.
    MissingOutcome,
    /// The same outcome label guards more than one edge of a decision.
    DuplicateOutcome,
    /// An edge from a non-decision node carries an outcome label.
    UnconditionalEdgeOutcome,
}

/// A single validation violation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Violation {
    /// Violation code.
    pub code: ViolationCode,

    /// Human-readable description.
    pub message: String,

    /// Node ids involved, in graph order where that is meaningful.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<NodeId>,
}

impl Violation {
    fn new(code: ViolationCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            nodes: Vec::new(),
        }
    }

    fn with_nodes(code: ViolationCode, message: impl Into<String>, nodes: Vec<NodeId>) -> Self {
        Self {
            code,
            message: message.into(),
            nodes,
        }
    }
}

/// Outcome of validating a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    /// Violations found; empty means the workflow is valid.
    pub violations: Vec<Violation>,
}

impl ValidationResult {
    /// Whether the workflow passed every check.
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }

    /// First violation code, if any.
    pub fn first_code(&self) -> Option<ViolationCode> {
        self.violations.first().map(|v| v.code)
    }
}

/// Resolves subgraph references so the validator can walk them transitively.
pub trait SubgraphResolver {
    /// Look up a registered workflow by id and version.
    fn resolve(&self, workflow_id: &str, version: &str) -> Option<Arc<Workflow>>;
}

/// Resolver for workflows that contain no subgraph nodes.
pub struct NoSubgraphs;

impl SubgraphResolver for NoSubgraphs {
    fn resolve(&self, _workflow_id: &str, _version: &str) -> Option<Arc<Workflow>> {
        None
    }
}

impl SubgraphResolver for HashMap<(String, String), Arc<Workflow>> {
    fn resolve(&self, workflow_id: &str, version: &str) -> Option<Arc<Workflow>> {
        self.get(&(workflow_id.to_string(), version.to_string()))
            .cloned()
    }
}

/// Validate a workflow's structure.
///
/// Checks, in order: node id uniqueness; edge endpoint validity and
/// self-loops; acyclicity; start node existence; reachability; decision
/// out-degree; per-type required fields (including transitive subgraph
/// references); decision outcome consistency.
pub fn validate(workflow: &Workflow, subgraphs: &dyn SubgraphResolver) -> ValidationResult {
    let checks: [fn(&Workflow, &dyn SubgraphResolver) -> Vec<Violation>; 8] = [
        check_unique_ids,
        check_edge_endpoints,
        check_acyclic,
        check_start_nodes,
        check_reachability,
        check_decision_out_degree,
        check_node_fields,
        check_outcome_consistency,
    ];

    for check in checks {
        let violations = check(workflow, subgraphs);
        if !violations.is_empty() {
            return ValidationResult { violations };
        }
    }

    ValidationResult {
        violations: Vec::new(),
    }
}

fn check_unique_ids(workflow: &Workflow, _: &dyn SubgraphResolver) -> Vec<Violation> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut violations = Vec::new();

    for node in &workflow.nodes {
        if !seen.insert(node.id.as_str()) {
            violations.push(Violation::with_nodes(
                ViolationCode::DuplicateNodeId,
                format!("node id '{}' is declared more than once", node.id),
                vec![node.id.clone()],
            ));
        }
    }

    violations
}

fn check_edge_endpoints(workflow: &Workflow, _: &dyn SubgraphResolver) -> Vec<Violation> {
    let ids: HashSet<&str> = workflow.nodes.iter().map(|n| n.id.as_str()).collect();
    let mut violations = Vec::new();

    for edge in &workflow.edges {
        for endpoint in [&edge.from, &edge.to] {
            if !ids.contains(endpoint.as_str()) {
                violations.push(Violation::with_nodes(
                    ViolationCode::UnknownEdgeEndpoint,
                    format!(
                        "edge {} -> {} references unknown node '{}'",
                        edge.from, edge.to, endpoint
                    ),
                    vec![endpoint.clone()],
                ));
            }
        }
        if edge.from == edge.to {
            violations.push(Violation::with_nodes(
                ViolationCode::SelfLoop,
                format!("node '{}' has an edge to itself", edge.from),
                vec![edge.from.clone()],
            ));
        }
    }

    violations
}

/// Kahn's algorithm; any nodes left unsorted sit on a cycle.
fn check_acyclic(workflow: &Workflow, _: &dyn SubgraphResolver) -> Vec<Violation> {
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut in_degree: HashMap<&str, usize> = HashMap::new();

    for node in &workflow.nodes {
        adjacency.entry(node.id.as_str()).or_default();
        in_degree.entry(node.id.as_str()).or_insert(0);
    }
    for edge in &workflow.edges {
        adjacency
            .entry(edge.from.as_str())
            .or_default()
            .push(edge.to.as_str());
        *in_degree.entry(edge.to.as_str()).or_insert(0) += 1;
    }

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(&id, _)| id)
        .collect();

    let mut visited = 0usize;
    while let Some(id) = queue.pop_front() {
        visited += 1;
        if let Some(successors) = adjacency.get(id) {
            for &succ in successors {
                let degree = in_degree.get_mut(succ).expect("all nodes seeded");
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(succ);
                }
            }
        }
    }

    if visited == workflow.nodes.len() {
        return Vec::new();
    }

    let remaining: HashSet<&str> = in_degree
        .iter()
        .filter(|(_, &d)| d > 0)
        .map(|(&id, _)| id)
        .collect();
    let cycle = trace_cycle(workflow, &remaining);

    vec![Violation::with_nodes(
        ViolationCode::CycleDetected,
        format!("workflow contains a cycle: {}", cycle.join(" -> ")),
        cycle,
    )]
}

/// Walk forward through the unsorted remainder until a node repeats, then
/// return the repeated span as the offending sequence.
fn trace_cycle(workflow: &Workflow, remaining: &HashSet<&str>) -> Vec<NodeId> {
    let mut current = match remaining.iter().min() {
        Some(&id) => id,
        None => return Vec::new(),
    };

    let mut path: Vec<&str> = Vec::new();
    let mut seen: HashMap<&str, usize> = HashMap::new();

    loop {
        if let Some(&start) = seen.get(current) {
            return path[start..].iter().map(|s| s.to_string()).collect();
        }
        seen.insert(current, path.len());
        path.push(current);

        current = match workflow
            .outgoing(current)
            .map(|e| e.to.as_str())
            .find(|to| remaining.contains(to))
        {
            Some(next) => next,
            None => return path.iter().map(|s| s.to_string()).collect(),
        };
    }
}

fn check_start_nodes(workflow: &Workflow, _: &dyn SubgraphResolver) -> Vec<Violation> {
    if workflow.nodes.is_empty() || !workflow.start_nodes().is_empty() {
        return Vec::new();
    }

    vec![Violation::new(
        ViolationCode::NoStartNode,
        "no node with zero incoming edges exists",
    )]
}

fn check_reachability(workflow: &Workflow, _: &dyn SubgraphResolver) -> Vec<Violation> {
    let mut reached: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = workflow
        .start_nodes()
        .iter()
        .map(|n| n.id.as_str())
        .collect();
    reached.extend(queue.iter().copied());

    while let Some(id) = queue.pop_front() {
        for edge in workflow.outgoing(id) {
            if reached.insert(edge.to.as_str()) {
                queue.push_back(edge.to.as_str());
            }
        }
    }

    workflow
        .nodes
        .iter()
        .filter(|n| !reached.contains(n.id.as_str()))
        .map(|n| {
            Violation::with_nodes(
                ViolationCode::UnreachableNode,
                format!("node '{}' is not reachable from any start node", n.id),
                vec![n.id.clone()],
            )
        })
        .collect()
}

fn check_decision_out_degree(workflow: &Workflow, _: &dyn SubgraphResolver) -> Vec<Violation> {
    workflow
        .nodes
        .iter()
        .filter(|n| matches!(n.kind, NodeKind::Decision { .. }))
        .filter(|n| workflow.outgoing(&n.id).next().is_none())
        .map(|n| {
            Violation::with_nodes(
                ViolationCode::DanglingDecision,
                format!("decision node '{}' has no outgoing edges", n.id),
                vec![n.id.clone()],
            )
        })
        .collect()
}

fn check_node_fields(workflow: &Workflow, subgraphs: &dyn SubgraphResolver) -> Vec<Violation> {
    let mut violations = Vec::new();

    for node in &workflow.nodes {
        match &node.kind {
            NodeKind::Task { executor } | NodeKind::Tool { executor } => {
                if executor.is_empty() {
                    violations.push(Violation::with_nodes(
                        ViolationCode::MissingExecutor,
                        format!("{} node '{}' has an empty executor", node.kind.label(), node.id),
                        vec![node.id.clone()],
                    ));
                }
            }
            NodeKind::Decision { decider } => {
                if let DecisionSpec::Callback { callback } = decider {
                    if callback.is_empty() {
                        violations.push(Violation::with_nodes(
                            ViolationCode::MissingExecutor,
                            format!("decision node '{}' has an empty callback", node.id),
                            vec![node.id.clone()],
                        ));
                    }
                }
            }
            NodeKind::Subgraph {
                workflow_id,
                workflow_version,
            } => {
                if workflow_id.is_empty() {
                    violations.push(Violation::with_nodes(
                        ViolationCode::MissingSubgraph,
                        format!("subgraph node '{}' has an empty workflow reference", node.id),
                        vec![node.id.clone()],
                    ));
                    continue;
                }
                violations.extend(check_subgraph_reference(
                    workflow,
                    &node.id,
                    workflow_id,
                    workflow_version,
                    subgraphs,
                ));
            }
        }
    }

    violations
}

/// Follow a subgraph reference transitively, rejecting unresolvable
/// references and reference chains that return to this workflow.
fn check_subgraph_reference(
    workflow: &Workflow,
    node_id: &str,
    target_id: &str,
    target_version: &str,
    subgraphs: &dyn SubgraphResolver,
) -> Vec<Violation> {
    let own_key = (workflow.id.clone(), workflow.version.clone());
    let mut visited: HashSet<(String, String)> = HashSet::new();
    let mut queue: VecDeque<(String, String)> =
        VecDeque::from([(target_id.to_string(), target_version.to_string())]);

    while let Some(key) = queue.pop_front() {
        if key == own_key {
            return vec![Violation::with_nodes(
                ViolationCode::SubgraphCycle,
                format!(
                    "subgraph node '{}' references '{}' v{}, which leads back to this workflow",
                    node_id, target_id, target_version
                ),
                vec![node_id.to_string()],
            )];
        }
        if !visited.insert(key.clone()) {
            continue;
        }

        let resolved = match subgraphs.resolve(&key.0, &key.1) {
            Some(wf) => wf,
            None => {
                return vec![Violation::with_nodes(
                    ViolationCode::MissingSubgraph,
                    format!(
                        "subgraph node '{}' references unregistered workflow '{}' v{}",
                        node_id, key.0, key.1
                    ),
                    vec![node_id.to_string()],
                )];
            }
        };

        for nested in &resolved.nodes {
            if let NodeKind::Subgraph {
                workflow_id,
                workflow_version,
            } = &nested.kind
            {
                queue.push_back((workflow_id.clone(), workflow_version.clone()));
            }
        }
    }

    Vec::new()
}

fn check_outcome_consistency(workflow: &Workflow, _: &dyn SubgraphResolver) -> Vec<Violation> {
    let mut violations = Vec::new();

    for node in &workflow.nodes {
        let decider = match &node.kind {
            NodeKind::Decision { decider } => Some(decider),
            _ => None,
        };

        if decider.is_none() {
            for edge in workflow.outgoing(&node.id) {
                if let Some(outcome) = &edge.outcome {
                    violations.push(Violation::with_nodes(
                        ViolationCode::UnconditionalEdgeOutcome,
                        format!(
                            "edge {} -> {} carries outcome '{}' but '{}' is not a decision",
                            edge.from, edge.to, outcome, node.id
                        ),
                        vec![node.id.clone()],
                    ));
                }
            }
            continue;
        }

        let mut labels: HashSet<&str> = HashSet::new();
        for edge in workflow.outgoing(&node.id) {
            match &edge.outcome {
                None => violations.push(Violation::with_nodes(
                    ViolationCode::MissingOutcome,
                    format!(
                        "edge {} -> {} from decision '{}' carries no outcome",
                        edge.from, edge.to, node.id
                    ),
                    vec![node.id.clone()],
                )),
                Some(outcome) => {
                    if !labels.insert(outcome.as_str()) {
                        violations.push(Violation::with_nodes(
                            ViolationCode::DuplicateOutcome,
                            format!(
                                "outcome '{}' guards more than one edge of decision '{}'",
                                outcome, node.id
                            ),
                            vec![node.id.clone()],
                        ));
                    }
                }
            }
        }

        if let Some(DecisionSpec::Condition { .. }) = decider {
            let expected: HashSet<&str> = [OUTCOME_TRUE, OUTCOME_FALSE].into();
            if labels != expected {
                violations.push(Violation::with_nodes(
                    ViolationCode::MissingOutcome,
                    format!(
                        "condition decision '{}' must declare exactly the outcomes '{}' and '{}'",
                        node.id, OUTCOME_TRUE, OUTCOME_FALSE
                    ),
                    vec![node.id.clone()],
                ));
            }
        }
    }

    violations
}
