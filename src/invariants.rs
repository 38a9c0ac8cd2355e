use std::collections::HashSet;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::error::{LibError, Result};
use crate::models::{Edge, EdgeId, Node, NodeId};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GraphInvariantViolation {
    /// A semantic endpoint of an edge does not exist in the same graph.
    UnknownNodeReference {
        edge_id: EdgeId,
        missing_node_id: NodeId,
    },
    /// A display endpoint of an edge does not exist in the same graph.
    UnknownDisplayReference {
        edge_id: EdgeId,
        missing_node_id: NodeId,
    },
    DuplicateNodeId {
        node_id: NodeId,
    },
    DuplicateEdgeId {
        edge_id: EdgeId,
    },
}

impl GraphInvariantViolation {
    pub const fn error_code(&self) -> &'static str {
        match self {
            GraphInvariantViolation::UnknownNodeReference { .. } => "graph_unknown_node_reference",
            GraphInvariantViolation::UnknownDisplayReference { .. } => {
                "graph_unknown_display_reference"
            }
            GraphInvariantViolation::DuplicateNodeId { .. } => "graph_duplicate_node_id",
            GraphInvariantViolation::DuplicateEdgeId { .. } => "graph_duplicate_edge_id",
        }
    }

    pub const fn public_message(&self) -> &'static str {
        match self {
            GraphInvariantViolation::UnknownNodeReference { .. } => {
                "Edge references a node that does not exist"
            }
            GraphInvariantViolation::UnknownDisplayReference { .. } => {
                "Edge displays an endpoint that does not exist"
            }
            GraphInvariantViolation::DuplicateNodeId { .. } => {
                "Node IDs must be unique within a graph"
            }
            GraphInvariantViolation::DuplicateEdgeId { .. } => {
                "Edge IDs must be unique within a graph"
            }
        }
    }
}

pub fn graph_invariant_violations(nodes: &[Node], edges: &[Edge]) -> Vec<GraphInvariantViolation> {
    let mut violations = Vec::new();

    let mut node_ids: HashSet<NodeId> = HashSet::with_capacity(nodes.len());
    for node in nodes {
        if !node_ids.insert(node.id) {
            violations.push(GraphInvariantViolation::DuplicateNodeId { node_id: node.id });
        }
    }

    let mut edge_ids: HashSet<EdgeId> = HashSet::with_capacity(edges.len());
    for edge in edges {
        if !edge_ids.insert(edge.id) {
            violations.push(GraphInvariantViolation::DuplicateEdgeId { edge_id: edge.id });
        }
        for semantic in [edge.source_id, edge.target_id] {
            if !node_ids.contains(&semantic) {
                violations.push(GraphInvariantViolation::UnknownNodeReference {
                    edge_id: edge.id,
                    missing_node_id: semantic,
                });
            }
        }
        for display in [edge.source, edge.target] {
            if !node_ids.contains(&display) {
                violations.push(GraphInvariantViolation::UnknownDisplayReference {
                    edge_id: edge.id,
                    missing_node_id: display,
                });
            }
        }
    }

    violations
}

pub fn ensure_graph_invariants(nodes: &[Node], edges: &[Edge]) -> Result<()> {
    let violations = graph_invariant_violations(nodes, edges);
    if let Some(first) = violations.first() {
        return Err(LibError::validation_with_code(
            first.error_code(),
            first.public_message(),
            anyhow!("graph invariant validation failed: {:?}", violations),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::models::{Handle, NodeData, Position, TypeId};

    fn node(id: NodeId, name: &str) -> Node {
        Node {
            id,
            type_id: TypeId(Uuid::new_v4()),
            position: Position::default(),
            width: None,
            height: None,
            selected: false,
            data: NodeData::Custom {
                name: name.to_string(),
                content: String::new(),
            },
        }
    }

    fn edge(from: NodeId, to: NodeId) -> Edge {
        Edge {
            id: EdgeId::random(),
            type_id: TypeId(Uuid::new_v4()),
            source: from,
            target: to,
            source_handle: Handle::Right,
            target_handle: Handle::Left,
            selected: false,
            source_id: from,
            target_id: to,
        }
    }

    #[test]
    fn valid_graph_has_no_violations() {
        let a = NodeId::random();
        let b = NodeId::random();
        let violations =
            graph_invariant_violations(&[node(a, "A"), node(b, "B")], &[edge(a, b)]);
        assert!(violations.is_empty());
    }

    #[test]
    fn unknown_semantic_reference_is_reported() {
        let a = NodeId::random();
        let missing = NodeId::random();
        let violations = graph_invariant_violations(&[node(a, "A")], &[edge(a, missing)]);
        assert!(violations.iter().any(|v| matches!(
            v,
            GraphInvariantViolation::UnknownNodeReference { missing_node_id, .. }
                if *missing_node_id == missing
        )));
    }

    #[test]
    fn display_endpoint_may_differ_but_must_exist() {
        let a = NodeId::random();
        let b = NodeId::random();
        let display_only = NodeId::random();
        let mut chained = edge(a, b);
        chained.source = display_only;

        let violations = graph_invariant_violations(
            &[node(a, "A"), node(b, "B")],
            &[chained.clone()],
        );
        assert!(violations.iter().any(|v| matches!(
            v,
            GraphInvariantViolation::UnknownDisplayReference { missing_node_id, .. }
                if *missing_node_id == display_only
        )));

        let violations = graph_invariant_violations(
            &[node(a, "A"), node(b, "B"), node(display_only, "C")],
            &[chained],
        );
        assert!(violations.is_empty());
    }

    #[test]
    fn duplicate_ids_are_reported() {
        let a = NodeId::random();
        let violations = graph_invariant_violations(&[node(a, "A"), node(a, "A")], &[]);
        assert_eq!(
            violations,
            vec![GraphInvariantViolation::DuplicateNodeId { node_id: a }]
        );
    }

    #[test]
    fn ensure_returns_first_violation_as_error() {
        let a = NodeId::random();
        let missing = NodeId::random();
        let err = ensure_graph_invariants(&[node(a, "A")], &[edge(a, missing)])
            .expect_err("dangling edge should fail");
        assert_eq!(err.code, "graph_unknown_node_reference");
    }
}
