use std::collections::{HashMap, HashSet};

use anyhow::anyhow;
use serde_json::Value;

use crate::error::{LibError, Result};
use crate::models::{
    ChangeEvent, ChangeTable, Edge, EdgeId, EdgeRecord, Graph, Node, NodeData, NodeId, NodeRecord,
    RuleEvaluation,
};

/// Partition of the differences between the canonical graph and the working
/// graph, computed once per save.
#[derive(Debug, Clone, Default)]
pub struct GraphDiff {
    pub added_nodes: Vec<Node>,
    pub updated_nodes: Vec<Node>,
    pub deleted_nodes: Vec<Node>,
    pub added_edges: Vec<Edge>,
    pub updated_edges: Vec<Edge>,
    pub deleted_edges: Vec<Edge>,
}

impl GraphDiff {
    pub fn is_empty(&self) -> bool {
        self.added_nodes.is_empty()
            && self.updated_nodes.is_empty()
            && self.deleted_nodes.is_empty()
            && self.added_edges.is_empty()
            && self.updated_edges.is_empty()
            && self.deleted_edges.is_empty()
    }
}

/// Diff `initial` against `current`. Comparison ignores transient `selected`
/// flags. Edges incident to a deleted node are not reported as deletions;
/// removing the node implies their removal server-side.
pub fn diff_graphs(initial: &Graph, current: &Graph) -> GraphDiff {
    let mut diff = GraphDiff::default();

    let initial_nodes: HashMap<NodeId, &Node> =
        initial.nodes.iter().map(|node| (node.id, node)).collect();
    let current_nodes: HashMap<NodeId, &Node> =
        current.nodes.iter().map(|node| (node.id, node)).collect();

    for node in &current.nodes {
        match initial_nodes.get(&node.id) {
            None => diff.added_nodes.push(deselected_node(node)),
            Some(existing) => {
                let a = deselected_node(node);
                let b = deselected_node(existing);
                if a != b {
                    diff.updated_nodes.push(a);
                }
            }
        }
    }
    let mut deleted_node_ids: HashSet<NodeId> = HashSet::new();
    for node in &initial.nodes {
        if !current_nodes.contains_key(&node.id) {
            deleted_node_ids.insert(node.id);
            diff.deleted_nodes.push(deselected_node(node));
        }
    }

    let initial_edges: HashMap<EdgeId, &Edge> =
        initial.edges.iter().map(|edge| (edge.id, edge)).collect();
    let current_edges: HashMap<EdgeId, &Edge> =
        current.edges.iter().map(|edge| (edge.id, edge)).collect();

    for edge in &current.edges {
        match initial_edges.get(&edge.id) {
            None => diff.added_edges.push(deselected_edge(edge)),
            Some(existing) => {
                let a = deselected_edge(edge);
                let b = deselected_edge(existing);
                if a != b {
                    diff.updated_edges.push(a);
                }
            }
        }
    }
    for edge in &initial.edges {
        if current_edges.contains_key(&edge.id) {
            continue;
        }
        let touches_deleted_node = [edge.source_id, edge.target_id, edge.source, edge.target]
            .iter()
            .any(|id| deleted_node_ids.contains(id));
        if !touches_deleted_node {
            diff.deleted_edges.push(deselected_edge(edge));
        }
    }

    diff
}

fn deselected_node(node: &Node) -> Node {
    let mut node = node.clone();
    node.selected = false;
    node
}

fn deselected_edge(edge: &Edge) -> Edge {
    let mut edge = edge.clone();
    edge.selected = false;
    edge
}

/// Shape nodes for persistence, merging each node's logical properties over
/// the server-side bag captured at load time.
pub fn shape_node_records(
    nodes: &[Node],
    base_properties: &HashMap<NodeId, Value>,
) -> Result<Vec<NodeRecord>> {
    nodes
        .iter()
        .map(|node| node.to_record(base_properties.get(&node.id)))
        .collect()
}

pub fn shape_edge_records(
    edges: &[Edge],
    base_properties: &HashMap<EdgeId, Value>,
) -> Result<Vec<EdgeRecord>> {
    edges
        .iter()
        .map(|edge| edge.to_record(base_properties.get(&edge.id)))
        .collect()
}

/// A change notification decoded into graph terms.
#[derive(Debug, Clone)]
pub enum RemoteChange {
    NodeUpsert(Node),
    NodeDelete(NodeId),
    EdgeUpsert(Edge),
    EdgeDelete(EdgeId),
    RuleEvaluation(RuleEvaluation),
}

/// Decode a raw subscription event. Soft deletes arrive as updates with a
/// deletion stamp set on the record.
pub fn decode_change(event: &ChangeEvent) -> Result<RemoteChange> {
    match event.table {
        ChangeTable::Nodes => {
            let record: NodeRecord = serde_json::from_value(event.record.clone())?;
            if record.stamps.deleted_at.is_some() {
                Ok(RemoteChange::NodeDelete(record.id))
            } else {
                Ok(RemoteChange::NodeUpsert(Node::from_record(&record)?))
            }
        }
        ChangeTable::Edges => {
            let record: EdgeRecord = serde_json::from_value(event.record.clone())?;
            if record.stamps.deleted_at.is_some() {
                Ok(RemoteChange::EdgeDelete(record.id))
            } else {
                Ok(RemoteChange::EdgeUpsert(Edge::from_record(&record)?))
            }
        }
        ChangeTable::RuleEvaluations => {
            let evaluation: RuleEvaluation = serde_json::from_value(event.record.clone())?;
            Ok(RemoteChange::RuleEvaluation(evaluation))
        }
    }
}

/// Merge one decoded change into a graph, keyed by object id. Inserts append,
/// updates replace, deletes remove; changes to one object never disturb any
/// other object, so unsaved local edits elsewhere survive.
///
/// Returns an error only for a rule evaluation whose parent node is missing
/// or is not a metric; callers log and drop that notification.
pub fn apply_remote_change(graph: &mut Graph, change: &RemoteChange) -> Result<()> {
    match change {
        RemoteChange::NodeUpsert(node) => {
            graph.upsert_node(node.clone());
            Ok(())
        }
        RemoteChange::NodeDelete(id) => {
            graph.remove_node(*id);
            Ok(())
        }
        RemoteChange::EdgeUpsert(edge) => {
            graph.upsert_edge(edge.clone());
            Ok(())
        }
        RemoteChange::EdgeDelete(id) => {
            graph.remove_edge(*id);
            Ok(())
        }
        RemoteChange::RuleEvaluation(evaluation) => {
            let Some(node) = graph.node_mut(evaluation.node_id) else {
                return Err(LibError::not_found(
                    "Monitored node not found",
                    anyhow!("rule evaluation {} references missing node {}",
                        evaluation.id, evaluation.node_id),
                ));
            };
            match &mut node.data {
                NodeData::Metric { rule_status, .. } => {
                    *rule_status = Some(evaluation.status);
                    Ok(())
                }
                _ => Err(LibError::validation(
                    "Only metric nodes carry monitoring status",
                    anyhow!("rule evaluation {} targets non-metric node {}",
                        evaluation.id, evaluation.node_id),
                )),
            }
        }
    }
}
