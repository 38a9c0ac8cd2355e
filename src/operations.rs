use std::collections::HashSet;

use anyhow::anyhow;

use crate::algorithms::{ObjectRef, connected_objects};
use crate::error::{LibError, Result};
use crate::factories::{
    form_custom_node, form_input_edge, form_metric_node, form_mission_node,
};
use crate::formula::{FormulaToken, compile_formula};
use crate::models::{
    Edge, EdgeId, Graph, GraphPatch, Node, NodeData, NodeId, NodeKind, Position,
};
use crate::session::{EditState, GraphSession};

/// One user gesture against the working graph. Every command lands as a
/// single history entry (or none, for the transient ones), so undo always
/// reverses whole gestures.
#[derive(Debug, Clone)]
pub enum EditCommand {
    AddMetric { at: Position },
    AddCustom { at: Position },
    AddMission { at: Position },
    SetNodeName { id: NodeId, name: String },
    SetNodeDescription { id: NodeId, description: Option<String> },
    SetMetricSource {
        id: NodeId,
        source_query: Option<String>,
        source_connection: Option<String>,
    },
    SetCustomContent { id: NodeId, content: String },
    /// Transient position while a drag is in flight. Visible immediately,
    /// invisible to undo; the drop lands as [`EditCommand::MoveNode`].
    DragNode { id: NodeId, to: Position },
    MoveNode { id: NodeId, to: Position },
    ResizeNode { id: NodeId, width: f64, height: f64 },
    /// Replace the selection wholesale. Not a graph edit, so never undoable.
    SetSelection { nodes: Vec<NodeId>, edges: Vec<EdgeId> },
    Connect { source: NodeId, target: NodeId },
    /// Delete the selected objects. Selecting any part of a function chain
    /// deletes the whole chain; the metrics at its ends survive unless
    /// selected themselves.
    DeleteSelection,
    ApplyFormula { formula: Vec<FormulaToken> },
}

impl GraphSession {
    /// Apply a command to the working graph. Commands are rejected outside
    /// edit mode.
    pub fn execute(&mut self, command: EditCommand) -> Result<()> {
        if self.state() != EditState::Editing {
            return Err(LibError::validation(
                "The graph is not in edit mode",
                anyhow!("command {:?} while viewing", command),
            ));
        }

        match command {
            EditCommand::AddMetric { at } => {
                let node = form_metric_node(self.types(), at)?;
                self.push_node(node);
            }
            EditCommand::AddCustom { at } => {
                let node = form_custom_node(self.types(), at)?;
                self.push_node(node);
            }
            EditCommand::AddMission { at } => {
                let node = form_mission_node(self.types(), at)?;
                self.push_node(node);
            }
            EditCommand::SetNodeName { id, name } => {
                self.rewrite_node(id, true, |node| match &mut node.data {
                    NodeData::Mission { name: slot, .. }
                    | NodeData::Metric { name: slot, .. }
                    | NodeData::Custom { name: slot, .. } => {
                        *slot = name;
                        Ok(())
                    }
                    NodeData::Function { .. } => Err(LibError::validation(
                        "Function nodes are named by their symbol",
                        anyhow!("rename of function node {id}"),
                    )),
                })?;
            }
            EditCommand::SetNodeDescription { id, description } => {
                self.rewrite_node(id, true, |node| match &mut node.data {
                    NodeData::Mission { description: slot, .. }
                    | NodeData::Metric { description: slot, .. } => {
                        *slot = description;
                        Ok(())
                    }
                    _ => Err(LibError::validation(
                        "Only missions and metrics carry a description",
                        anyhow!("description set on {} node {id}", node.kind().as_db_value()),
                    )),
                })?;
            }
            EditCommand::SetMetricSource {
                id,
                source_query,
                source_connection,
            } => {
                self.rewrite_node(id, true, |node| match &mut node.data {
                    NodeData::Metric {
                        source_query: query_slot,
                        source_connection: connection_slot,
                        ..
                    } => {
                        *query_slot = source_query;
                        *connection_slot = source_connection;
                        Ok(())
                    }
                    _ => Err(LibError::validation(
                        "Only metrics have a data source",
                        anyhow!("source set on {} node {id}", node.kind().as_db_value()),
                    )),
                })?;
            }
            EditCommand::SetCustomContent { id, content } => {
                self.rewrite_node(id, true, |node| match &mut node.data {
                    NodeData::Custom { content: slot, .. } => {
                        *slot = content;
                        Ok(())
                    }
                    _ => Err(LibError::validation(
                        "Only custom nodes carry free-form content",
                        anyhow!("content set on {} node {id}", node.kind().as_db_value()),
                    )),
                })?;
            }
            EditCommand::DragNode { id, to } => {
                self.rewrite_node(id, false, |node| {
                    node.position = to;
                    Ok(())
                })?;
            }
            EditCommand::MoveNode { id, to } => {
                self.rewrite_node(id, true, |node| {
                    node.position = to;
                    Ok(())
                })?;
            }
            EditCommand::ResizeNode { id, width, height } => {
                self.rewrite_node(id, true, |node| {
                    node.width = Some(width);
                    node.height = Some(height);
                    Ok(())
                })?;
            }
            EditCommand::SetSelection { nodes, edges } => {
                let node_set: HashSet<NodeId> = nodes.into_iter().collect();
                let edge_set: HashSet<EdgeId> = edges.into_iter().collect();
                let mut graph_nodes = self.graph().nodes.clone();
                for node in &mut graph_nodes {
                    node.selected = node_set.contains(&node.id);
                }
                let mut graph_edges = self.graph().edges.clone();
                for edge in &mut graph_edges {
                    edge.selected = edge_set.contains(&edge.id);
                }
                self.update(GraphPatch::both(graph_nodes, graph_edges), false);
            }
            EditCommand::Connect { source, target } => {
                let edge = self.form_connection(source, target)?;
                let mut edges = self.graph().edges.clone();
                edges.push(edge);
                self.update(GraphPatch::edges(edges), true);
            }
            EditCommand::DeleteSelection => {
                let (nodes, edges) = deletion_closure(self.graph());
                let kept_nodes = self
                    .graph()
                    .nodes
                    .iter()
                    .filter(|node| !nodes.contains(&node.id))
                    .cloned()
                    .collect();
                let kept_edges = self
                    .graph()
                    .edges
                    .iter()
                    .filter(|edge| !edges.contains(&edge.id))
                    .cloned()
                    .collect();
                self.update(GraphPatch::both(kept_nodes, kept_edges), true);
            }
            EditCommand::ApplyFormula { formula } => {
                let compiled = compile_formula(self.graph(), self.types(), &formula)?;
                let mut nodes = self.graph().nodes.clone();
                nodes.extend(compiled.function_nodes);
                let mut edges = self.graph().edges.clone();
                edges.extend(compiled.input_edges);
                self.update(GraphPatch::both(nodes, edges), true);
            }
        }
        Ok(())
    }

    fn push_node(&mut self, node: Node) {
        let mut nodes = self.graph().nodes.clone();
        nodes.push(node);
        self.update(GraphPatch::nodes(nodes), true);
    }

    fn rewrite_node(
        &mut self,
        id: NodeId,
        undoable: bool,
        rewrite: impl FnOnce(&mut Node) -> Result<()>,
    ) -> Result<()> {
        let mut nodes = self.graph().nodes.clone();
        let node = nodes.iter_mut().find(|node| node.id == id).ok_or_else(|| {
            LibError::not_found("That node no longer exists", anyhow!("unknown node {id}"))
        })?;
        rewrite(node)?;
        self.update(GraphPatch::nodes(nodes), undoable);
        Ok(())
    }

    fn form_connection(&self, source: NodeId, target: NodeId) -> Result<Edge> {
        if source == target {
            return Err(LibError::validation(
                "A node cannot feed itself",
                anyhow!("self loop on node {source}"),
            ));
        }
        let source_node = self.graph().node(source).ok_or_else(|| {
            LibError::not_found("That node no longer exists", anyhow!("unknown node {source}"))
        })?;
        let target_node = self.graph().node(target).ok_or_else(|| {
            LibError::not_found("That node no longer exists", anyhow!("unknown node {target}"))
        })?;
        form_input_edge(self.types(), source_node, target_node, None, None)
    }
}

/// Everything the current selection implies deleting. Function chains are
/// indivisible, so a selected chain member (or an edge incident to a deleted
/// node) pulls in the rest of its chain; substantive nodes are only deleted
/// when explicitly selected.
fn deletion_closure(graph: &Graph) -> (HashSet<NodeId>, HashSet<EdgeId>) {
    let mut nodes: HashSet<NodeId> = graph
        .nodes
        .iter()
        .filter(|node| node.selected)
        .map(|node| node.id)
        .collect();
    let mut edges: HashSet<EdgeId> = graph
        .edges
        .iter()
        .filter(|edge| edge.selected)
        .map(|edge| edge.id)
        .collect();

    loop {
        let before = (nodes.len(), edges.len());

        let seeds: Vec<ObjectRef> = nodes
            .iter()
            .filter(|id| {
                graph
                    .node(**id)
                    .is_some_and(|node| node.kind() == NodeKind::Function)
            })
            .map(|id| ObjectRef::node(*id))
            .chain(edges.iter().map(|id| ObjectRef::edge(*id)))
            .collect();
        for seed in seeds {
            // Degree zero bounds the walk to the local function chain; the
            // substantive nodes at its rim are never entered.
            for object in connected_objects(graph, seed, Some(0), None) {
                match object {
                    ObjectRef::Node { id } => {
                        if graph
                            .node(id)
                            .is_some_and(|node| node.kind() == NodeKind::Function)
                        {
                            nodes.insert(id);
                        }
                    }
                    ObjectRef::Edge { id } => {
                        edges.insert(id);
                    }
                }
            }
        }

        for edge in &graph.edges {
            let touches = nodes.contains(&edge.source_id)
                || nodes.contains(&edge.target_id)
                || nodes.contains(&edge.source)
                || nodes.contains(&edge.target);
            if touches {
                edges.insert(edge.id);
            }
        }

        if (nodes.len(), edges.len()) == before {
            return (nodes, edges);
        }
    }
}
