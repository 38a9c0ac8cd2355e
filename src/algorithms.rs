use std::collections::{HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::models::{EdgeId, Graph, NodeId};

/// Reference to either element of a graph, used as traversal currency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObjectRef {
    Node { id: NodeId },
    Edge { id: EdgeId },
}

impl ObjectRef {
    pub const fn node(id: NodeId) -> Self {
        ObjectRef::Node { id }
    }

    pub const fn edge(id: EdgeId) -> Self {
        ObjectRef::Edge { id }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Follow edges backward toward their semantic sources.
    Inputs,
    /// Follow edges forward toward their semantic targets.
    Outputs,
}

/// Objects reachable from `start` by following semantic edge endpoints.
///
/// `max_degrees` bounds the walk: a degree is consumed only when stepping from
/// an edge onto a substantive (metric/custom) node, so an entire function
/// chain counts as a single hop. A substantive node reached with the last
/// degree is included but not expanded further. Omitting `direction` unions an
/// inputs pass and an outputs pass. The start reference itself is not part of
/// the result; results are deduplicated in discovery order.
pub fn connected_objects(
    graph: &Graph,
    start: ObjectRef,
    max_degrees: Option<u32>,
    direction: Option<Direction>,
) -> Vec<ObjectRef> {
    let mut found = Vec::new();
    match direction {
        Some(direction) => collect(graph, start, max_degrees, direction, &mut found),
        None => {
            collect(graph, start, max_degrees, Direction::Inputs, &mut found);
            let mut outputs = Vec::new();
            collect(graph, start, max_degrees, Direction::Outputs, &mut outputs);
            let seen: HashSet<ObjectRef> = found.iter().copied().collect();
            found.extend(outputs.into_iter().filter(|obj| !seen.contains(obj)));
        }
    }
    found
}

fn collect(
    graph: &Graph,
    start: ObjectRef,
    max_degrees: Option<u32>,
    direction: Direction,
    found: &mut Vec<ObjectRef>,
) {
    let mut visited_nodes: HashSet<NodeId> = HashSet::new();
    let mut visited_edges: HashSet<EdgeId> = HashSet::new();
    match start {
        ObjectRef::Node { id } => {
            visited_nodes.insert(id);
        }
        ObjectRef::Edge { id } => {
            visited_edges.insert(id);
        }
    }

    let mut worklist: VecDeque<(ObjectRef, Option<u32>)> = VecDeque::new();
    worklist.push_back((start, max_degrees));

    while let Some((current, budget)) = worklist.pop_front() {
        match current {
            ObjectRef::Node { id } => {
                for edge in &graph.edges {
                    let endpoint = match direction {
                        Direction::Inputs => edge.target_id,
                        Direction::Outputs => edge.source_id,
                    };
                    if endpoint != id {
                        continue;
                    }
                    if visited_edges.insert(edge.id) {
                        let reference = ObjectRef::edge(edge.id);
                        found.push(reference);
                        // Crossing an edge never consumes degree budget.
                        worklist.push_back((reference, budget));
                    }
                }
            }
            ObjectRef::Edge { id } => {
                let Some(edge) = graph.edge(id) else {
                    continue;
                };
                let next_id = match direction {
                    Direction::Inputs => edge.source_id,
                    Direction::Outputs => edge.target_id,
                };
                // Dangling references are skipped rather than failing the walk.
                let Some(node) = graph.node(next_id) else {
                    continue;
                };
                if !visited_nodes.insert(node.id) {
                    continue;
                }

                let next_budget = if node.kind().is_substantive() {
                    match budget {
                        Some(0) => continue,
                        Some(remaining) => Some(remaining - 1),
                        None => None,
                    }
                } else {
                    budget
                };

                let reference = ObjectRef::node(node.id);
                found.push(reference);
                // A substantive node reached on its last degree is a boundary;
                // function nodes always expand since crossing them is free.
                if node.kind().is_substantive() && next_budget == Some(0) {
                    continue;
                }
                worklist.push_back((reference, next_budget));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::models::{
        Edge, FunctionSymbol, Handle, Node, NodeData, Position, TypeId,
    };

    fn metric(name: &str) -> Node {
        Node {
            id: NodeId::random(),
            type_id: TypeId(Uuid::new_v4()),
            position: Position::default(),
            width: None,
            height: None,
            selected: false,
            data: NodeData::Metric {
                name: name.to_string(),
                description: None,
                source_query: None,
                source_connection: None,
                rule_status: None,
            },
        }
    }

    fn function(symbol: FunctionSymbol) -> Node {
        Node {
            id: NodeId::random(),
            type_id: TypeId(Uuid::new_v4()),
            position: Position::default(),
            width: None,
            height: None,
            selected: false,
            data: NodeData::Function { symbol },
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

    /// `B -> F(=) -> A` then `A -> G(=) -> C`: two identity chains in series.
    fn chained_graph() -> (Graph, [NodeId; 5], [EdgeId; 4]) {
        let b = metric("B");
        let f = function(FunctionSymbol::Identity);
        let a = metric("A");
        let g = function(FunctionSymbol::Identity);
        let c = metric("C");

        let e1 = edge(b.id, f.id);
        let e2 = edge(f.id, a.id);
        let e3 = edge(a.id, g.id);
        let e4 = edge(g.id, c.id);

        let ids = [b.id, f.id, a.id, g.id, c.id];
        let edge_ids = [e1.id, e2.id, e3.id, e4.id];
        let graph = Graph {
            nodes: vec![b, f, a, g, c],
            edges: vec![e1, e2, e3, e4],
        };
        (graph, ids, edge_ids)
    }

    #[test]
    fn outputs_from_source_reach_edge_and_target() {
        let (graph, [b, f, a, ..], [e1, e2, ..]) = chained_graph();
        let found = connected_objects(&graph, ObjectRef::node(b), None, Some(Direction::Outputs));
        assert!(found.contains(&ObjectRef::edge(e1)));
        assert!(found.contains(&ObjectRef::node(f)));
        assert!(found.contains(&ObjectRef::edge(e2)));
        assert!(found.contains(&ObjectRef::node(a)));
    }

    #[test]
    fn inputs_from_target_reach_edge_and_source() {
        let (graph, [b, f, a, ..], [e1, e2, ..]) = chained_graph();
        let found = connected_objects(&graph, ObjectRef::node(a), None, Some(Direction::Inputs));
        assert!(found.contains(&ObjectRef::edge(e2)));
        assert!(found.contains(&ObjectRef::node(f)));
        assert!(found.contains(&ObjectRef::edge(e1)));
        assert!(found.contains(&ObjectRef::node(b)));
    }

    #[test]
    fn one_degree_includes_adjacent_chain_but_not_beyond() {
        let (graph, [b, f, a, g, c], [e1, e2, e3, e4]) = chained_graph();
        let found =
            connected_objects(&graph, ObjectRef::node(b), Some(1), Some(Direction::Outputs));
        // The whole first chain is one hop: function nodes are free.
        assert!(found.contains(&ObjectRef::edge(e1)));
        assert!(found.contains(&ObjectRef::node(f)));
        assert!(found.contains(&ObjectRef::edge(e2)));
        assert!(found.contains(&ObjectRef::node(a)));
        // A consumed the only degree, so nothing past it is visited.
        assert!(!found.contains(&ObjectRef::edge(e3)));
        assert!(!found.contains(&ObjectRef::node(g)));
        assert!(!found.contains(&ObjectRef::edge(e4)));
        assert!(!found.contains(&ObjectRef::node(c)));
    }

    #[test]
    fn zero_degrees_still_walk_the_whole_function_chain() {
        // B -> F(+) -> G(=) -> A: with no degrees to spend, the walk still
        // covers every function node and edge of the local chain, stopping
        // only at the substantive node on the far side.
        let b = metric("B");
        let f = function(FunctionSymbol::Add);
        let g = function(FunctionSymbol::Identity);
        let a = metric("A");
        let e1 = edge(b.id, f.id);
        let e2 = edge(f.id, g.id);
        let e3 = edge(g.id, a.id);
        let (b_id, f_id, g_id) = (b.id, f.id, g.id);
        let (e1_id, e2_id, e3_id) = (e1.id, e2.id, e3.id);
        let graph = Graph {
            nodes: vec![b, f, g, a],
            edges: vec![e1, e2, e3],
        };

        let found =
            connected_objects(&graph, ObjectRef::node(b_id), Some(0), Some(Direction::Outputs));
        assert_eq!(
            found,
            vec![
                ObjectRef::edge(e1_id),
                ObjectRef::node(f_id),
                ObjectRef::edge(e2_id),
                ObjectRef::node(g_id),
                ObjectRef::edge(e3_id),
            ]
        );
    }

    #[test]
    fn two_degrees_cross_the_second_chain() {
        let (graph, [b, .., c], _) = chained_graph();
        let found =
            connected_objects(&graph, ObjectRef::node(b), Some(2), Some(Direction::Outputs));
        assert!(found.contains(&ObjectRef::node(c)));
    }

    #[test]
    fn omitted_direction_unions_both_passes() {
        let (graph, [b, _, a, _, c], _) = chained_graph();
        let found = connected_objects(&graph, ObjectRef::node(a), None, None);
        assert!(found.contains(&ObjectRef::node(b)));
        assert!(found.contains(&ObjectRef::node(c)));
        // No duplicates after the union.
        let unique: HashSet<ObjectRef> = found.iter().copied().collect();
        assert_eq!(unique.len(), found.len());
    }

    #[test]
    fn starting_from_an_edge_walks_the_appropriate_end() {
        let (graph, [b, f, ..], [e1, ..]) = chained_graph();
        let found = connected_objects(&graph, ObjectRef::edge(e1), None, Some(Direction::Inputs));
        assert!(found.contains(&ObjectRef::node(b)));
        assert!(!found.contains(&ObjectRef::node(f)));
    }

    #[test]
    fn cycles_terminate() {
        let a = metric("A");
        let b = metric("B");
        let e1 = edge(a.id, b.id);
        let e2 = edge(b.id, a.id);
        let (a_id, b_id) = (a.id, b.id);
        let graph = Graph {
            nodes: vec![a, b],
            edges: vec![e1, e2],
        };
        let found = connected_objects(&graph, ObjectRef::node(a_id), None, Some(Direction::Outputs));
        assert!(found.contains(&ObjectRef::node(b_id)));
        assert_eq!(found.len(), 3);
    }

    #[test]
    fn dangling_edges_are_skipped() {
        let a = metric("A");
        let a_id = a.id;
        let dangling = edge(a_id, NodeId::random());
        let dangling_id = dangling.id;
        let graph = Graph {
            nodes: vec![a],
            edges: vec![dangling],
        };
        let found = connected_objects(&graph, ObjectRef::node(a_id), None, Some(Direction::Outputs));
        assert_eq!(found, vec![ObjectRef::edge(dangling_id)]);
    }
}
