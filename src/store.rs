use crate::models::{Graph, GraphPatch};

/// Holds the canonical graph (last confirmed persisted/loaded) and the
/// working copy, with a truncating snapshot history for undo/redo.
///
/// All mutation is funneled through [`GraphStore::update`]; callers are
/// trusted local UI paths, so the helpers never fail on odd input. Remote
/// merges go through [`GraphStore::merge_remote`], outside the undo history.
#[derive(Debug, Clone, Default)]
pub struct GraphStore {
    initial: Graph,
    history: Vec<Graph>,
    cursor: usize,
}

impl GraphStore {
    pub fn new() -> Self {
        Self {
            initial: Graph::default(),
            history: vec![Graph::default()],
            cursor: 0,
        }
    }

    /// Current working graph, possibly containing unsaved edits.
    pub fn graph(&self) -> &Graph {
        &self.history[self.cursor]
    }

    /// Last graph confirmed to match the persistence layer.
    pub fn initial(&self) -> &Graph {
        &self.initial
    }

    /// Install a freshly loaded canonical graph as both copies and as the
    /// history root.
    pub fn set_loaded(&mut self, graph: Graph) {
        self.initial = graph.clone();
        self.history = vec![graph];
        self.cursor = 0;
    }

    /// Merge a partial update into the working graph. Undoable updates push a
    /// history entry (destroying any redo future); non-undoable ones rewrite
    /// the current snapshot in place so transient drag frames and remote
    /// merges never pollute the history.
    pub fn update(&mut self, patch: GraphPatch, undoable: bool) {
        let mut next = self.graph().clone();
        if let Some(nodes) = patch.nodes {
            next.nodes = nodes;
        }
        if let Some(edges) = patch.edges {
            next.edges = edges;
        }

        if undoable {
            self.history.truncate(self.cursor + 1);
            self.history.push(next);
            self.cursor += 1;
        } else {
            self.history[self.cursor] = next;
        }
    }

    /// Apply a remote change to the canonical graph and every history
    /// snapshot. Remote changes are not local edits, so undo and redo can
    /// never revert them.
    pub fn merge_remote(&mut self, mut apply: impl FnMut(&mut Graph)) {
        apply(&mut self.initial);
        for snapshot in &mut self.history {
            apply(snapshot);
        }
    }

    pub fn can_undo(&self) -> bool {
        self.cursor > 0
    }

    pub fn can_redo(&self) -> bool {
        self.cursor + 1 < self.history.len()
    }

    /// Move back one snapshot; no-op at the boundary.
    pub fn undo(&mut self) {
        if self.can_undo() {
            self.cursor -= 1;
        }
    }

    pub fn redo(&mut self) {
        if self.can_redo() {
            self.cursor += 1;
        }
    }

    /// Discard the working graph and all history, reverting to the canonical
    /// graph exactly as it currently stands.
    pub fn reset_to_initial(&mut self) {
        self.history = vec![self.initial.clone()];
        self.cursor = 0;
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::models::{Node, NodeData, NodeId, Position, TypeId};

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

    fn push_node(store: &mut GraphStore, node: Node, undoable: bool) {
        let mut nodes = store.graph().nodes.clone();
        nodes.push(node);
        store.update(GraphPatch::nodes(nodes), undoable);
    }

    #[test]
    fn undo_reverses_a_sequence_of_updates() {
        let mut store = GraphStore::new();
        let before = store.graph().clone();
        push_node(&mut store, metric("A"), true);
        push_node(&mut store, metric("B"), true);
        push_node(&mut store, metric("C"), true);
        let after = store.graph().clone();

        store.undo();
        store.undo();
        store.undo();
        assert_eq!(*store.graph(), before);

        store.redo();
        store.redo();
        store.redo();
        assert_eq!(*store.graph(), after);
    }

    #[test]
    fn undo_redo_are_noops_at_the_boundaries() {
        let mut store = GraphStore::new();
        assert!(!store.can_undo());
        assert!(!store.can_redo());
        store.undo();
        store.redo();
        assert_eq!(*store.graph(), Graph::default());

        push_node(&mut store, metric("A"), true);
        assert!(store.can_undo());
        assert!(!store.can_redo());
    }

    #[test]
    fn new_edit_after_undo_destroys_the_redo_future() {
        let mut store = GraphStore::new();
        push_node(&mut store, metric("A"), true);
        push_node(&mut store, metric("B"), true);
        store.undo();
        assert!(store.can_redo());

        push_node(&mut store, metric("C"), true);
        assert!(!store.can_redo());
        store.redo();
        let names: Vec<&str> = store.graph().nodes.iter().map(|n| n.data.name()).collect();
        assert_eq!(names, vec!["A", "C"]);
    }

    #[test]
    fn non_undoable_updates_rewrite_the_current_snapshot() {
        let mut store = GraphStore::new();
        push_node(&mut store, metric("A"), true);

        // Simulates transient drag frames: visible immediately, invisible to undo.
        let mut nodes = store.graph().nodes.clone();
        nodes[0].position = Position::new(50.0, 60.0);
        store.update(GraphPatch::nodes(nodes), false);
        assert_eq!(store.graph().nodes[0].position, Position::new(50.0, 60.0));

        store.undo();
        assert!(store.graph().nodes.is_empty());
        store.redo();
        assert_eq!(store.graph().nodes[0].position, Position::new(50.0, 60.0));
    }

    #[test]
    fn reset_reverts_to_the_current_canonical_graph() {
        let mut store = GraphStore::new();
        let canonical = Graph {
            nodes: vec![metric("A")],
            edges: vec![],
        };
        store.set_loaded(canonical.clone());
        push_node(&mut store, metric("B"), true);
        push_node(&mut store, metric("C"), false);
        assert_ne!(*store.graph(), canonical);

        store.reset_to_initial();
        assert_eq!(*store.graph(), canonical);
        assert!(!store.can_undo());
        assert!(!store.can_redo());
    }

    #[test]
    fn merge_remote_touches_both_copies_and_survives_undo() {
        let mut store = GraphStore::new();
        let canonical = Graph {
            nodes: vec![metric("A")],
            edges: vec![],
        };
        store.set_loaded(canonical);
        push_node(&mut store, metric("B"), true);

        let incoming = metric("Remote");
        store.merge_remote(|graph| graph.upsert_node(incoming.clone()));

        assert!(store.initial().nodes.iter().any(|n| n.data.name() == "Remote"));
        assert!(store.graph().nodes.iter().any(|n| n.data.name() == "Remote"));
        // The local uncommitted edit survives the merge.
        assert!(store.graph().nodes.iter().any(|n| n.data.name() == "B"));

        // Undo reverses the local edit only; the merge is not ours to undo.
        store.undo();
        assert!(store.graph().nodes.iter().any(|n| n.data.name() == "Remote"));
        assert!(!store.graph().nodes.iter().any(|n| n.data.name() == "B"));
    }
}
