use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::anyhow;
use chrono::NaiveDateTime;
use serde_json::Value;
use tracing::{debug, warn};

use crate::backend::{GraphBackend, UpsertOp};
use crate::error::{LibError, Result};
use crate::invariants::graph_invariant_violations;
use crate::models::{
    ChangeEvent, ChangeTable, Edge, EdgeId, EdgeRecord, Graph, GraphPatch, Node, NodeId,
    NodeRecord, OrgId, TypeRegistry, UserId,
};
use crate::store::GraphStore;
use crate::sync::{
    apply_remote_change, decode_change, diff_graphs, shape_edge_records, shape_node_records,
};

/// Whether the session currently accepts local mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditState {
    Viewing,
    Editing,
}

/// One user's view of an organization's graph: the canonical and working
/// copies, undo history, the type registry, and the save/load plumbing
/// against a [`GraphBackend`].
///
/// The session is single-writer; concurrency between users is handled by
/// merging [`ChangeEvent`]s, last writer wins per object.
pub struct GraphSession {
    backend: Arc<dyn GraphBackend>,
    org: OrgId,
    actor: UserId,
    can_edit: bool,
    types: TypeRegistry,
    store: GraphStore,
    state: EditState,
    saving: bool,
    loaded: bool,
    // Modification stamps observed at the last load, to skip no-op refetches.
    load_stamps: (Option<NaiveDateTime>, Option<NaiveDateTime>),
    // Server-side property bags per record, so fields this client does not
    // model survive a round trip.
    node_base: HashMap<NodeId, Value>,
    edge_base: HashMap<EdgeId, Value>,
}

impl GraphSession {
    pub fn new(backend: Arc<dyn GraphBackend>, org: OrgId, actor: UserId, can_edit: bool) -> Self {
        Self {
            backend,
            org,
            actor,
            can_edit,
            types: TypeRegistry::default(),
            store: GraphStore::new(),
            state: EditState::Viewing,
            saving: false,
            loaded: false,
            load_stamps: (None, None),
            node_base: HashMap::new(),
            edge_base: HashMap::new(),
        }
    }

    pub fn graph(&self) -> &Graph {
        self.store.graph()
    }

    pub fn initial_graph(&self) -> &Graph {
        self.store.initial()
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    pub fn state(&self) -> EditState {
        self.state
    }

    pub fn can_edit(&self) -> bool {
        self.can_edit
    }

    pub fn editing_enabled(&self) -> bool {
        self.state == EditState::Editing
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Fetch the graph from the backend. When the backend's modification
    /// stamps match the ones seen at the previous load, the refetch is
    /// skipped entirely and local state (selection included) is untouched.
    /// After a real refetch, selection is reapplied by id so a refresh does
    /// not deselect the user's focus.
    pub async fn load(&mut self) -> Result<()> {
        let stamps = (
            self.backend.last_updated_at(ChangeTable::Nodes, self.org).await?,
            self.backend.last_updated_at(ChangeTable::Edges, self.org).await?,
        );
        if self.loaded
            && stamps.0.is_some()
            && stamps.1.is_some()
            && stamps == self.load_stamps
        {
            debug!("graph unchanged since last load, skipping refetch");
            return Ok(());
        }

        let types = if self.loaded {
            self.types.clone()
        } else {
            self.backend.load_type_registry().await?
        };
        let (node_records, edge_records) = self.backend.load_graph(self.org).await?;

        let mut node_base = HashMap::with_capacity(node_records.len());
        let mut nodes = Vec::with_capacity(node_records.len());
        for record in &node_records {
            nodes.push(Node::from_record(record)?);
            node_base.insert(record.id, record.properties.clone());
        }
        let mut edge_base = HashMap::with_capacity(edge_records.len());
        let mut edges = Vec::with_capacity(edge_records.len());
        for record in &edge_records {
            edges.push(Edge::from_record(record)?);
            edge_base.insert(record.id, record.properties.clone());
        }
        // Loads are best effort: a structurally damaged graph is still shown,
        // and the traversal/diff layers tolerate dangling references.
        for violation in graph_invariant_violations(&nodes, &edges) {
            warn!(code = violation.error_code(), "loaded graph violates an invariant");
        }

        let selected_nodes: HashSet<NodeId> = self
            .graph()
            .nodes
            .iter()
            .filter(|node| node.selected)
            .map(|node| node.id)
            .collect();
        let selected_edges: HashSet<EdgeId> = self
            .graph()
            .edges
            .iter()
            .filter(|edge| edge.selected)
            .map(|edge| edge.id)
            .collect();
        for node in &mut nodes {
            node.selected = selected_nodes.contains(&node.id);
        }
        for edge in &mut edges {
            edge.selected = selected_edges.contains(&edge.id);
        }

        self.types = types;
        self.node_base = node_base;
        self.edge_base = edge_base;
        self.store.set_loaded(Graph { nodes, edges });
        self.load_stamps = stamps;
        self.loaded = true;
        Ok(())
    }

    /// Enter edit mode. Fails with a `Forbidden` error when the session was
    /// opened without the edit capability.
    pub fn enable_editing(&mut self) -> Result<()> {
        if !self.can_edit {
            return Err(LibError::forbidden(
                "You do not have permission to edit this graph",
                anyhow!("session opened without the edit capability"),
            ));
        }
        self.state = EditState::Editing;
        Ok(())
    }

    /// Throw away all unsaved edits and return to viewing.
    pub fn cancel_editing(&mut self) {
        self.store.reset_to_initial();
        self.state = EditState::Viewing;
    }

    /// Merge a partial update into the working graph. Ignored while viewing;
    /// edit mode is the only door to local mutation.
    pub fn update(&mut self, patch: GraphPatch, undoable: bool) {
        if self.state != EditState::Editing {
            debug!("dropping graph update while not editing");
            return;
        }
        self.store.update(patch, undoable);
    }

    pub fn can_undo(&self) -> bool {
        self.store.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.store.can_redo()
    }

    pub fn undo(&mut self) {
        if self.state == EditState::Editing {
            self.store.undo();
        }
    }

    pub fn redo(&mut self) {
        if self.state == EditState::Editing {
            self.store.redo();
        }
    }

    /// Persist the difference between the canonical and working graphs as
    /// three batches per object type (create, update, soft delete), then
    /// reload and return to viewing.
    ///
    /// Batches are independent: one failing does not stop the others, and
    /// every failure is returned. On any failure the session stays in edit
    /// mode with the working graph intact, so the user can retry.
    pub async fn save(&mut self) -> Vec<LibError> {
        if self.saving {
            return vec![LibError::validation(
                "A save is already in progress",
                anyhow!("overlapping save call"),
            )];
        }
        if self.state != EditState::Editing {
            return vec![LibError::validation(
                "Only an editing session can save",
                anyhow!("save called in state {:?}", self.state),
            )];
        }

        let diff = diff_graphs(self.store.initial(), self.store.graph());
        if diff.is_empty() {
            self.state = EditState::Viewing;
            return Vec::new();
        }

        self.saving = true;
        let result = self.push_diff_batches(&diff).await;
        self.saving = false;

        let errors = match result {
            Ok(errors) => errors,
            Err(err) => vec![err],
        };
        if errors.is_empty() {
            self.store.set_loaded(self.store.graph().clone());
            self.state = EditState::Viewing;
            // Stamps moved under us; force a refetch to pick up server-side
            // merges and audit columns.
            self.load_stamps = (None, None);
            if let Err(err) = self.load().await {
                warn!(error = %err, "reload after save failed");
            }
        }
        errors
    }

    async fn push_diff_batches(&self, diff: &crate::sync::GraphDiff) -> Result<Vec<LibError>> {
        let mut errors = Vec::new();

        let node_batches = [
            (shape_node_records(&diff.added_nodes, &self.node_base)?, UpsertOp::Create),
            (shape_node_records(&diff.updated_nodes, &self.node_base)?, UpsertOp::Update),
            (shape_node_records(&diff.deleted_nodes, &self.node_base)?, UpsertOp::Delete),
        ];
        for (records, op) in node_batches {
            if records.is_empty() {
                continue;
            }
            if let Err(err) = self
                .backend
                .upsert_nodes(self.org, records, op, self.actor)
                .await
            {
                warn!(op = op.as_db_value(), error = %err, "node batch failed");
                errors.push(err);
            }
        }

        let edge_batches = [
            (shape_edge_records(&diff.added_edges, &self.edge_base)?, UpsertOp::Create),
            (shape_edge_records(&diff.updated_edges, &self.edge_base)?, UpsertOp::Update),
            (shape_edge_records(&diff.deleted_edges, &self.edge_base)?, UpsertOp::Delete),
        ];
        for (records, op) in edge_batches {
            if records.is_empty() {
                continue;
            }
            if let Err(err) = self
                .backend
                .upsert_edges(self.org, records, op, self.actor)
                .await
            {
                warn!(op = op.as_db_value(), error = %err, "edge batch failed");
                errors.push(err);
            }
        }

        Ok(errors)
    }

    /// Merge one change pushed by the realtime transport into both graph
    /// copies, outside the undo history. A change that cannot be decoded or
    /// applied is logged and dropped; one bad event must not wedge the
    /// stream.
    pub fn apply_remote_change(&mut self, event: &ChangeEvent) {
        let change = match decode_change(event) {
            Ok(change) => change,
            Err(err) => {
                warn!(table = event.table.as_db_value(), error = %err, "undecodable change event");
                return;
            }
        };

        // Refresh the server-side property bag so a later save of this
        // object does not resurrect stale fields.
        match event.table {
            ChangeTable::Nodes => {
                if let Ok(record) = serde_json::from_value::<NodeRecord>(event.record.clone()) {
                    self.node_base.insert(record.id, record.properties);
                }
            }
            ChangeTable::Edges => {
                if let Ok(record) = serde_json::from_value::<EdgeRecord>(event.record.clone()) {
                    self.edge_base.insert(record.id, record.properties);
                }
            }
            ChangeTable::RuleEvaluations => {}
        }

        self.store.merge_remote(|graph| {
            if let Err(err) = apply_remote_change(graph, &change) {
                warn!(error = %err, "failed to merge change event");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use uuid::Uuid;

    use super::*;
    use crate::memory::MemoryBackend;
    use crate::models::{ChangeKind, NodeData, NodeKind, Position, TypeId};

    fn metric(types: &TypeRegistry, name: &str) -> Node {
        Node {
            id: NodeId::random(),
            type_id: types.node_type_id(NodeKind::Metric).unwrap(),
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

    async fn seeded_session(names: &[&str]) -> (Arc<MemoryBackend>, GraphSession) {
        let backend = Arc::new(MemoryBackend::new());
        let types = backend.load_type_registry().await.unwrap();
        let graph = Graph {
            nodes: names.iter().map(|name| metric(&types, name)).collect(),
            edges: vec![],
        };
        backend.seed_graph(&graph).unwrap();

        let mut session = GraphSession::new(
            backend.clone(),
            OrgId(Uuid::new_v4()),
            UserId(Uuid::new_v4()),
            true,
        );
        session.load().await.unwrap();
        (backend, session)
    }

    fn add_node(session: &mut GraphSession, name: &str) -> NodeId {
        let node = metric(session.types(), name);
        let id = node.id;
        let mut nodes = session.graph().nodes.clone();
        nodes.push(node);
        session.update(GraphPatch::nodes(nodes), true);
        id
    }

    fn names(graph: &Graph) -> Vec<&str> {
        graph.nodes.iter().map(|node| node.data.name()).collect()
    }

    #[tokio::test]
    async fn edit_save_round_trip() {
        let (backend, mut session) = seeded_session(&["A"]).await;
        session.enable_editing().unwrap();
        let added = add_node(&mut session, "B");

        let errors = session.save().await;
        assert!(errors.is_empty());
        assert_eq!(session.state(), EditState::Viewing);
        assert_eq!(session.graph(), session.initial_graph());
        assert!(names(session.graph()).contains(&"B"));
        assert!(backend.node_record(added).is_some());
    }

    #[tokio::test]
    async fn saving_with_no_changes_issues_no_upserts() {
        let (backend, mut session) = seeded_session(&["A"]).await;
        session.enable_editing().unwrap();
        add_node(&mut session, "B");
        session.save().await;
        let calls_after_first = backend.upsert_calls();

        session.enable_editing().unwrap();
        let errors = session.save().await;
        assert!(errors.is_empty());
        assert_eq!(session.state(), EditState::Viewing);
        assert_eq!(backend.upsert_calls(), calls_after_first);
    }

    #[tokio::test]
    async fn failed_save_stays_in_edit_mode_for_retry() {
        let (backend, mut session) = seeded_session(&["A"]).await;
        session.enable_editing().unwrap();
        add_node(&mut session, "B");

        backend.set_fail_upserts(true);
        let errors = session.save().await;
        assert_eq!(errors.len(), 1);
        assert_eq!(session.state(), EditState::Editing);
        assert!(names(session.graph()).contains(&"B"));

        backend.set_fail_upserts(false);
        let errors = session.save().await;
        assert!(errors.is_empty());
        assert_eq!(session.state(), EditState::Viewing);
    }

    #[tokio::test]
    async fn failed_reload_leaves_the_prior_graph_intact() {
        let (backend, mut session) = seeded_session(&["A"]).await;

        // Move the backend stamps so the next load refetches, then fail it.
        let extra = metric(session.types(), "B");
        backend
            .seed_graph(&Graph { nodes: vec![extra], edges: vec![] })
            .unwrap();
        backend.set_fail_loads(true);

        let err = session.load().await.expect_err("load configured to fail");
        assert_eq!(err.kind, crate::error::ErrorKind::Persistence);
        assert_eq!(names(session.graph()), vec!["A"]);
        assert_eq!(names(session.initial_graph()), vec!["A"]);
        assert!(session.is_loaded());

        backend.set_fail_loads(false);
        session.load().await.unwrap();
        assert_eq!(session.graph().nodes.len(), 2);
    }

    #[tokio::test]
    async fn cancel_reverts_to_the_canonical_graph() {
        let (_backend, mut session) = seeded_session(&["A"]).await;
        session.enable_editing().unwrap();
        add_node(&mut session, "B");
        assert!(names(session.graph()).contains(&"B"));

        session.cancel_editing();
        assert_eq!(session.state(), EditState::Viewing);
        assert_eq!(names(session.graph()), vec!["A"]);
    }

    #[tokio::test]
    async fn updates_are_dropped_while_viewing() {
        let (_backend, mut session) = seeded_session(&["A"]).await;
        let mut nodes = session.graph().nodes.clone();
        nodes.push(metric(session.types(), "B"));
        session.update(GraphPatch::nodes(nodes), true);
        assert_eq!(names(session.graph()), vec!["A"]);
        assert!(!session.can_undo());
    }

    #[tokio::test]
    async fn editing_requires_the_capability() {
        let backend = Arc::new(MemoryBackend::new());
        let mut session = GraphSession::new(
            backend,
            OrgId(Uuid::new_v4()),
            UserId(Uuid::new_v4()),
            false,
        );
        let err = session.enable_editing().expect_err("viewer cannot edit");
        assert_eq!(err.kind, crate::error::ErrorKind::Forbidden);
        assert_eq!(session.state(), EditState::Viewing);
    }

    #[tokio::test]
    async fn remote_change_merges_without_clobbering_local_edits() {
        let (_backend, mut session) = seeded_session(&["A"]).await;
        session.enable_editing().unwrap();
        add_node(&mut session, "B");

        let remote = metric(session.types(), "Remote");
        let record = remote.to_record(None).unwrap();
        session.apply_remote_change(&ChangeEvent {
            table: ChangeTable::Nodes,
            kind: ChangeKind::Insert,
            record: serde_json::to_value(&record).unwrap(),
        });

        assert!(names(session.graph()).contains(&"Remote"));
        assert!(names(session.graph()).contains(&"B"));
        assert!(names(session.initial_graph()).contains(&"Remote"));
        // The merge is not an edit of ours.
        session.undo();
        assert!(names(session.graph()).contains(&"Remote"));
        assert!(!names(session.graph()).contains(&"B"));
    }

    #[tokio::test]
    async fn malformed_remote_change_is_dropped() {
        let (_backend, mut session) = seeded_session(&["A"]).await;
        session.apply_remote_change(&ChangeEvent {
            table: ChangeTable::Nodes,
            kind: ChangeKind::Insert,
            record: json!({"bogus": true}),
        });
        assert_eq!(names(session.graph()), vec!["A"]);
    }

    #[tokio::test]
    async fn unchanged_backend_skips_refetch_and_keeps_selection() {
        let (backend, mut session) = seeded_session(&["A"]).await;
        session.enable_editing().unwrap();
        let mut nodes = session.graph().nodes.clone();
        nodes[0].selected = true;
        session.update(GraphPatch::nodes(nodes), false);

        session.load().await.unwrap();
        assert!(session.graph().nodes[0].selected);
        // Selection is the only divergence from the canonical graph.
        assert!(session.graph().eq_ignoring_selection(session.initial_graph()));

        // A real change in the store forces a refetch; selection survives it.
        let extra = metric(session.types(), "B");
        backend
            .seed_graph(&Graph { nodes: vec![extra], edges: vec![] })
            .unwrap();
        session.load().await.unwrap();
        assert_eq!(session.graph().nodes.len(), 2);
        assert!(session
            .graph()
            .nodes
            .iter()
            .any(|node| node.data.name() == "A" && node.selected));
    }
}
