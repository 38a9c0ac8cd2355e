use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use uuid::Uuid;

use crate::backend::{GraphBackend, UpsertOp};
use crate::error::{LibError, Result};
use crate::models::{
    ChangeTable, EdgeId, EdgeKind, EdgeRecord, Graph, NodeId, NodeKind, NodeRecord, OrgId, TypeId,
    TypeRegistry, UserId,
};

#[derive(Debug, Default)]
struct MemoryState {
    types: TypeRegistry,
    nodes: HashMap<NodeId, NodeRecord>,
    edges: HashMap<EdgeId, EdgeRecord>,
    node_stamp: Option<NaiveDateTime>,
    edge_stamp: Option<NaiveDateTime>,
    upsert_calls: usize,
    fail_upserts: bool,
    fail_loads: bool,
}

/// Map-backed [`GraphBackend`] for tests and embedders that do not need a
/// database. Soft deletes keep the row and stamp it, matching the Postgres
/// backend's behavior.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    /// Fresh store with a fully populated type registry.
    pub fn new() -> Self {
        let mut types = TypeRegistry::default();
        for kind in [
            NodeKind::Mission,
            NodeKind::Metric,
            NodeKind::Function,
            NodeKind::Custom,
        ] {
            types.insert_node_type(kind, TypeId(Uuid::new_v4()));
        }
        types.insert_edge_type(EdgeKind::Input, TypeId(Uuid::new_v4()));

        Self {
            state: Mutex::new(MemoryState {
                types,
                ..MemoryState::default()
            }),
        }
    }

    /// Seed the store from an in-memory graph, as if it had been saved by an
    /// earlier session.
    pub fn seed_graph(&self, graph: &Graph) -> Result<()> {
        let now = Utc::now().naive_utc();
        let mut state = self.lock();
        for node in &graph.nodes {
            let mut record = node.to_record(None)?;
            record.stamps.created_at = Some(now);
            state.nodes.insert(record.id, record);
        }
        for edge in &graph.edges {
            let mut record = edge.to_record(None)?;
            record.stamps.created_at = Some(now);
            state.edges.insert(record.id, record);
        }
        state.node_stamp = Some(now);
        state.edge_stamp = Some(now);
        Ok(())
    }

    pub fn node_record(&self, id: NodeId) -> Option<NodeRecord> {
        self.lock().nodes.get(&id).cloned()
    }

    pub fn edge_record(&self, id: EdgeId) -> Option<EdgeRecord> {
        self.lock().edges.get(&id).cloned()
    }

    /// Number of upsert batches issued so far, across nodes and edges.
    pub fn upsert_calls(&self) -> usize {
        self.lock().upsert_calls
    }

    /// Make subsequent upsert batches fail, for save-error paths.
    pub fn set_fail_upserts(&self, fail: bool) {
        self.lock().fail_upserts = fail;
    }

    pub fn set_fail_loads(&self, fail: bool) {
        self.lock().fail_loads = fail;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl GraphBackend for MemoryBackend {
    async fn load_type_registry(&self) -> Result<TypeRegistry> {
        Ok(self.lock().types.clone())
    }

    async fn load_graph(&self, _org: OrgId) -> Result<(Vec<NodeRecord>, Vec<EdgeRecord>)> {
        let state = self.lock();
        if state.fail_loads {
            return Err(LibError::persistence(
                "Failed to load graph",
                anyhow!("memory backend configured to fail loads"),
            ));
        }
        let mut nodes: Vec<NodeRecord> = state
            .nodes
            .values()
            .filter(|record| record.stamps.deleted_at.is_none())
            .cloned()
            .collect();
        let mut edges: Vec<EdgeRecord> = state
            .edges
            .values()
            .filter(|record| record.stamps.deleted_at.is_none())
            .cloned()
            .collect();
        // Map iteration order is unstable; keep loads deterministic.
        nodes.sort_by_key(|record| record.id.0);
        edges.sort_by_key(|record| record.id.0);
        Ok((nodes, edges))
    }

    async fn upsert_nodes(
        &self,
        _org: OrgId,
        records: Vec<NodeRecord>,
        op: UpsertOp,
        actor: UserId,
    ) -> Result<()> {
        let now = Utc::now().naive_utc();
        let mut state = self.lock();
        state.upsert_calls += 1;
        if state.fail_upserts {
            return Err(LibError::persistence(
                "Failed to save nodes",
                anyhow!("memory backend configured to fail upserts"),
            ));
        }
        for mut record in records {
            match op {
                UpsertOp::Create => {
                    record.stamps.created_at = Some(now);
                    record.stamps.created_by = Some(actor);
                    state.nodes.insert(record.id, record);
                }
                UpsertOp::Update => {
                    record.stamps.updated_at = Some(now);
                    record.stamps.updated_by = Some(actor);
                    if let Some(existing) = state.nodes.get(&record.id) {
                        record.stamps.created_at = existing.stamps.created_at;
                        record.stamps.created_by = existing.stamps.created_by;
                    }
                    state.nodes.insert(record.id, record);
                }
                UpsertOp::Delete => {
                    if let Some(existing) = state.nodes.get_mut(&record.id) {
                        existing.stamps.deleted_at = Some(now);
                        existing.stamps.deleted_by = Some(actor);
                    }
                }
            }
        }
        state.node_stamp = Some(now);
        Ok(())
    }

    async fn upsert_edges(
        &self,
        _org: OrgId,
        records: Vec<EdgeRecord>,
        op: UpsertOp,
        actor: UserId,
    ) -> Result<()> {
        let now = Utc::now().naive_utc();
        let mut state = self.lock();
        state.upsert_calls += 1;
        if state.fail_upserts {
            return Err(LibError::persistence(
                "Failed to save edges",
                anyhow!("memory backend configured to fail upserts"),
            ));
        }
        for mut record in records {
            match op {
                UpsertOp::Create => {
                    record.stamps.created_at = Some(now);
                    record.stamps.created_by = Some(actor);
                    state.edges.insert(record.id, record);
                }
                UpsertOp::Update => {
                    record.stamps.updated_at = Some(now);
                    record.stamps.updated_by = Some(actor);
                    if let Some(existing) = state.edges.get(&record.id) {
                        record.stamps.created_at = existing.stamps.created_at;
                        record.stamps.created_by = existing.stamps.created_by;
                    }
                    state.edges.insert(record.id, record);
                }
                UpsertOp::Delete => {
                    if let Some(existing) = state.edges.get_mut(&record.id) {
                        existing.stamps.deleted_at = Some(now);
                        existing.stamps.deleted_by = Some(actor);
                    }
                }
            }
        }
        state.edge_stamp = Some(now);
        Ok(())
    }

    async fn last_updated_at(
        &self,
        table: ChangeTable,
        _org: OrgId,
    ) -> Result<Option<NaiveDateTime>> {
        let state = self.lock();
        Ok(match table {
            ChangeTable::Nodes => state.node_stamp,
            ChangeTable::Edges => state.edge_stamp,
            ChangeTable::RuleEvaluations => None,
        })
    }
}
