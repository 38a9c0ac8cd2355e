use async_trait::async_trait;
use chrono::NaiveDateTime;

use crate::error::Result;
use crate::models::{ChangeTable, EdgeRecord, NodeRecord, OrgId, TypeRegistry, UserId};

/// Persistence operation for a batch of records. `Delete` is always a soft
/// delete: rows are stamped, never removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOp {
    Create,
    Update,
    Delete,
}

impl UpsertOp {
    pub const fn as_db_value(self) -> &'static str {
        match self {
            UpsertOp::Create => "create",
            UpsertOp::Update => "update",
            UpsertOp::Delete => "delete",
        }
    }
}

/// The opaque persistence collaborator. The engine only ever talks CRUD plus
/// last-modified stamps; subscription transports are wired up separately and
/// deliver [`crate::models::ChangeEvent`]s to the session.
#[async_trait]
pub trait GraphBackend: Send + Sync {
    /// Semantic-type to type-id map; fetched once per session.
    async fn load_type_registry(&self) -> Result<TypeRegistry>;

    /// All live (not soft-deleted) node and edge records for an organization.
    async fn load_graph(&self, org: OrgId) -> Result<(Vec<NodeRecord>, Vec<EdgeRecord>)>;

    async fn upsert_nodes(
        &self,
        org: OrgId,
        records: Vec<NodeRecord>,
        op: UpsertOp,
        actor: UserId,
    ) -> Result<()>;

    async fn upsert_edges(
        &self,
        org: OrgId,
        records: Vec<EdgeRecord>,
        op: UpsertOp,
        actor: UserId,
    ) -> Result<()>;

    /// Most recent modification stamp for a table, used to skip reloads when
    /// nothing changed. `None` means unknown and forces a refetch.
    async fn last_updated_at(&self, table: ChangeTable, org: OrgId)
    -> Result<Option<NaiveDateTime>>;
}
