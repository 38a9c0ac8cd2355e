use anyhow::anyhow;
use once_cell::sync::Lazy;
use sqlx::migrate::{MigrateError, Migrator};
use sqlx::postgres::PgListener;
use sqlx::{FromRow, PgPool};
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use async_trait::async_trait;
use chrono::NaiveDateTime;

use crate::backend::{GraphBackend, UpsertOp};
use crate::error::{LibError, Result};
use crate::models::{
    AuditStamps, ChangeEvent, ChangeTable, EdgeId, EdgeKind, EdgeRecord, NodeId, NodeKind,
    NodeRecord, OrgId, TypeId, TypeRegistry, UserId,
};

pub static MIGRATOR: Lazy<Migrator> = Lazy::new(|| {
    let mut migrator = sqlx::migrate!("./migrations");
    migrator.set_ignore_missing(true);
    migrator
});

pub async fn create_graph_tables(pool: &PgPool) -> std::result::Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}

/// Postgres channel the change triggers notify on.
pub const CHANGE_CHANNEL: &str = "mgraph_changes";

/// [`GraphBackend`] over the `mgraph` schema. Deletes stamp rows instead of
/// removing them, and every write fires a NOTIFY that other sessions pick up
/// through [`subscribe_changes`].
#[derive(Debug, Clone)]
pub struct PgBackend {
    pool: PgPool,
}

impl PgBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, Clone, FromRow)]
struct TypeRow {
    id: Uuid,
    domain: String,
    name: String,
}

#[derive(Debug, Clone, FromRow)]
struct RecordRow {
    id: Uuid,
    type_id: Uuid,
    properties: serde_json::Value,
    display: serde_json::Value,
    created_at: Option<NaiveDateTime>,
    created_by: Option<Uuid>,
    updated_at: Option<NaiveDateTime>,
    updated_by: Option<Uuid>,
    deleted_at: Option<NaiveDateTime>,
    deleted_by: Option<Uuid>,
}

impl RecordRow {
    fn stamps(&self) -> AuditStamps {
        AuditStamps {
            created_at: self.created_at,
            created_by: self.created_by.map(UserId),
            updated_at: self.updated_at,
            updated_by: self.updated_by.map(UserId),
            deleted_at: self.deleted_at,
            deleted_by: self.deleted_by.map(UserId),
        }
    }
}

impl From<RecordRow> for NodeRecord {
    fn from(row: RecordRow) -> Self {
        let stamps = row.stamps();
        NodeRecord {
            id: NodeId(row.id),
            type_id: TypeId(row.type_id),
            properties: row.properties,
            display: row.display,
            stamps,
        }
    }
}

impl From<RecordRow> for EdgeRecord {
    fn from(row: RecordRow) -> Self {
        let stamps = row.stamps();
        EdgeRecord {
            id: EdgeId(row.id),
            type_id: TypeId(row.type_id),
            properties: row.properties,
            display: row.display,
            stamps,
        }
    }
}

fn db_err(public: &'static str, err: sqlx::Error) -> LibError {
    LibError::persistence(public, anyhow!(err))
}

const RECORD_COLUMNS: &str = "id, type_id, properties, display, \
     created_at, created_by, updated_at, updated_by, deleted_at, deleted_by";

async fn load_records(pool: &PgPool, table: ChangeTable, org: OrgId) -> Result<Vec<RecordRow>> {
    let query = format!(
        r#"
        SELECT {RECORD_COLUMNS}
        FROM mgraph.{}
        WHERE org_id = $1
          AND deleted_at IS NULL
        ORDER BY created_at ASC, id ASC
        "#,
        table.as_db_value(),
    );
    sqlx::query_as::<_, RecordRow>(&query)
        .bind(org.0)
        .fetch_all(pool)
        .await
        .map_err(|err| db_err("Failed to load the graph", err))
}

async fn upsert_records(
    pool: &PgPool,
    table: ChangeTable,
    org: OrgId,
    records: &[(Uuid, Uuid, &serde_json::Value, &serde_json::Value)],
    op: UpsertOp,
    actor: UserId,
) -> Result<()> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|err| db_err("Failed to start transaction", err))?;

    for (id, type_id, properties, display) in records {
        let result = match op {
            UpsertOp::Create => {
                let query = format!(
                    r#"
                    INSERT INTO mgraph.{} (id, org_id, type_id, properties, display, created_by)
                    VALUES ($1, $2, $3, $4, $5, $6)
                    ON CONFLICT (id) DO UPDATE
                    SET properties = EXCLUDED.properties,
                        display = EXCLUDED.display,
                        updated_at = CURRENT_TIMESTAMP,
                        updated_by = EXCLUDED.created_by,
                        deleted_at = NULL,
                        deleted_by = NULL
                    "#,
                    table.as_db_value(),
                );
                sqlx::query(&query)
                    .bind(id)
                    .bind(org.0)
                    .bind(type_id)
                    .bind(properties)
                    .bind(display)
                    .bind(actor.0)
                    .execute(&mut *tx)
                    .await
            }
            UpsertOp::Update => {
                let query = format!(
                    r#"
                    UPDATE mgraph.{}
                    SET type_id = $3,
                        properties = $4,
                        display = $5,
                        updated_at = CURRENT_TIMESTAMP,
                        updated_by = $6
                    WHERE id = $1
                      AND org_id = $2
                    "#,
                    table.as_db_value(),
                );
                sqlx::query(&query)
                    .bind(id)
                    .bind(org.0)
                    .bind(type_id)
                    .bind(properties)
                    .bind(display)
                    .bind(actor.0)
                    .execute(&mut *tx)
                    .await
            }
            UpsertOp::Delete => {
                let query = format!(
                    r#"
                    UPDATE mgraph.{}
                    SET deleted_at = CURRENT_TIMESTAMP,
                        deleted_by = $3
                    WHERE id = $1
                      AND org_id = $2
                      AND deleted_at IS NULL
                    "#,
                    table.as_db_value(),
                );
                sqlx::query(&query)
                    .bind(id)
                    .bind(org.0)
                    .bind(actor.0)
                    .execute(&mut *tx)
                    .await
            }
        };
        result.map_err(|err| db_err("Failed to save graph changes", err))?;
    }

    tx.commit()
        .await
        .map_err(|err| db_err("Failed to commit transaction", err))
}

#[async_trait]
impl GraphBackend for PgBackend {
    async fn load_type_registry(&self) -> Result<TypeRegistry> {
        let rows = sqlx::query_as::<_, TypeRow>(
            r#"
            SELECT id, domain, name
            FROM mgraph.graph_types
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|err| db_err("Failed to load graph types", err))?;

        let mut types = TypeRegistry::default();
        for row in rows {
            match row.domain.as_str() {
                "node" => {
                    if let Some(kind) = NodeKind::from_db_value(&row.name) {
                        types.insert_node_type(kind, TypeId(row.id));
                    }
                }
                "edge" => {
                    if let Some(kind) = EdgeKind::from_db_value(&row.name) {
                        types.insert_edge_type(kind, TypeId(row.id));
                    }
                }
                other => {
                    warn!(domain = other, "unrecognized graph type row");
                }
            }
        }
        Ok(types)
    }

    async fn load_graph(&self, org: OrgId) -> Result<(Vec<NodeRecord>, Vec<EdgeRecord>)> {
        let nodes = load_records(&self.pool, ChangeTable::Nodes, org)
            .await?
            .into_iter()
            .map(NodeRecord::from)
            .collect();
        let edges = load_records(&self.pool, ChangeTable::Edges, org)
            .await?
            .into_iter()
            .map(EdgeRecord::from)
            .collect();
        Ok((nodes, edges))
    }

    async fn upsert_nodes(
        &self,
        org: OrgId,
        records: Vec<NodeRecord>,
        op: UpsertOp,
        actor: UserId,
    ) -> Result<()> {
        let rows: Vec<_> = records
            .iter()
            .map(|record| (record.id.0, record.type_id.0, &record.properties, &record.display))
            .collect();
        upsert_records(&self.pool, ChangeTable::Nodes, org, &rows, op, actor).await
    }

    async fn upsert_edges(
        &self,
        org: OrgId,
        records: Vec<EdgeRecord>,
        op: UpsertOp,
        actor: UserId,
    ) -> Result<()> {
        let rows: Vec<_> = records
            .iter()
            .map(|record| (record.id.0, record.type_id.0, &record.properties, &record.display))
            .collect();
        upsert_records(&self.pool, ChangeTable::Edges, org, &rows, op, actor).await
    }

    async fn last_updated_at(
        &self,
        table: ChangeTable,
        org: OrgId,
    ) -> Result<Option<NaiveDateTime>> {
        if table == ChangeTable::RuleEvaluations {
            let stamp: (Option<NaiveDateTime>,) = sqlx::query_as(
                r#"
                SELECT MAX(evaluated_at)
                FROM mgraph.rule_evaluations
                WHERE org_id = $1
                "#,
            )
            .bind(org.0)
            .fetch_one(&self.pool)
            .await
            .map_err(|err| db_err("Failed to query modification stamps", err))?;
            return Ok(stamp.0);
        }

        let query = format!(
            r#"
            SELECT MAX(GREATEST(
                created_at,
                COALESCE(updated_at, created_at),
                COALESCE(deleted_at, created_at)
            ))
            FROM mgraph.{}
            WHERE org_id = $1
            "#,
            table.as_db_value(),
        );
        let stamp: (Option<NaiveDateTime>,) = sqlx::query_as(&query)
            .bind(org.0)
            .fetch_one(&self.pool)
            .await
            .map_err(|err| db_err("Failed to query modification stamps", err))?;
        Ok(stamp.0)
    }
}

/// LISTEN on the change channel and hand decoded events to the caller. One
/// undecodable payload is logged and skipped; the listener task ends when the
/// receiver is dropped or the connection is lost.
pub async fn subscribe_changes(pool: &PgPool) -> Result<mpsc::Receiver<ChangeEvent>> {
    let mut listener = PgListener::connect_with(pool)
        .await
        .map_err(|err| db_err("Failed to open the change stream", err))?;
    listener
        .listen(CHANGE_CHANNEL)
        .await
        .map_err(|err| db_err("Failed to open the change stream", err))?;

    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(async move {
        loop {
            let notification = match listener.recv().await {
                Ok(notification) => notification,
                Err(err) => {
                    warn!(error = %err, "change stream closed");
                    break;
                }
            };
            let event: ChangeEvent = match serde_json::from_str(notification.payload()) {
                Ok(event) => event,
                Err(err) => {
                    warn!(error = %err, "undecodable change payload");
                    continue;
                }
            };
            if tx.send(event).await.is_err() {
                break;
            }
        }
    });
    Ok(rx)
}
