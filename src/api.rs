use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use crate::algorithms::{Direction, ObjectRef, connected_objects};
use crate::backend::GraphBackend;
use crate::error::{ErrorKind, LibError};
use crate::invariants::graph_invariant_violations;
use crate::models::{Edge, Graph, Node, NodeId, OrgId};

#[derive(Debug)]
pub struct AppError(pub LibError);

impl From<LibError> for AppError {
    fn from(value: LibError) -> Self {
        Self(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self.0.kind {
            ErrorKind::Persistence => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
        };

        tracing::error!(kind = ?self.0.kind, error = %self.0.source, "graph api request failed");
        (status, self.0.public).into_response()
    }
}

/// Application state for the read-side graph routes. Editing stays in the
/// client session; the HTTP surface only loads and inspects.
pub trait GraphApp {
    fn backend(&self) -> Arc<dyn GraphBackend>;
}

async fn load_graph(backend: &dyn GraphBackend, org: OrgId) -> Result<Graph, AppError> {
    let (node_records, edge_records) = backend.load_graph(org).await?;
    let nodes = node_records
        .iter()
        .map(Node::from_record)
        .collect::<crate::error::Result<Vec<_>>>()?;
    let edges = edge_records
        .iter()
        .map(Edge::from_record)
        .collect::<crate::error::Result<Vec<_>>>()?;
    Ok(Graph { nodes, edges })
}

async fn get_graph_handler<S>(
    State(app): State<S>,
    Path(org_id): Path<OrgId>,
) -> Result<impl IntoResponse, AppError>
where
    S: GraphApp + Clone + Send + Sync + 'static,
{
    let graph = load_graph(app.backend().as_ref(), org_id).await?;
    Ok(Json(graph))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectedQuery {
    max_degrees: Option<u32>,
    direction: Option<Direction>,
}

async fn connected_objects_handler<S>(
    State(app): State<S>,
    Path((org_id, node_id)): Path<(OrgId, NodeId)>,
    Query(query): Query<ConnectedQuery>,
) -> Result<impl IntoResponse, AppError>
where
    S: GraphApp + Clone + Send + Sync + 'static,
{
    let graph = load_graph(app.backend().as_ref(), org_id).await?;
    if graph.node(node_id).is_none() {
        return Err(AppError(LibError::not_found(
            "Node not found",
            anyhow::anyhow!("node {node_id} not in graph for org {org_id}"),
        )));
    }
    let objects = connected_objects(
        &graph,
        ObjectRef::node(node_id),
        query.max_degrees,
        query.direction,
    );
    Ok(Json(objects))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ValidationReport {
    valid: bool,
    violations: Vec<ValidationIssue>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ValidationIssue {
    code: &'static str,
    message: &'static str,
}

async fn validate_graph_handler(Json(graph): Json<Graph>) -> impl IntoResponse {
    let violations: Vec<ValidationIssue> = graph_invariant_violations(&graph.nodes, &graph.edges)
        .into_iter()
        .map(|violation| ValidationIssue {
            code: violation.error_code(),
            message: violation.public_message(),
        })
        .collect();
    Json(ValidationReport {
        valid: violations.is_empty(),
        violations,
    })
}

pub fn routes<S>() -> Router<S>
where
    S: GraphApp + Clone + Send + Sync + 'static,
{
    tracing::info!("Registering route /graph/{{org_id}} [GET]");
    tracing::info!("Registering route /graph/{{org_id}}/connected/{{node_id}} [GET]");
    tracing::info!("Registering route /graph/validate [POST]");

    Router::new()
        .route("/graph/validate", post(validate_graph_handler))
        .route("/graph/{org_id}", get(get_graph_handler::<S>))
        .route(
            "/graph/{org_id}/connected/{node_id}",
            get(connected_objects_handler::<S>),
        )
}
