use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use uuid::Uuid;

use crate::error::{LibError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct NodeId(pub Uuid);

impl NodeId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::from_str(s).map(Self)
    }
}

impl From<Uuid> for NodeId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct EdgeId(pub Uuid);

impl EdgeId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EdgeId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::from_str(s).map(Self)
    }
}

impl From<Uuid> for EdgeId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

/// Persisted identifier of a semantic node/edge type, looked up once at
/// session start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct TypeId(pub Uuid);

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for TypeId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct OrgId(pub Uuid);

impl fmt::Display for OrgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for OrgId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct UserId(pub Uuid);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for UserId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Mission,
    Metric,
    Function,
    Custom,
}

impl NodeKind {
    pub const fn as_db_value(self) -> &'static str {
        match self {
            NodeKind::Mission => "mission",
            NodeKind::Metric => "metric",
            NodeKind::Function => "function",
            NodeKind::Custom => "custom",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "mission" => Some(NodeKind::Mission),
            "metric" => Some(NodeKind::Metric),
            "function" => Some(NodeKind::Function),
            "custom" => Some(NodeKind::Custom),
            _ => None,
        }
    }

    /// Substantive nodes are the unit of distance in bounded traversal;
    /// function nodes are free hops so a whole formula chain counts as one.
    pub const fn is_substantive(self) -> bool {
        matches!(self, NodeKind::Metric | NodeKind::Custom)
    }

    /// Default on-canvas size before the user resizes a node. Function nodes
    /// always render at this fixed size.
    pub const fn default_size(self) -> (f64, f64) {
        match self {
            NodeKind::Mission => (288.0, 144.0),
            NodeKind::Metric => (256.0, 160.0),
            NodeKind::Function => (96.0, 96.0),
            NodeKind::Custom => (256.0, 160.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EdgeKind {
    #[default]
    Input,
}

impl EdgeKind {
    pub const fn as_db_value(self) -> &'static str {
        match self {
            EdgeKind::Input => "input",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "input" => Some(EdgeKind::Input),
            _ => None,
        }
    }
}

/// Operator or identity symbol carried by a function node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FunctionSymbol {
    Identity,
    Add,
    Subtract,
    Multiply,
    Divide,
    Power,
}

impl FunctionSymbol {
    pub const fn as_str(self) -> &'static str {
        match self {
            FunctionSymbol::Identity => "=",
            FunctionSymbol::Add => "+",
            FunctionSymbol::Subtract => "-",
            FunctionSymbol::Multiply => "*",
            FunctionSymbol::Divide => "/",
            FunctionSymbol::Power => "^",
        }
    }

    pub fn from_symbol(value: &str) -> Option<Self> {
        match value {
            "=" => Some(FunctionSymbol::Identity),
            "+" => Some(FunctionSymbol::Add),
            "-" => Some(FunctionSymbol::Subtract),
            "*" => Some(FunctionSymbol::Multiply),
            "/" => Some(FunctionSymbol::Divide),
            "^" => Some(FunctionSymbol::Power),
            _ => None,
        }
    }
}

impl fmt::Display for FunctionSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Latest monitoring-rule evaluation outcome for a metric node. Updated only
/// by real-time merge, never by local edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleStatus {
    Ok,
    Alert,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance_to(self, other: Position) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }
}

/// Side of a node rectangle an edge visually attaches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Handle {
    Top,
    Right,
    Bottom,
    Left,
}

impl Handle {
    /// Tie-break iteration order for nearest-handle matching.
    pub const ALL: [Handle; 4] = [Handle::Top, Handle::Right, Handle::Bottom, Handle::Left];

    /// Anchor point of this handle on the given rectangle.
    pub fn anchor(self, rect: Rect) -> Position {
        match self {
            Handle::Top => Position::new(rect.x + rect.width / 2.0, rect.y),
            Handle::Right => Position::new(rect.x + rect.width, rect.y + rect.height / 2.0),
            Handle::Bottom => Position::new(rect.x + rect.width / 2.0, rect.y + rect.height),
            Handle::Left => Position::new(rect.x, rect.y + rect.height / 2.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn center(self) -> Position {
        Position::new(self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

/// Type-specific node payload. Tagged so traversal and factory code can match
/// exhaustively instead of probing property bags for field presence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NodeData {
    Mission {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    Metric {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        /// Opaque query text passed through to the query-execution collaborator.
        #[serde(default, rename = "sourceQuery", skip_serializing_if = "Option::is_none")]
        source_query: Option<String>,
        #[serde(
            default,
            rename = "sourceConnection",
            skip_serializing_if = "Option::is_none"
        )]
        source_connection: Option<String>,
        #[serde(default, rename = "ruleStatus", skip_serializing_if = "Option::is_none")]
        rule_status: Option<RuleStatus>,
    },
    Function {
        symbol: FunctionSymbol,
    },
    Custom {
        name: String,
        #[serde(default)]
        content: String,
    },
}

impl NodeData {
    pub const fn kind(&self) -> NodeKind {
        match self {
            NodeData::Mission { .. } => NodeKind::Mission,
            NodeData::Metric { .. } => NodeKind::Metric,
            NodeData::Function { .. } => NodeKind::Function,
            NodeData::Custom { .. } => NodeKind::Custom,
        }
    }

    /// Display name; function nodes display their symbol.
    pub fn name(&self) -> &str {
        match self {
            NodeData::Mission { name, .. } => name,
            NodeData::Metric { name, .. } => name,
            NodeData::Function { symbol } => symbol.as_str(),
            NodeData::Custom { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: NodeId,
    pub type_id: TypeId,
    pub position: Position,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
    #[serde(default)]
    pub selected: bool,
    pub data: NodeData,
}

impl Node {
    pub fn kind(&self) -> NodeKind {
        self.data.kind()
    }

    /// Bounding rectangle using the user-set size, falling back to the
    /// per-kind default.
    pub fn rect(&self) -> Rect {
        let (default_width, default_height) = self.kind().default_size();
        Rect {
            x: self.position.x,
            y: self.position.y,
            width: self.width.unwrap_or(default_width),
            height: self.height.unwrap_or(default_height),
        }
    }
}

/// Directed link between two nodes. `source`/`target` are the endpoints used
/// for rendering and may stand in for a collapsed function chain;
/// `source_id`/`target_id` are the true semantic endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub id: EdgeId,
    pub type_id: TypeId,
    pub source: NodeId,
    pub target: NodeId,
    pub source_handle: Handle,
    pub target_handle: Handle,
    #[serde(default)]
    pub selected: bool,
    pub source_id: NodeId,
    pub target_id: NodeId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Graph {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

impl Graph {
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.iter().find(|node| node.id == id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|node| node.id == id)
    }

    pub fn edge(&self, id: EdgeId) -> Option<&Edge> {
        self.edges.iter().find(|edge| edge.id == id)
    }

    pub fn edge_mut(&mut self, id: EdgeId) -> Option<&mut Edge> {
        self.edges.iter_mut().find(|edge| edge.id == id)
    }

    pub fn contains_node(&self, id: NodeId) -> bool {
        self.node(id).is_some()
    }

    /// Replace the node with the same id, or append if absent.
    pub fn upsert_node(&mut self, node: Node) {
        match self.node_mut(node.id) {
            Some(existing) => *existing = node,
            None => self.nodes.push(node),
        }
    }

    pub fn upsert_edge(&mut self, edge: Edge) {
        match self.edge_mut(edge.id) {
            Some(existing) => *existing = edge,
            None => self.edges.push(edge),
        }
    }

    pub fn remove_node(&mut self, id: NodeId) -> bool {
        let before = self.nodes.len();
        self.nodes.retain(|node| node.id != id);
        self.nodes.len() != before
    }

    pub fn remove_edge(&mut self, id: EdgeId) -> bool {
        let before = self.edges.len();
        self.edges.retain(|edge| edge.id != id);
        self.edges.len() != before
    }

    /// Deep equality ignoring the transient `selected` flags.
    pub fn eq_ignoring_selection(&self, other: &Graph) -> bool {
        self.nodes.len() == other.nodes.len()
            && self.edges.len() == other.edges.len()
            && self.nodes.iter().zip(&other.nodes).all(|(a, b)| {
                let mut b = b.clone();
                b.selected = a.selected;
                *a == b
            })
            && self.edges.iter().zip(&other.edges).all(|(a, b)| {
                let mut b = b.clone();
                b.selected = a.selected;
                *a == b
            })
    }
}

/// Partial graph update merged into the working graph by the store. A `None`
/// field leaves that collection untouched.
#[derive(Debug, Clone, Default)]
pub struct GraphPatch {
    pub nodes: Option<Vec<Node>>,
    pub edges: Option<Vec<Edge>>,
}

impl GraphPatch {
    pub fn nodes(nodes: Vec<Node>) -> Self {
        Self {
            nodes: Some(nodes),
            edges: None,
        }
    }

    pub fn edges(edges: Vec<Edge>) -> Self {
        Self {
            nodes: None,
            edges: Some(edges),
        }
    }

    pub fn both(nodes: Vec<Node>, edges: Vec<Edge>) -> Self {
        Self {
            nodes: Some(nodes),
            edges: Some(edges),
        }
    }
}

/// Semantic-type to persisted-type-id map, loaded once from the backend.
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    node_types: HashMap<NodeKind, TypeId>,
    edge_types: HashMap<EdgeKind, TypeId>,
}

impl TypeRegistry {
    pub fn new(
        node_types: HashMap<NodeKind, TypeId>,
        edge_types: HashMap<EdgeKind, TypeId>,
    ) -> Self {
        Self {
            node_types,
            edge_types,
        }
    }

    pub fn insert_node_type(&mut self, kind: NodeKind, type_id: TypeId) {
        self.node_types.insert(kind, type_id);
    }

    pub fn insert_edge_type(&mut self, kind: EdgeKind, type_id: TypeId) {
        self.edge_types.insert(kind, type_id);
    }

    pub fn node_type_id(&self, kind: NodeKind) -> Result<TypeId> {
        self.node_types.get(&kind).copied().ok_or_else(|| {
            LibError::validation_with_code(
                "type_registry_missing",
                "Graph types are not loaded yet",
                anyhow!("no type id registered for node kind {}", kind.as_db_value()),
            )
        })
    }

    pub fn edge_type_id(&self, kind: EdgeKind) -> Result<TypeId> {
        self.edge_types.get(&kind).copied().ok_or_else(|| {
            LibError::validation_with_code(
                "type_registry_missing",
                "Graph types are not loaded yet",
                anyhow!("no type id registered for edge kind {}", kind.as_db_value()),
            )
        })
    }
}

/// Display-metadata bag persisted separately from the logical property bag so
/// integrations that only touch properties never clobber layout state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDisplay {
    pub position: Position,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeDisplay {
    pub source: NodeId,
    pub target: NodeId,
    pub source_handle: Handle,
    pub target_handle: Handle,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AuditStamps {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<NaiveDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<NaiveDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<NaiveDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_by: Option<UserId>,
}

/// Persistence shape of a node: logical properties and display metadata kept
/// in two separate bags.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecord {
    pub id: NodeId,
    pub type_id: TypeId,
    pub properties: Value,
    pub display: Value,
    #[serde(flatten)]
    pub stamps: AuditStamps,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeRecord {
    pub id: EdgeId,
    pub type_id: TypeId,
    pub properties: Value,
    pub display: Value,
    #[serde(flatten)]
    pub stamps: AuditStamps,
}

impl Node {
    /// Shape this node for persistence. `base_properties` is the server-side
    /// property bag captured at load time; local logical properties are merged
    /// on top of it so out-of-band additions survive a save.
    pub fn to_record(&self, base_properties: Option<&Value>) -> Result<NodeRecord> {
        let local = serde_json::to_value(&self.data)?;
        let display = serde_json::to_value(NodeDisplay {
            position: self.position,
            width: self.width,
            height: self.height,
        })?;
        Ok(NodeRecord {
            id: self.id,
            type_id: self.type_id,
            properties: merge_property_bags(base_properties, local),
            display,
            stamps: AuditStamps::default(),
        })
    }

    pub fn from_record(record: &NodeRecord) -> Result<Node> {
        let data: NodeData = serde_json::from_value(record.properties.clone())?;
        let display: NodeDisplay = serde_json::from_value(record.display.clone())?;
        Ok(Node {
            id: record.id,
            type_id: record.type_id,
            position: display.position,
            width: display.width,
            height: display.height,
            selected: false,
            data,
        })
    }
}

impl Edge {
    pub fn to_record(&self, base_properties: Option<&Value>) -> Result<EdgeRecord> {
        let local = json!({
            "sourceId": self.source_id,
            "targetId": self.target_id,
        });
        let display = serde_json::to_value(EdgeDisplay {
            source: self.source,
            target: self.target,
            source_handle: self.source_handle,
            target_handle: self.target_handle,
        })?;
        Ok(EdgeRecord {
            id: self.id,
            type_id: self.type_id,
            properties: merge_property_bags(base_properties, local),
            display,
            stamps: AuditStamps::default(),
        })
    }

    pub fn from_record(record: &EdgeRecord) -> Result<Edge> {
        let source_id = required_node_ref(&record.properties, "sourceId")?;
        let target_id = required_node_ref(&record.properties, "targetId")?;
        let display: EdgeDisplay = serde_json::from_value(record.display.clone())?;
        Ok(Edge {
            id: record.id,
            type_id: record.type_id,
            source: display.source,
            target: display.target,
            source_handle: display.source_handle,
            target_handle: display.target_handle,
            selected: false,
            source_id,
            target_id,
        })
    }
}

fn required_node_ref(properties: &Value, key: &'static str) -> Result<NodeId> {
    let raw = properties.get(key).ok_or_else(|| {
        LibError::validation(
            "Edge record is missing a semantic endpoint",
            anyhow!("edge properties missing `{key}`"),
        )
    })?;
    Ok(serde_json::from_value(raw.clone())?)
}

/// Overlay `local` keys on top of the server-side bag. Non-object bases are
/// replaced outright.
pub fn merge_property_bags(base: Option<&Value>, local: Value) -> Value {
    let Some(Value::Object(base_map)) = base else {
        return local;
    };
    let Value::Object(local_map) = local else {
        return local;
    };
    let mut merged: Map<String, Value> = base_map.clone();
    for (key, value) in local_map {
        merged.insert(key, value);
    }
    Value::Object(merged)
}

/// Table a real-time change notification originates from. The three streams
/// are independent subscriptions with no total order across them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeTable {
    Nodes,
    Edges,
    RuleEvaluations,
}

impl ChangeTable {
    pub const fn as_db_value(self) -> &'static str {
        match self {
            ChangeTable::Nodes => "nodes",
            ChangeTable::Edges => "edges",
            ChangeTable::RuleEvaluations => "rule_evaluations",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "nodes" => Some(ChangeTable::Nodes),
            "edges" => Some(ChangeTable::Edges),
            "rule_evaluations" => Some(ChangeTable::RuleEvaluations),
            _ => None,
        }
    }
}

/// Soft deletes arrive as `Update` events with `deletedAt` set on the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub table: ChangeTable,
    pub kind: ChangeKind,
    pub record: Value,
}

/// Monitoring-rule evaluation outcome pushed on the rule-evaluation stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleEvaluation {
    pub id: Uuid,
    pub node_id: NodeId,
    pub status: RuleStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluated_at: Option<NaiveDateTime>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metric(name: &str) -> Node {
        Node {
            id: NodeId::random(),
            type_id: TypeId(Uuid::new_v4()),
            position: Position::new(100.0, 200.0),
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

    #[test]
    fn node_rect_falls_back_to_kind_default() {
        let node = metric("Revenue");
        let rect = node.rect();
        let (width, height) = NodeKind::Metric.default_size();
        assert_eq!(rect.width, width);
        assert_eq!(rect.height, height);

        let mut resized = metric("Revenue");
        resized.width = Some(10.0);
        resized.height = Some(20.0);
        assert_eq!(resized.rect().width, 10.0);
        assert_eq!(resized.rect().height, 20.0);
    }

    #[test]
    fn eq_ignoring_selection_masks_selected_flags() {
        let node = metric("Revenue");
        let mut selected = node.clone();
        selected.selected = true;

        let a = Graph {
            nodes: vec![node],
            edges: vec![],
        };
        let b = Graph {
            nodes: vec![selected],
            edges: vec![],
        };
        assert_ne!(a, b);
        assert!(a.eq_ignoring_selection(&b));
    }

    #[test]
    fn node_record_round_trip_preserves_data_and_display() {
        let mut node = metric("Revenue");
        node.width = Some(300.0);
        let record = node.to_record(None).expect("record should shape");
        let back = Node::from_record(&record).expect("record should parse");
        assert_eq!(back, node);
    }

    #[test]
    fn to_record_merges_over_server_side_properties() {
        let node = metric("Revenue");
        let base = json!({"type": "metric", "name": "Old", "externalTag": "finance"});
        let record = node.to_record(Some(&base)).expect("record should shape");
        assert_eq!(record.properties["name"], json!("Revenue"));
        // Out-of-band keys added by other integrations survive the save.
        assert_eq!(record.properties["externalTag"], json!("finance"));
    }

    #[test]
    fn edge_record_requires_semantic_endpoints() {
        let record = EdgeRecord {
            id: EdgeId::random(),
            type_id: TypeId(Uuid::new_v4()),
            properties: json!({"sourceId": NodeId::random()}),
            display: json!({
                "source": NodeId::random(),
                "target": NodeId::random(),
                "sourceHandle": "top",
                "targetHandle": "bottom",
            }),
            stamps: AuditStamps::default(),
        };
        let err = Edge::from_record(&record).expect_err("missing targetId should fail");
        assert_eq!(err.kind, crate::error::ErrorKind::Validation);
    }

    #[test]
    fn upsert_node_replaces_by_id() {
        let node = metric("Revenue");
        let mut graph = Graph {
            nodes: vec![node.clone()],
            edges: vec![],
        };
        let mut renamed = node.clone();
        renamed.data = NodeData::Metric {
            name: "ARR".to_string(),
            description: None,
            source_query: None,
            source_connection: None,
            rule_status: None,
        };
        graph.upsert_node(renamed);
        assert_eq!(graph.nodes.len(), 1);
        assert_eq!(graph.nodes[0].data.name(), "ARR");
    }

    #[test]
    fn node_data_parses_with_unknown_property_keys() {
        let value = json!({
            "type": "metric",
            "name": "Revenue",
            "externalTag": "finance"
        });
        let data: NodeData = serde_json::from_value(value).expect("unknown keys are tolerated");
        assert_eq!(data.kind(), NodeKind::Metric);
    }
}
