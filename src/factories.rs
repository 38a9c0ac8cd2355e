use anyhow::anyhow;

use crate::error::{LibError, Result};
use crate::models::{
    Edge, EdgeId, EdgeKind, FunctionSymbol, Handle, Node, NodeData, NodeId, NodeKind, Position,
    Rect, TypeRegistry,
};

/// New metric node centered on `at` (normally the viewport center).
pub fn form_metric_node(types: &TypeRegistry, at: Position) -> Result<Node> {
    let type_id = types.node_type_id(NodeKind::Metric)?;
    Ok(Node {
        id: NodeId::random(),
        type_id,
        position: centered_position(at, NodeKind::Metric),
        width: None,
        height: None,
        selected: false,
        data: NodeData::Metric {
            name: String::new(),
            description: None,
            source_query: None,
            source_connection: None,
            rule_status: None,
        },
    })
}

pub fn form_custom_node(types: &TypeRegistry, at: Position) -> Result<Node> {
    let type_id = types.node_type_id(NodeKind::Custom)?;
    Ok(Node {
        id: NodeId::random(),
        type_id,
        position: centered_position(at, NodeKind::Custom),
        width: None,
        height: None,
        selected: false,
        data: NodeData::Custom {
            name: String::new(),
            content: String::new(),
        },
    })
}

pub fn form_mission_node(types: &TypeRegistry, at: Position) -> Result<Node> {
    let type_id = types.node_type_id(NodeKind::Mission)?;
    Ok(Node {
        id: NodeId::random(),
        type_id,
        position: centered_position(at, NodeKind::Mission),
        width: None,
        height: None,
        selected: false,
        data: NodeData::Mission {
            name: String::new(),
            description: None,
        },
    })
}

/// New function node placed at the geometric centroid of the variable nodes it
/// connects, offset so its fixed size is centered on that centroid.
pub fn form_function_node(
    types: &TypeRegistry,
    symbol: FunctionSymbol,
    input_nodes: &[&Node],
    output_node: &Node,
) -> Result<Node> {
    let type_id = types.node_type_id(NodeKind::Function)?;
    if input_nodes.is_empty() {
        return Err(LibError::validation(
            "A function node needs at least one input",
            anyhow!("form_function_node called with no input nodes"),
        ));
    }

    let mut x = 0.0;
    let mut y = 0.0;
    for node in input_nodes.iter().copied().chain([output_node]) {
        let center = node.rect().center();
        x += center.x;
        y += center.y;
    }
    let count = (input_nodes.len() + 1) as f64;
    let centroid = Position::new(x / count, y / count);

    Ok(Node {
        id: NodeId::random(),
        type_id,
        position: centered_position(centroid, NodeKind::Function),
        width: None,
        height: None,
        selected: false,
        data: NodeData::Function { symbol },
    })
}

/// New input edge from `source` to `target`. The display endpoints default to
/// the semantic ones; formula compilation overrides them so chain-internal
/// function-to-function edges render as connecting the outer variables.
pub fn form_input_edge(
    types: &TypeRegistry,
    source: &Node,
    target: &Node,
    display_source: Option<&Node>,
    display_target: Option<&Node>,
) -> Result<Edge> {
    let type_id = types.edge_type_id(EdgeKind::Input)?;
    let display_source = display_source.unwrap_or(source);
    let display_target = display_target.unwrap_or(target);
    let (source_handle, target_handle) =
        nearest_handle_pair(display_source.rect(), display_target.rect());

    Ok(Edge {
        id: EdgeId::random(),
        type_id,
        source: display_source.id,
        target: display_target.id,
        source_handle,
        target_handle,
        selected: false,
        source_id: source.id,
        target_id: target.id,
    })
}

/// Pick the pair of side anchors with minimum Euclidean distance between the
/// two rectangles. Ties keep the earlier pair in top/right/bottom/left order.
pub fn nearest_handle_pair(source: Rect, target: Rect) -> (Handle, Handle) {
    let mut best = (Handle::Top, Handle::Top);
    let mut best_distance = f64::INFINITY;
    for source_handle in Handle::ALL {
        let from = source_handle.anchor(source);
        for target_handle in Handle::ALL {
            let distance = from.distance_to(target_handle.anchor(target));
            if distance < best_distance {
                best_distance = distance;
                best = (source_handle, target_handle);
            }
        }
    }
    best
}

fn centered_position(center: Position, kind: NodeKind) -> Position {
    let (width, height) = kind.default_size();
    Position::new(center.x - width / 2.0, center.y - height / 2.0)
}
