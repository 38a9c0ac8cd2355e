use std::collections::HashSet;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::error::{LibError, Result};
use crate::factories::{form_function_node, form_input_edge};
use crate::models::{Edge, FunctionSymbol, Graph, Node, NodeId, NodeKind, TypeRegistry};

/// One position of a formula as entered left-to-right: the output variable,
/// its identity symbol, then an alternating input chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FormulaToken {
    Variable { id: NodeId },
    Function { symbol: FunctionSymbol },
}

/// Function-node subgraph produced by compiling a formula. All ids are fresh;
/// merging into the working graph is the caller's responsibility.
#[derive(Debug, Clone)]
pub struct CompiledFormula {
    pub function_nodes: Vec<Node>,
    pub input_edges: Vec<Edge>,
}

/// Compile a formula into one function node per operator plus a final
/// identity node wired to the true output variable, two input edges per
/// function node.
///
/// The first operator's left edge points directly at the leftmost variable;
/// every later chain edge semantically leaves the previous function node while
/// displaying the intervening variable as its source. This asymmetry matches
/// the shipped editor behavior and is kept deliberately.
pub fn compile_formula(
    graph: &Graph,
    types: &TypeRegistry,
    formula: &[FormulaToken],
) -> Result<CompiledFormula> {
    validate_formula(formula)?;

    let output = resolve_variable(graph, formula[0])?;
    let identity_symbol = expect_function(formula[1])?;
    let input_symbols = &formula[2..];

    let mut function_nodes: Vec<Node> = Vec::new();
    let mut input_edges: Vec<Edge> = Vec::new();
    let mut previous_function: Option<Node> = None;

    let mut index = 1;
    while index < input_symbols.len() {
        let operator = expect_function(input_symbols[index])?;
        let left = resolve_variable(graph, input_symbols[index - 1])?;
        let right = resolve_variable(graph, input_symbols[index + 1])?;

        let function = form_function_node(types, operator, &[left, right], output)?;
        match &previous_function {
            None => {
                input_edges.push(form_input_edge(types, left, &function, None, None)?);
            }
            Some(previous) => {
                input_edges.push(form_input_edge(
                    types,
                    previous,
                    &function,
                    Some(left),
                    None,
                )?);
            }
        }
        input_edges.push(form_input_edge(types, right, &function, None, None)?);

        function_nodes.push(function.clone());
        previous_function = Some(function);
        index += 2;
    }

    let last_variable = resolve_variable(graph, input_symbols[input_symbols.len() - 1])?;
    let chain_tail = previous_function.as_ref().unwrap_or(last_variable);
    let identity = form_function_node(types, identity_symbol, &[chain_tail], output)?;
    match &previous_function {
        None => {
            input_edges.push(form_input_edge(types, last_variable, &identity, None, None)?);
        }
        Some(previous) => {
            input_edges.push(form_input_edge(
                types,
                previous,
                &identity,
                Some(last_variable),
                None,
            )?);
        }
    }
    input_edges.push(form_input_edge(types, &identity, output, None, None)?);
    function_nodes.push(identity);

    Ok(CompiledFormula {
        function_nodes,
        input_edges,
    })
}

/// Syntactic checks run before any node is constructed.
pub fn validate_formula(formula: &[FormulaToken]) -> Result<()> {
    if formula.len() < 3 {
        return Err(LibError::validation_with_code(
            "formula_too_short",
            "A formula needs an output, a function, and at least one input",
            anyhow!("formula has {} tokens", formula.len()),
        ));
    }
    if matches!(formula[formula.len() - 1], FormulaToken::Function { .. }) {
        return Err(LibError::validation_with_code(
            "formula_ends_on_function",
            "A formula cannot end on a function symbol",
            anyhow!("last of {} tokens is a function", formula.len()),
        ));
    }
    for (index, token) in formula.iter().enumerate() {
        let expects_variable = index % 2 == 0;
        let is_variable = matches!(token, FormulaToken::Variable { .. });
        if expects_variable != is_variable {
            return Err(LibError::validation_with_code(
                "formula_malformed",
                "Formula must alternate variables and function symbols",
                anyhow!("unexpected token at position {index}"),
            ));
        }
    }
    Ok(())
}

/// Rendered input chains feeding `node_id`, one string per formula, e.g.
/// `"B + C * D"`. Re-derived from the graph by expanding each adjacent
/// function chain and reading it back in output-then-input order.
pub fn input_expressions(graph: &Graph, node_id: NodeId) -> Vec<String> {
    let mut expressions = Vec::new();
    for edge in &graph.edges {
        if edge.target_id != node_id {
            continue;
        }
        let Some(source) = graph.node(edge.source_id) else {
            continue;
        };
        if source.kind() != NodeKind::Function {
            continue;
        }
        let mut visited = HashSet::new();
        let tokens = render_input_tokens(graph, source, &mut visited);
        if !tokens.is_empty() {
            expressions.push(tokens.join(" "));
        }
    }
    expressions
}

/// Names of the variables each chain starting at `node_id` ultimately feeds.
pub fn output_expressions(graph: &Graph, node_id: NodeId) -> Vec<String> {
    let mut expressions = Vec::new();
    for edge in &graph.edges {
        if edge.source_id != node_id {
            continue;
        }
        let Some(target) = graph.node(edge.target_id) else {
            continue;
        };
        if target.kind() != NodeKind::Function {
            continue;
        }
        if let Some(output) = chain_output(graph, target) {
            expressions.push(output.data.name().to_string());
        }
    }
    expressions
}

/// Full rendering of the chain containing `function_id`, e.g. `"A = B + C"`.
pub fn chain_expression(graph: &Graph, function_id: NodeId) -> Option<String> {
    let function = graph.node(function_id)?;
    if function.kind() != NodeKind::Function {
        return None;
    }
    let output = chain_output(graph, function)?;
    let identity = graph.edges.iter().find_map(|edge| {
        if edge.target_id != output.id {
            return None;
        }
        graph
            .node(edge.source_id)
            .filter(|node| node.kind() == NodeKind::Function)
    })?;
    let symbol = match &identity.data {
        crate::models::NodeData::Function { symbol } => symbol.as_str(),
        _ => return None,
    };
    let mut visited = HashSet::new();
    let inputs = render_input_tokens(graph, identity, &mut visited);
    Some(format!(
        "{} {} {}",
        output.data.name(),
        symbol,
        inputs.join(" ")
    ))
}

/// Walk forward through function nodes to the variable the chain feeds.
fn chain_output<'a>(graph: &'a Graph, function: &'a Node) -> Option<&'a Node> {
    let mut visited: HashSet<NodeId> = HashSet::new();
    let mut current = function;
    loop {
        if !visited.insert(current.id) {
            return None;
        }
        let next = graph.edges.iter().find_map(|edge| {
            if edge.source_id != current.id {
                return None;
            }
            graph.node(edge.target_id)
        })?;
        if next.kind() != NodeKind::Function {
            return Some(next);
        }
        current = next;
    }
}

/// Read a function node's input side back into token order. Incoming edges
/// are visited in graph order, which matches compilation order: left operand
/// first, right operand second.
fn render_input_tokens(graph: &Graph, function: &Node, visited: &mut HashSet<NodeId>) -> Vec<String> {
    if !visited.insert(function.id) {
        return Vec::new();
    }
    let incoming: Vec<&Node> = graph
        .edges
        .iter()
        .filter(|edge| edge.target_id == function.id)
        .filter_map(|edge| graph.node(edge.source_id))
        .collect();

    let symbol = match &function.data {
        crate::models::NodeData::Function { symbol } => symbol.as_str(),
        _ => return Vec::new(),
    };

    match incoming.as_slice() {
        // Identity position: pass the chain through unchanged.
        [only] => operand_tokens(graph, only, visited),
        [left, right] => {
            let mut tokens = operand_tokens(graph, left, visited);
            tokens.push(symbol.to_string());
            tokens.extend(operand_tokens(graph, right, visited));
            tokens
        }
        _ => Vec::new(),
    }
}

fn operand_tokens(graph: &Graph, node: &Node, visited: &mut HashSet<NodeId>) -> Vec<String> {
    if node.kind() == NodeKind::Function {
        render_input_tokens(graph, node, visited)
    } else {
        vec![node.data.name().to_string()]
    }
}

fn resolve_variable(graph: &Graph, token: FormulaToken) -> Result<&Node> {
    let FormulaToken::Variable { id } = token else {
        return Err(LibError::validation_with_code(
            "formula_malformed",
            "Formula must alternate variables and function symbols",
            anyhow!("expected a variable token"),
        ));
    };
    graph.node(id).ok_or_else(|| {
        LibError::validation_with_code(
            "formula_unknown_variable",
            "Formula references a node that does not exist",
            anyhow!("unknown variable node {id}"),
        )
    })
}

fn expect_function(token: FormulaToken) -> Result<FunctionSymbol> {
    match token {
        FormulaToken::Function { symbol } => Ok(symbol),
        FormulaToken::Variable { id } => Err(LibError::validation_with_code(
            "formula_malformed",
            "Formula must alternate variables and function symbols",
            anyhow!("expected a function token, found variable {id}"),
        )),
    }
}
