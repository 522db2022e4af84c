//! Static structural and dataflow validation.
//!
//! Validation never executes node code. Every violation found is
//! reported in one batch; a missing entry node is the only failure
//! that short-circuits the remaining checks.

use std::fmt;

use ahash::{AHashMap, AHashSet};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use serde::{Deserialize, Serialize};

use gantry_core::{EdgeCondition, GraphSpec, NodeSpec};

use crate::expr;
use crate::scheduler::{END, START};
use crate::GraphError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationErrorKind {
    InvalidEdge,
    UnreachableNode,
    BrokenConditional,
    NoResolvablePath,
    InfiniteCycle,
    UnsatisfiedInput,
}

impl fmt::Display for ValidationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            ValidationErrorKind::InvalidEdge => "invalid_edge",
            ValidationErrorKind::UnreachableNode => "unreachable_node",
            ValidationErrorKind::BrokenConditional => "broken_conditional",
            ValidationErrorKind::NoResolvablePath => "no_resolvable_path",
            ValidationErrorKind::InfiniteCycle => "infinite_cycle",
            ValidationErrorKind::UnsatisfiedInput => "unsatisfied_input",
        };
        f.write_str(tag)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationError {
    pub kind: ValidationErrorKind,
    /// Implicated node ids, ordered.
    pub nodes: Vec<String>,
    pub message: String,
}

impl ValidationError {
    fn new(kind: ValidationErrorKind, nodes: Vec<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            nodes,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} (nodes: {})", self.kind, self.message, self.nodes.join(", "))
    }
}

/// The allowed-symbol set for a node's conditional expressions: the
/// fixed evaluation bindings, the graph's memory keys, and the node's
/// own input/output keys.
pub(crate) fn allowed_symbols(graph: &GraphSpec, node: &NodeSpec) -> std::collections::HashSet<String> {
    let mut allowed: std::collections::HashSet<String> = ["output", "memory", "result", "true", "false"]
        .into_iter()
        .map(str::to_string)
        .collect();
    allowed.extend(graph.memory_keys.iter().cloned());
    allowed.extend(node.input_keys.iter().cloned());
    allowed.extend(node.output_keys.iter().cloned());
    allowed
}

fn is_pseudo(id: &str) -> bool {
    id == START || id == END
}

/// Adjacency over explicit edges plus implicit router routes,
/// restricted to endpoints that exist.
struct Adjacency {
    graph: DiGraph<String, bool>,
    index: AHashMap<String, NodeIndex>,
}

impl Adjacency {
    fn build(spec: &GraphSpec) -> Self {
        let mut graph = DiGraph::new();
        let mut index = AHashMap::new();
        for node in &spec.nodes {
            let idx = graph.add_node(node.id.clone());
            index.insert(node.id.clone(), idx);
        }
        let mut seen: AHashSet<(NodeIndex, NodeIndex)> = AHashSet::new();
        for edge in &spec.edges {
            if let (Some(&from), Some(&to)) = (index.get(&edge.source), index.get(&edge.target)) {
                if seen.insert((from, to)) {
                    graph.add_edge(from, to, edge.allow_cycle);
                } else if edge.allow_cycle {
                    // Keep the strongest cycle permission on a repeated pair.
                    if let Some(existing) = graph.find_edge(from, to) {
                        graph[existing] = true;
                    }
                }
            }
        }
        for node in &spec.nodes {
            for target in node.routes.values() {
                if let (Some(&from), Some(&to)) = (index.get(&node.id), index.get(target)) {
                    if seen.insert((from, to)) {
                        graph.add_edge(from, to, false);
                    }
                }
            }
        }
        Self { graph, index }
    }
}

/// Runs every check and returns the full batch of violations. Empty
/// means the graph may execute.
pub fn validate(spec: &GraphSpec) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    // 1. Entry existence. Nothing else is meaningful without it.
    if spec.node(&spec.entry_node).is_none() {
        errors.push(ValidationError::new(
            ValidationErrorKind::InvalidEdge,
            vec![spec.entry_node.clone()],
            format!("entry node '{}' does not exist", spec.entry_node),
        ));
        return errors;
    }

    check_edge_integrity(spec, &mut errors);

    let adjacency = Adjacency::build(spec);
    check_reachability(spec, &adjacency, &mut errors);
    check_conditional_soundness(spec, &mut errors);
    check_cycles(spec, &adjacency, &mut errors);
    check_input_satisfiability(spec, &mut errors);

    errors
}

/// Raises an aggregate error carrying every violation found.
pub fn validate_or_raise(spec: &GraphSpec) -> Result<(), GraphError> {
    let errors = validate(spec);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(GraphError::Validation(errors))
    }
}

fn check_edge_integrity(spec: &GraphSpec, errors: &mut Vec<ValidationError>) {
    for edge in &spec.edges {
        if !is_pseudo(&edge.source) && spec.node(&edge.source).is_none() {
            errors.push(ValidationError::new(
                ValidationErrorKind::InvalidEdge,
                vec![edge.source.clone(), edge.target.clone()],
                format!("edge '{}' references missing source '{}'", edge.id, edge.source),
            ));
        }
        if !is_pseudo(&edge.target) && spec.node(&edge.target).is_none() {
            errors.push(ValidationError::new(
                ValidationErrorKind::InvalidEdge,
                vec![edge.source.clone(), edge.target.clone()],
                format!("edge '{}' references missing target '{}'", edge.id, edge.target),
            ));
        }
    }
    for node in &spec.nodes {
        let mut labels: Vec<_> = node.routes.iter().collect();
        labels.sort();
        for (label, target) in labels {
            if !is_pseudo(target) && spec.node(target).is_none() {
                errors.push(ValidationError::new(
                    ValidationErrorKind::InvalidEdge,
                    vec![node.id.clone(), target.clone()],
                    format!("route '{label}' of node '{}' targets missing node '{target}'", node.id),
                ));
            }
        }
    }
    let mut entry_points: Vec<_> = spec.entry_points.iter().collect();
    entry_points.sort();
    for (name, target) in entry_points {
        if spec.node(target).is_none() {
            errors.push(ValidationError::new(
                ValidationErrorKind::InvalidEdge,
                vec![target.clone()],
                format!("entry point '{name}' targets missing node '{target}'"),
            ));
        }
    }
}

fn check_reachability(spec: &GraphSpec, adjacency: &Adjacency, errors: &mut Vec<ValidationError>) {
    let Some(&entry) = adjacency.index.get(&spec.entry_node) else {
        return;
    };
    let mut reachable = AHashSet::new();
    let mut dfs = Dfs::new(&adjacency.graph, entry);
    while let Some(idx) = dfs.next(&adjacency.graph) {
        reachable.insert(idx);
    }
    for node in &spec.nodes {
        let idx = adjacency.index[&node.id];
        if !reachable.contains(&idx) {
            errors.push(ValidationError::new(
                ValidationErrorKind::UnreachableNode,
                vec![node.id.clone()],
                format!("node '{}' is not reachable from entry '{}'", node.id, spec.entry_node),
            ));
        }
    }
}

fn check_conditional_soundness(spec: &GraphSpec, errors: &mut Vec<ValidationError>) {
    // Per-source tallies for the pure-conditional dead-end rule.
    let mut conditional_total: AHashMap<&str, usize> = AHashMap::new();
    let mut conditional_ok: AHashMap<&str, usize> = AHashMap::new();
    let mut outgoing_total: AHashMap<&str, usize> = AHashMap::new();

    for edge in &spec.edges {
        *outgoing_total.entry(edge.source.as_str()).or_default() += 1;
        if edge.condition != EdgeCondition::Conditional {
            continue;
        }
        *conditional_total.entry(edge.source.as_str()).or_default() += 1;
        let Some(source) = spec.node(&edge.source) else {
            continue;
        };
        let allowed = allowed_symbols(spec, source);
        let well_formed = match edge.condition_expr.as_deref() {
            None | Some("") => {
                errors.push(ValidationError::new(
                    ValidationErrorKind::BrokenConditional,
                    vec![edge.source.clone(), edge.target.clone()],
                    format!("conditional edge '{}' has no condition expression", edge.id),
                ));
                false
            }
            Some(text) => {
                let (safe, reason) = expr::check_expression(text, &allowed);
                if !safe {
                    errors.push(ValidationError::new(
                        ValidationErrorKind::BrokenConditional,
                        vec![edge.source.clone(), edge.target.clone()],
                        format!("conditional edge '{}' is unsafe: {reason}", edge.id),
                    ));
                }
                safe
            }
        };
        if well_formed {
            *conditional_ok.entry(edge.source.as_str()).or_default() += 1;
        }
    }

    for node in &spec.nodes {
        let total = outgoing_total.get(node.id.as_str()).copied().unwrap_or(0);
        let conditional = conditional_total.get(node.id.as_str()).copied().unwrap_or(0);
        // Routes are non-conditional continuations.
        if total == 0 || conditional < total || !node.routes.is_empty() {
            continue;
        }
        if conditional_ok.get(node.id.as_str()).copied().unwrap_or(0) == 0 {
            errors.push(ValidationError::new(
                ValidationErrorKind::NoResolvablePath,
                vec![node.id.clone()],
                format!(
                    "node '{}' has only conditional outgoing edges and none of their conditions is resolvable",
                    node.id
                ),
            ));
        }
    }
}

fn check_cycles(spec: &GraphSpec, adjacency: &Adjacency, errors: &mut Vec<ValidationError>) {
    // DFS with an explicit recursion stack; a back edge to a node on
    // the path identifies a cycle.
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Grey,
        Black,
    }

    let graph = &adjacency.graph;
    let mut color = vec![Color::White; graph.node_count()];
    let mut reported: AHashSet<Vec<NodeIndex>> = AHashSet::new();
    let mut cycles: Vec<Vec<NodeIndex>> = Vec::new();

    for start in graph.node_indices() {
        if color[start.index()] != Color::White {
            continue;
        }
        // (node, next neighbor position) frames; `path` mirrors the grey chain.
        let mut stack: Vec<(NodeIndex, Vec<NodeIndex>, usize)> = Vec::new();
        let mut path: Vec<NodeIndex> = Vec::new();
        let neighbors: Vec<NodeIndex> = graph.neighbors(start).collect();
        stack.push((start, neighbors, 0));
        color[start.index()] = Color::Grey;
        path.push(start);

        while let Some((node, neighbors, cursor)) = stack.last_mut() {
            if let Some(&next) = neighbors.get(*cursor) {
                *cursor += 1;
                match color[next.index()] {
                    Color::White => {
                        color[next.index()] = Color::Grey;
                        path.push(next);
                        let nexts: Vec<NodeIndex> = graph.neighbors(next).collect();
                        stack.push((next, nexts, 0));
                    }
                    Color::Grey => {
                        let from = path.iter().position(|&p| p == next).unwrap_or(0);
                        let cycle: Vec<NodeIndex> = path[from..].to_vec();
                        let mut canonical = cycle.clone();
                        canonical.sort();
                        if reported.insert(canonical) {
                            cycles.push(cycle);
                        }
                    }
                    Color::Black => {}
                }
            } else {
                color[node.index()] = Color::Black;
                path.pop();
                stack.pop();
            }
        }
    }

    if spec.allow_cycles {
        return;
    }
    for cycle in cycles {
        let ids: Vec<String> = cycle.iter().map(|&idx| graph[idx].clone()).collect();
        let all_allow_loop = ids
            .iter()
            .all(|id| spec.node(id).map_or(false, |node| node.allow_loop));
        let any_edge_allows = cycle.iter().enumerate().any(|(pos, &from)| {
            let to = cycle[(pos + 1) % cycle.len()];
            graph.find_edge(from, to).map_or(false, |edge| graph[edge])
        });
        if !all_allow_loop && !any_edge_allows {
            errors.push(ValidationError::new(
                ValidationErrorKind::InfiniteCycle,
                ids.clone(),
                format!("unintended cycle: {}", ids.join(" -> ")),
            ));
        }
    }
}

fn check_input_satisfiability(spec: &GraphSpec, errors: &mut Vec<ValidationError>) {
    // Kleene iteration over "keys available before node X". The
    // memory_keys universe exists independent of any node; the entry
    // node's own inputs are assumed bound by the initial input.
    let mut available: AHashMap<&str, AHashSet<String>> = AHashMap::new();
    let mut distinct: AHashSet<&str> = spec.memory_keys.iter().map(String::as_str).collect();
    for node in &spec.nodes {
        let mut seed: AHashSet<String> = spec.memory_keys.iter().cloned().collect();
        if node.id == spec.entry_node {
            seed.extend(node.input_keys.iter().cloned());
        }
        available.insert(node.id.as_str(), seed);
        distinct.extend(node.input_keys.iter().map(String::as_str));
        distinct.extend(node.output_keys.iter().map(String::as_str));
    }

    let cap = spec.nodes.len() * (distinct.len() + 1);
    let mut iterations = 0;
    loop {
        let mut changed = false;
        for edge in &spec.edges {
            let (Some(source), Some(_)) = (spec.node(&edge.source), spec.node(&edge.target)) else {
                continue;
            };
            let satisfied = {
                let src_avail = &available[edge.source.as_str()];
                source.input_keys.iter().all(|key| src_avail.contains(key))
            };
            if !satisfied {
                continue;
            }
            let propagated: Vec<String> = source
                .output_keys
                .iter()
                .map(|key| edge.input_mapping.get(key).unwrap_or(key).clone())
                .collect();
            let target_avail = available.entry(edge.target.as_str()).or_default();
            for key in propagated {
                changed |= target_avail.insert(key);
            }
        }
        for node in &spec.nodes {
            if node.routes.is_empty() {
                continue;
            }
            let satisfied = {
                let src_avail = &available[node.id.as_str()];
                node.input_keys.iter().all(|key| src_avail.contains(key))
            };
            if !satisfied {
                continue;
            }
            let outputs = node.output_keys.clone();
            let mut targets: Vec<&String> = node.routes.values().collect();
            targets.sort();
            targets.dedup();
            for target in targets {
                if spec.node(target).is_none() {
                    continue;
                }
                let target_avail = available.entry(target.as_str()).or_default();
                for key in &outputs {
                    changed |= target_avail.insert(key.clone());
                }
            }
        }
        iterations += 1;
        if !changed || iterations >= cap {
            break;
        }
    }

    for node in &spec.nodes {
        let avail = &available[node.id.as_str()];
        let mut missing: Vec<String> = node
            .input_keys
            .iter()
            .filter(|key| !avail.contains(*key))
            .cloned()
            .collect();
        if missing.is_empty() {
            continue;
        }
        missing.sort();
        errors.push(ValidationError::new(
            ValidationErrorKind::UnsatisfiedInput,
            vec![node.id.clone()],
            format!("node '{}' reads keys never written upstream: {}", node.id, missing.join(", ")),
        ));
    }
}
