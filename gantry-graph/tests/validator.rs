use gantry_core::{EdgeCondition, EdgeSpec, GraphSpec, NodeSpec, NodeType};
use gantry_graph::{validate, validate_or_raise, GraphError, ValidationErrorKind};

fn node(id: &str) -> NodeSpec {
    NodeSpec::new(id, NodeType::LlmGenerate)
}

fn edge(id: &str, source: &str, target: &str) -> EdgeSpec {
    EdgeSpec::new(id, source, target, EdgeCondition::OnSuccess)
}

fn diamond() -> GraphSpec {
    GraphSpec::new("A")
        .add_node(node("A").with_outputs(["a"]))
        .add_node(node("B").with_inputs(["a"]).with_outputs(["b"]))
        .add_node(node("C").with_inputs(["a"]).with_outputs(["c"]))
        .add_node(node("D").with_inputs(["b", "c"]))
        .add_edge(edge("e1", "A", "B"))
        .add_edge(edge("e2", "A", "C"))
        .add_edge(edge("e3", "B", "D"))
        .add_edge(edge("e4", "C", "D"))
        .add_terminal("D")
}

#[test]
fn valid_diamond_passes() {
    validate_or_raise(&diamond()).unwrap();
}

#[test]
fn missing_entry_short_circuits_everything_else() {
    let graph = GraphSpec::new("ghost")
        .add_node(node("A"))
        .add_edge(edge("e1", "A", "nowhere"));
    let errors = validate(&graph);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].kind, ValidationErrorKind::InvalidEdge);
    assert_eq!(errors[0].nodes, vec!["ghost".to_string()]);
}

#[test]
fn missing_edge_target_names_source_and_target() {
    let graph = GraphSpec::new("A")
        .add_node(node("A"))
        .add_edge(edge("e1", "A", "missing"));
    let errors = validate(&graph);
    let invalid: Vec<_> = errors
        .iter()
        .filter(|e| e.kind == ValidationErrorKind::InvalidEdge)
        .collect();
    assert_eq!(invalid.len(), 1);
    assert_eq!(invalid[0].nodes, vec!["A".to_string(), "missing".to_string()]);
}

#[test]
fn missing_route_target_is_invalid() {
    let graph = GraphSpec::new("R")
        .add_node(NodeSpec::new("R", NodeType::Router).with_route("go", "missing"));
    let errors = validate(&graph);
    assert!(errors
        .iter()
        .any(|e| e.kind == ValidationErrorKind::InvalidEdge
            && e.nodes == vec!["R".to_string(), "missing".to_string()]));
}

#[test]
fn unreachable_node_is_reported() {
    let graph = GraphSpec::new("A")
        .add_node(node("A"))
        .add_node(node("island"));
    let errors = validate(&graph);
    assert!(errors
        .iter()
        .any(|e| e.kind == ValidationErrorKind::UnreachableNode
            && e.nodes == vec!["island".to_string()]));
}

#[test]
fn router_routes_extend_reachability() {
    let graph = GraphSpec::new("R")
        .add_node(NodeSpec::new("R", NodeType::Router).with_route("go", "B"))
        .add_node(node("B"));
    validate_or_raise(&graph).unwrap();
}

#[test]
fn conditional_edge_without_expression_is_broken() {
    let graph = GraphSpec::new("A")
        .add_node(node("A"))
        .add_node(node("B"))
        .add_edge(EdgeSpec::new("e1", "A", "B", EdgeCondition::Conditional));
    let errors = validate(&graph);
    assert!(errors
        .iter()
        .any(|e| e.kind == ValidationErrorKind::BrokenConditional));
}

#[test]
fn unsafe_conditional_expression_is_broken() {
    let graph = GraphSpec::new("A")
        .add_node(node("A").with_outputs(["score"]))
        .add_node(node("B"))
        .add_edge(
            EdgeSpec::new("e1", "A", "B", EdgeCondition::Conditional)
                .with_expr("__import__('os').getcwd()"),
        );
    let errors = validate(&graph);
    assert!(errors
        .iter()
        .any(|e| e.kind == ValidationErrorKind::BrokenConditional));
}

#[test]
fn pure_conditional_dead_end_is_unresolvable() {
    // Both outgoing edges are conditional and neither condition parses.
    let graph = GraphSpec::new("A")
        .add_node(node("A"))
        .add_node(node("B"))
        .add_node(node("C"))
        .add_edge(EdgeSpec::new("e1", "A", "B", EdgeCondition::Conditional))
        .add_edge(EdgeSpec::new("e2", "A", "C", EdgeCondition::Conditional).with_expr("x("));
    let errors = validate(&graph);
    assert!(errors
        .iter()
        .any(|e| e.kind == ValidationErrorKind::NoResolvablePath
            && e.nodes == vec!["A".to_string()]));
}

#[test]
fn one_resolvable_condition_is_enough() {
    let graph = GraphSpec::new("A")
        .add_node(node("A").with_outputs(["score"]))
        .add_node(node("B"))
        .add_node(node("C"))
        .add_edge(
            EdgeSpec::new("e1", "A", "B", EdgeCondition::Conditional).with_expr("score > 5"),
        )
        .add_edge(EdgeSpec::new("e2", "A", "C", EdgeCondition::Conditional))
        .add_terminal("B")
        .add_terminal("C");
    let errors = validate(&graph);
    // The empty condition is still broken, but A is not a dead end.
    assert!(errors
        .iter()
        .any(|e| e.kind == ValidationErrorKind::BrokenConditional));
    assert!(!errors
        .iter()
        .any(|e| e.kind == ValidationErrorKind::NoResolvablePath));
}

fn three_cycle() -> GraphSpec {
    GraphSpec::new("A")
        .add_node(node("A"))
        .add_node(node("B"))
        .add_node(node("C"))
        .add_edge(edge("e1", "A", "B"))
        .add_edge(edge("e2", "B", "C"))
        .add_edge(edge("e3", "C", "A"))
}

#[test]
fn unintended_cycle_names_every_node() {
    let errors = validate(&three_cycle());
    let cycle: Vec<_> = errors
        .iter()
        .filter(|e| e.kind == ValidationErrorKind::InfiniteCycle)
        .collect();
    assert_eq!(cycle.len(), 1);
    let mut named = cycle[0].nodes.clone();
    named.sort();
    assert_eq!(named, vec!["A".to_string(), "B".to_string(), "C".to_string()]);
}

#[test]
fn global_flag_permits_the_cycle() {
    let graph = three_cycle().allow_cycles();
    assert!(!validate(&graph)
        .iter()
        .any(|e| e.kind == ValidationErrorKind::InfiniteCycle));
}

#[test]
fn all_nodes_marked_allow_loop_permit_the_cycle() {
    let graph = GraphSpec::new("A")
        .add_node(node("A").allow_loop())
        .add_node(node("B").allow_loop())
        .add_node(node("C").allow_loop())
        .add_edge(edge("e1", "A", "B"))
        .add_edge(edge("e2", "B", "C"))
        .add_edge(edge("e3", "C", "A"));
    assert!(!validate(&graph)
        .iter()
        .any(|e| e.kind == ValidationErrorKind::InfiniteCycle));
}

#[test]
fn one_edge_marked_allow_cycle_permits_the_cycle() {
    let graph = GraphSpec::new("A")
        .add_node(node("A"))
        .add_node(node("B"))
        .add_node(node("C"))
        .add_edge(edge("e1", "A", "B"))
        .add_edge(edge("e2", "B", "C"))
        .add_edge(edge("e3", "C", "A").allow_cycle());
    assert!(!validate(&graph)
        .iter()
        .any(|e| e.kind == ValidationErrorKind::InfiniteCycle));
}

#[test]
fn unsatisfied_input_names_the_missing_keys() {
    let graph = GraphSpec::new("A")
        .add_node(node("A").with_outputs(["a"]))
        .add_node(node("B").with_inputs(["a", "data", "extra"]))
        .add_edge(edge("e1", "A", "B"));
    let errors = validate(&graph);
    let unsatisfied: Vec<_> = errors
        .iter()
        .filter(|e| e.kind == ValidationErrorKind::UnsatisfiedInput)
        .collect();
    assert_eq!(unsatisfied.len(), 1);
    assert_eq!(unsatisfied[0].nodes, vec!["B".to_string()]);
    // Exactly the missing keys, sorted; the satisfied 'a' is not named.
    assert!(unsatisfied[0].message.ends_with("data, extra"));
}

#[test]
fn input_mapping_satisfies_renamed_inputs() {
    let graph = GraphSpec::new("A")
        .add_node(node("A").with_outputs(["raw"]))
        .add_node(node("B").with_inputs(["clean"]))
        .add_edge(edge("e1", "A", "B").with_mapping("raw", "clean"));
    assert!(!validate(&graph)
        .iter()
        .any(|e| e.kind == ValidationErrorKind::UnsatisfiedInput));
}

#[test]
fn memory_keys_satisfy_inputs() {
    let graph = GraphSpec::new("A")
        .add_node(node("A"))
        .add_node(node("B").with_inputs(["ctx"]))
        .add_edge(edge("e1", "A", "B"))
        .add_memory_key("ctx");
    assert!(!validate(&graph)
        .iter()
        .any(|e| e.kind == ValidationErrorKind::UnsatisfiedInput));
}

#[test]
fn multi_hop_propagation_reaches_the_fixed_point() {
    let graph = GraphSpec::new("A")
        .add_node(node("A").with_outputs(["a"]))
        .add_node(node("B").with_inputs(["a"]).with_outputs(["b"]))
        .add_node(node("C").with_inputs(["a", "b"]))
        .add_edge(edge("e1", "A", "B"))
        .add_edge(edge("e2", "A", "C"))
        .add_edge(edge("e3", "B", "C"));
    assert!(validate(&graph).is_empty());
}

#[test]
fn all_violations_are_reported_together() {
    let graph = GraphSpec::new("A")
        .add_node(node("A"))
        .add_node(node("island").with_inputs(["never"]))
        .add_edge(edge("e1", "A", "missing"));
    match validate_or_raise(&graph) {
        Err(GraphError::Validation(errors)) => {
            assert!(errors.iter().any(|e| e.kind == ValidationErrorKind::InvalidEdge));
            assert!(errors.iter().any(|e| e.kind == ValidationErrorKind::UnreachableNode));
            assert!(errors.iter().any(|e| e.kind == ValidationErrorKind::UnsatisfiedInput));
        }
        other => panic!("expected validation failure, got {other:?}"),
    }
}
