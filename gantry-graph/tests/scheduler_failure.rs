use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use gantry_core::{
    EdgeCondition, EdgeSpec, GantryError, GraphSpec, NodeResult, NodeSpec, NodeType,
};
use gantry_graph::{ExecutorRegistry, GraphScheduler, NodeContext, NodeExecutor};

/// Fails the named node; echoes outputs everywhere else.
struct FailAt {
    target: String,
}

#[async_trait]
impl NodeExecutor for FailAt {
    async fn execute(
        &self,
        node: &NodeSpec,
        _ctx: &NodeContext,
    ) -> Result<NodeResult, GantryError> {
        if node.id == self.target {
            return Ok(NodeResult::failed("simulated provider outage"));
        }
        let mut output = HashMap::new();
        for key in &node.output_keys {
            output.insert(key.clone(), json!(node.id.clone()));
        }
        Ok(NodeResult::ok(output))
    }
}

/// Violates the executor contract by returning Err.
struct Raising;

#[async_trait]
impl NodeExecutor for Raising {
    async fn execute(
        &self,
        node: &NodeSpec,
        _ctx: &NodeContext,
    ) -> Result<NodeResult, GantryError> {
        Err(GantryError::ExecutorFailed {
            node: node.id.clone(),
            reason: "backend blew up".to_string(),
        })
    }
}

fn node(id: &str) -> NodeSpec {
    NodeSpec::new(id, NodeType::LlmGenerate)
}

fn edge(id: &str, source: &str, target: &str) -> EdgeSpec {
    EdgeSpec::new(id, source, target, EdgeCondition::OnSuccess)
}

fn chain() -> GraphSpec {
    GraphSpec::new("A")
        .add_node(node("A").with_outputs(["a"]))
        .add_node(node("B").with_inputs(["a"]).with_outputs(["b"]))
        .add_node(node("D").with_inputs(["b"]))
        .add_edge(edge("e1", "A", "B"))
        .add_edge(edge("e2", "B", "D"))
        .add_terminal("D")
}

#[tokio::test]
async fn critical_failure_aborts_before_downstream_runs() {
    let scheduler = GraphScheduler::new(ExecutorRegistry::new(Arc::new(FailAt {
        target: "B".to_string(),
    })));
    let result = scheduler.execute(&chain(), HashMap::new(), None).await;

    assert!(!result.success);
    assert!(result.error.as_deref().unwrap_or("").contains("'B'"));
    // Everything gathered up to the abort is returned.
    assert!(result.node_results.contains_key("A"));
    assert!(result.node_results.contains_key("B"));
    assert!(!result.node_results.contains_key("D"));
    assert_eq!(result.path, vec!["A".to_string(), "B".to_string()]);
}

#[tokio::test]
async fn failed_wave_sibling_results_are_kept() {
    let graph = GraphSpec::new("A")
        .add_node(node("A").with_outputs(["a"]))
        .add_node(node("B").with_inputs(["a"]).with_outputs(["b"]))
        .add_node(node("C").with_inputs(["a"]).with_outputs(["c"]))
        .add_node(node("D").with_inputs(["b", "c"]))
        .add_edge(edge("e1", "A", "B"))
        .add_edge(edge("e2", "A", "C"))
        .add_edge(edge("e3", "B", "D"))
        .add_edge(edge("e4", "C", "D"))
        .add_terminal("D");
    let scheduler = GraphScheduler::new(ExecutorRegistry::new(Arc::new(FailAt {
        target: "B".to_string(),
    })));
    let result = scheduler.execute(&graph, HashMap::new(), None).await;

    assert!(!result.success);
    assert!(!result.node_results.contains_key("D"));
    // B's wave sibling C had already been dispatched; its result stays.
    assert!(result.node_results.contains_key("C"));
}

#[tokio::test]
async fn leaf_failure_does_not_abort_the_run() {
    // B is terminal: its failure is non-critical.
    let graph = GraphSpec::new("A")
        .add_node(node("A").with_outputs(["a"]))
        .add_node(node("B").with_inputs(["a"]))
        .add_edge(edge("e1", "A", "B"))
        .add_terminal("B");
    let scheduler = GraphScheduler::new(ExecutorRegistry::new(Arc::new(FailAt {
        target: "B".to_string(),
    })));
    let result = scheduler.execute(&graph, HashMap::new(), None).await;

    assert!(result.success, "{:?}", result.error);
    assert!(!result.node_results["B"].success);
}

#[tokio::test]
async fn executor_err_is_downgraded_to_a_failed_result() {
    let graph = GraphSpec::new("A")
        .add_node(node("A"))
        .add_terminal("A");
    let scheduler = GraphScheduler::new(ExecutorRegistry::new(Arc::new(Raising)));
    let result = scheduler.execute(&graph, HashMap::new(), None).await;

    // A is a leaf, so the downgraded failure is non-critical.
    assert!(result.success);
    let node_result = &result.node_results["A"];
    assert!(!node_result.success);
    assert!(node_result.error.as_deref().unwrap_or("").contains("backend blew up"));
}

#[tokio::test]
async fn on_failure_edge_does_not_override_critical_abort() {
    // B has an outgoing edge, so its failure is critical even though
    // that edge is an on_failure recovery path.
    let graph = GraphSpec::new("A")
        .add_node(node("A").with_outputs(["a"]))
        .add_node(node("B").with_inputs(["a"]))
        .add_node(node("recover"))
        .add_edge(edge("e1", "A", "B"))
        .add_edge(EdgeSpec::new("e2", "B", "recover", EdgeCondition::OnFailure))
        .add_terminal("recover");
    let scheduler = GraphScheduler::new(ExecutorRegistry::new(Arc::new(FailAt {
        target: "B".to_string(),
    })));
    let result = scheduler.execute(&graph, HashMap::new(), None).await;

    // Critical-failure rule wins: B has an outgoing edge.
    assert!(!result.success);
    assert!(!result.node_results.contains_key("recover"));
}

#[tokio::test]
async fn deadlock_is_a_soft_stop_with_partial_results() {
    // C waits on an on_failure edge that can never fire.
    let graph = GraphSpec::new("A")
        .add_node(node("A").with_outputs(["a"]))
        .add_node(node("C"))
        .add_edge(EdgeSpec::new("e1", "A", "C", EdgeCondition::OnFailure));
    let scheduler = GraphScheduler::new(ExecutorRegistry::new(Arc::new(FailAt {
        target: "none".to_string(),
    })));
    let result = scheduler.execute(&graph, HashMap::new(), None).await;

    assert!(!result.success);
    assert!(result.error.as_deref().unwrap_or("").contains("no progress"));
    assert!(result.node_results.contains_key("A"));
    assert!(!result.node_results.contains_key("C"));
}
