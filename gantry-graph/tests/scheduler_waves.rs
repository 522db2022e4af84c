use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;
use tokio::time::sleep;

use gantry_core::{
    EdgeCondition, EdgeSpec, GantryError, GraphSpec, NodeResult, NodeSpec, NodeType,
};
use gantry_graph::{ExecutorRegistry, GraphScheduler, NodeContext, NodeExecutor, SchedulerConfig};

struct EchoExecutor;

#[async_trait]
impl NodeExecutor for EchoExecutor {
    async fn execute(
        &self,
        node: &NodeSpec,
        _ctx: &NodeContext,
    ) -> Result<NodeResult, GantryError> {
        let mut output = HashMap::new();
        for key in &node.output_keys {
            output.insert(key.clone(), json!(format!("{}-value", node.id)));
        }
        Ok(NodeResult::ok(output).with_tokens(3))
    }
}

struct SleepExecutor {
    delay: Duration,
}

#[async_trait]
impl NodeExecutor for SleepExecutor {
    async fn execute(
        &self,
        node: &NodeSpec,
        _ctx: &NodeContext,
    ) -> Result<NodeResult, GantryError> {
        sleep(self.delay).await;
        let mut output = HashMap::new();
        for key in &node.output_keys {
            output.insert(key.clone(), json!(node.id.clone()));
        }
        Ok(NodeResult::ok(output))
    }
}

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
        .add_node(node("D").with_inputs(["b", "c"]).with_outputs(["d"]))
        .add_edge(edge("e1", "A", "B"))
        .add_edge(edge("e2", "A", "C"))
        .add_edge(edge("e3", "B", "D"))
        .add_edge(edge("e4", "C", "D"))
        .add_terminal("D")
}

#[tokio::test]
async fn diamond_runs_in_three_waves_with_width_two() {
    let scheduler = GraphScheduler::new(ExecutorRegistry::new(Arc::new(EchoExecutor)));
    let result = scheduler.execute(&diamond(), HashMap::new(), None).await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.parallel_batches, 3);
    assert_eq!(result.max_parallelism, 2);
    assert_eq!(result.path.len(), 4);
    assert_eq!(result.path[0], "A");
    assert_eq!(result.path[3], "D");
    // B and C form the middle wave in either order.
    let middle: Vec<&str> = vec![result.path[1].as_str(), result.path[2].as_str()];
    assert!(middle.contains(&"B") && middle.contains(&"C"));
    assert_eq!(result.node_results.len(), 4);
    assert_eq!(result.total_tokens, 12);
}

#[tokio::test]
async fn d_starts_only_after_both_predecessors() {
    // D is edge-qualified as soon as B or C completes, but its wave
    // starts only after the whole {B, C} wave is awaited.
    let scheduler = GraphScheduler::new(ExecutorRegistry::new(Arc::new(EchoExecutor)));
    let result = scheduler.execute(&diamond(), HashMap::new(), None).await;
    let pos = |id: &str| result.path.iter().position(|p| p == id).unwrap();
    assert!(pos("D") > pos("B"));
    assert!(pos("D") > pos("C"));
}

#[tokio::test]
async fn final_output_unions_terminals_and_memory() {
    let scheduler = GraphScheduler::new(ExecutorRegistry::new(Arc::new(EchoExecutor)));
    let mut input = HashMap::new();
    input.insert("seed".to_string(), json!("initial"));
    let result = scheduler.execute(&diamond(), input, None).await;

    // Terminal D's own output plus the full memory snapshot.
    assert_eq!(result.output.get("d"), Some(&json!("D-value")));
    assert_eq!(result.output.get("a"), Some(&json!("A-value")));
    assert_eq!(result.output.get("seed"), Some(&json!("initial")));
}

#[tokio::test]
async fn initial_input_wins_over_session_state() {
    let scheduler = GraphScheduler::new(ExecutorRegistry::new(Arc::new(EchoExecutor)));
    let mut input = HashMap::new();
    input.insert("k".to_string(), json!("from-input"));
    let mut session = HashMap::new();
    session.insert("k".to_string(), json!("from-session"));
    session.insert("only_session".to_string(), json!(1));
    let result = scheduler.execute(&diamond(), input, Some(session)).await;

    assert_eq!(result.output.get("k"), Some(&json!("from-input")));
    assert_eq!(result.output.get("only_session"), Some(&json!(1)));
}

#[tokio::test]
async fn siblings_in_a_wave_overlap_in_time() {
    let scheduler = GraphScheduler::new(ExecutorRegistry::new(Arc::new(SleepExecutor {
        delay: Duration::from_millis(150),
    })));
    let started = Instant::now();
    let result = scheduler.execute(&diamond(), HashMap::new(), None).await;
    let elapsed = started.elapsed();

    assert!(result.success);
    // Four nodes at 150ms each: 600ms serial, ~450ms in three waves.
    assert!(
        elapsed < Duration::from_millis(560),
        "waves did not overlap: {elapsed:?}"
    );
}

#[tokio::test]
async fn max_concurrent_one_serializes_the_wave() {
    let config = SchedulerConfig {
        max_concurrent: 1,
        ..Default::default()
    };
    let scheduler = GraphScheduler::new(ExecutorRegistry::new(Arc::new(SleepExecutor {
        delay: Duration::from_millis(50),
    })))
    .with_config(config);
    let started = Instant::now();
    let result = scheduler.execute(&diamond(), HashMap::new(), None).await;

    assert!(result.success);
    // All four executions forced through one slot.
    assert!(started.elapsed() >= Duration::from_millis(200));
    // The wave was still discovered at width 2.
    assert_eq!(result.max_parallelism, 2);
}

#[tokio::test]
async fn two_independent_roots_start_in_the_first_wave() {
    let graph = GraphSpec::new("A")
        .add_node(node("A").with_outputs(["a"]))
        .add_node(node("B").with_outputs(["b"]))
        .add_node(node("join").with_inputs(["a", "b"]))
        .add_edge(edge("e1", "A", "join"))
        .add_edge(edge("e2", "B", "join"))
        .add_terminal("join");
    let scheduler = GraphScheduler::new(ExecutorRegistry::new(Arc::new(EchoExecutor)));
    let result = scheduler.execute(&graph, HashMap::new(), None).await;

    assert!(result.success);
    assert_eq!(result.max_parallelism, 2);
    assert_eq!(result.parallel_batches, 2);
}
