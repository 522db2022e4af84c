//! Wave-synchronous parallel execution of a validated graph.
//!
//! Each iteration computes the full ready set, dispatches it as one
//! batch of concurrent tasks bounded by a semaphore, awaits the whole
//! batch, then folds results back. Ordering is a partial order: a node
//! starts only after an edge-qualifying predecessor has completed;
//! siblings within a wave are unordered.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use ahash::AHashSet;
use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use gantry_core::{
    EdgeCondition, EdgeSpec, ExecutionResult, GraphSpec, NodeResult, NodeSpec, Value,
};
use gantry_memory::{ScopedMemory, SharedMemory};

use crate::validator::allowed_symbols;
use crate::{expr, ExecutorRegistry, GraphError, NodeContext, SchedulerConfig};

/// Synthetic marker completed before the first wave.
pub const START: &str = "__start__";
/// Synthetic terminal; edges may target it to end the graph.
pub const END: &str = "__end__";

/// Cooperative stop signal for a running graph. Firing it stops the
/// scheduler from launching further waves; in-flight nodes finish.
#[derive(Clone, Debug, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct GraphScheduler {
    registry: Arc<ExecutorRegistry>,
    config: SchedulerConfig,
    cancel: CancelHandle,
}

impl GraphScheduler {
    pub fn new(registry: ExecutorRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            config: SchedulerConfig::default(),
            cancel: CancelHandle::default(),
        }
    }

    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn cancellation_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Runs the graph from its declared entry node.
    pub async fn execute(
        &self,
        graph: &GraphSpec,
        initial_input: HashMap<String, Value>,
        session_state: Option<HashMap<String, Value>>,
    ) -> ExecutionResult {
        self.run(graph, graph.entry_node.as_str(), initial_input, session_state)
            .await
    }

    /// Runs the graph from a named alternate entry point, e.g. to
    /// resume after a pause.
    pub async fn execute_from(
        &self,
        graph: &GraphSpec,
        entry_point: &str,
        initial_input: HashMap<String, Value>,
        session_state: Option<HashMap<String, Value>>,
    ) -> Result<ExecutionResult, GraphError> {
        let start = graph
            .entry_points
            .get(entry_point)
            .cloned()
            .ok_or_else(|| GraphError::UnknownEntryPoint(entry_point.to_string()))?;
        Ok(self.run(graph, &start, initial_input, session_state).await)
    }

    async fn run(
        &self,
        graph: &GraphSpec,
        start_node: &str,
        initial_input: HashMap<String, Value>,
        session_state: Option<HashMap<String, Value>>,
    ) -> ExecutionResult {
        let started_at = Utc::now();
        let deadline = self.config.run_timeout.map(|t| Instant::now() + t);

        // Session state first, then initial input: input wins on collision.
        let memory = SharedMemory::new();
        if let Some(state) = session_state {
            for (key, value) in state {
                memory.write(key, value);
            }
        }
        for (key, value) in initial_input {
            memory.write(key, value);
        }

        let mut completed: AHashSet<String> = AHashSet::new();
        completed.insert(START.to_string());
        let mut node_results: HashMap<String, NodeResult> = HashMap::new();
        let mut path: Vec<String> = Vec::new();
        let mut max_parallelism = 0usize;
        let mut parallel_batches = 0usize;
        let mut paused_at: Option<String> = None;
        let mut error: Option<String> = None;

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));

        loop {
            if self.cancel.is_cancelled() {
                warn!("run cancelled; returning partial results");
                error = Some("cancelled".to_string());
                break;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                warn!("run timed out; returning partial results");
                error = Some("timed out".to_string());
                break;
            }
            if parallel_batches >= self.config.max_waves {
                warn!(max_waves = self.config.max_waves, "wave limit reached");
                error = Some(format!("wave limit of {} reached", self.config.max_waves));
                break;
            }

            let ready = ready_set(graph, start_node, &completed, &node_results, &memory);
            if ready.is_empty() {
                if terminal_reached(graph, &completed, &node_results, &memory) {
                    break;
                }
                // Soft stop, not a crash: partial results are returned.
                warn!("no executable nodes and no terminal node completed; stopping");
                error = Some("no progress: no ready nodes and no terminal completed".to_string());
                break;
            }

            parallel_batches += 1;
            max_parallelism = max_parallelism.max(ready.len());
            debug!(wave = parallel_batches, width = ready.len(), nodes = ?ready, "dispatching wave");

            let mut join_set = JoinSet::new();
            for (index, node_id) in ready.iter().enumerate() {
                // Ready nodes exist; the validator proved edge integrity.
                let Some(node) = graph.node(node_id).cloned() else {
                    warn!(node = %node_id, "ready node missing from node set; skipping");
                    continue;
                };
                let executor = self.registry.lookup(&node.node_type);
                let memory = memory.clone();
                let semaphore = semaphore.clone();
                join_set.spawn(async move {
                    let _permit = match semaphore.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => {
                            return (index, node.id.clone(), NodeResult::failed("semaphore closed"))
                        }
                    };
                    let result = run_node(executor, &node, memory).await;
                    (index, node.id, result)
                });
            }

            let mut wave: Vec<(usize, String, NodeResult)> = Vec::new();
            let mut join_failure: Option<String> = None;
            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok(entry) => wave.push(entry),
                    Err(err) => {
                        warn!(error = %err, "node task panicked or was aborted");
                        join_failure = Some(format!("node task failed: {err}"));
                    }
                }
            }
            wave.sort_by_key(|(index, _, _)| *index);

            let mut critical_failure: Option<String> = None;
            for (_, node_id, result) in wave {
                completed.insert(node_id.clone());
                path.push(node_id.clone());
                if !result.success && graph.has_outgoing(&node_id) {
                    let reason = result.error.clone().unwrap_or_else(|| "unknown".to_string());
                    critical_failure = Some(format!("node '{node_id}' failed: {reason}"));
                }
                if result.success && graph.pause_nodes.contains(&node_id) {
                    paused_at = Some(node_id.clone());
                }
                if result.success {
                    apply_input_mappings(graph, &node_id, &result, &memory);
                }
                node_results.insert(node_id, result);
            }

            if let Some(reason) = critical_failure {
                warn!(reason = %reason, "critical node failure; aborting run");
                error = Some(reason);
                break;
            }
            if let Some(reason) = join_failure {
                error = Some(reason);
                break;
            }
            if let Some(node) = &paused_at {
                debug!(node = %node, "pause node completed; stopping after wave");
                break;
            }
        }

        let orphaned = memory.cleanup_orphaned_transactions();
        if orphaned > 0 {
            warn!(count = orphaned, "discarded orphaned transactions after run");
        }

        let success = error.is_none();
        let mut output: HashMap<String, Value> = HashMap::new();
        if success {
            // Terminal outputs first, then the memory snapshot: memory
            // wins, it reflects the most current state.
            for node_id in &path {
                if graph.is_terminal(node_id) {
                    if let Some(result) = node_results.get(node_id) {
                        output.extend(result.output.clone());
                    }
                }
            }
            output.extend(memory.read_all());
        }

        let total_tokens = node_results.values().map(|r| r.tokens_used).sum();
        let total_latency_ms = node_results.values().map(|r| r.latency_ms).sum();

        ExecutionResult {
            success,
            output,
            path,
            node_results,
            total_tokens,
            total_latency_ms,
            max_parallelism,
            parallel_batches,
            paused_at,
            error,
            started_at,
            finished_at: Utc::now(),
        }
    }
}

async fn run_node(
    executor: Arc<dyn crate::NodeExecutor>,
    node: &NodeSpec,
    memory: SharedMemory,
) -> NodeResult {
    let scoped = memory.with_permissions(node.input_keys.clone(), node.output_keys.clone());
    let ctx = NodeContext {
        node_id: node.id.clone(),
        tools: node.tools.clone(),
        memory: scoped.clone(),
    };
    let started = Instant::now();
    let mut result = match executor.execute(node, &ctx).await {
        Ok(result) => result,
        Err(err) => {
            // The executor contract is to return failed results, not Err.
            warn!(node = %node.id, error = %err, "executor raised instead of returning a failed result");
            NodeResult::failed(err.to_string())
        }
    };
    if result.latency_ms == 0 {
        result.latency_ms = started.elapsed().as_millis() as u64;
    }
    if result.success {
        if let Err(err) = commit_outputs(&scoped, node, &result).await {
            warn!(node = %node.id, error = %err, "failed to commit node outputs");
            let mut failed = NodeResult::failed(format!("failed to commit outputs: {err}"));
            failed.tokens_used = result.tokens_used;
            failed.latency_ms = result.latency_ms;
            return failed;
        }
    }
    result
}

/// Writes every declared output key the node produced, staged and
/// committed in one transaction under the cross-task lock.
async fn commit_outputs(
    scoped: &ScopedMemory,
    node: &NodeSpec,
    result: &NodeResult,
) -> Result<(), gantry_memory::MemoryError> {
    scoped
        .transaction_async(|txn| {
            for key in &node.output_keys {
                if let Some(value) = result.output.get(key) {
                    txn.write(key, value.clone())?;
                }
            }
            Ok(())
        })
        .await
}

/// Materializes edge `input_mapping` renames: a completed source's
/// output keys become available to the target under the target's
/// names. Pass-through keys are already in memory under their own
/// names.
fn apply_input_mappings(
    graph: &GraphSpec,
    node_id: &str,
    result: &NodeResult,
    memory: &SharedMemory,
) {
    for edge in graph.outgoing(node_id) {
        for (from, to) in &edge.input_mapping {
            if let Some(value) = result.output.get(from) {
                memory.write(to.clone(), value.clone());
            }
        }
    }
}

/// One incoming dependency of a node: an explicit edge or an implicit
/// router route.
enum Incoming<'a> {
    Edge(&'a EdgeSpec),
    Route {
        source: &'a str,
        label: &'a str,
        target: &'a str,
    },
}

impl Incoming<'_> {
    fn source(&self) -> &str {
        match self {
            Incoming::Edge(edge) => &edge.source,
            Incoming::Route { source, .. } => source,
        }
    }

    fn priority(&self) -> i32 {
        match self {
            Incoming::Edge(edge) => edge.priority,
            Incoming::Route { .. } => 0,
        }
    }
}

/// Full ready set: every non-completed node with at least one
/// satisfiable dependency from a completed source. Nodes with no
/// incoming dependencies are roots: they start on a full run from the
/// graph entry, while a resumed run begins solely at its named entry.
fn ready_set(
    graph: &GraphSpec,
    start_node: &str,
    completed: &AHashSet<String>,
    node_results: &HashMap<String, NodeResult>,
    memory: &SharedMemory,
) -> Vec<String> {
    let mut incoming: HashMap<&str, Vec<Incoming<'_>>> = HashMap::new();
    for edge in &graph.edges {
        incoming.entry(edge.target.as_str()).or_default().push(Incoming::Edge(edge));
    }
    for node in &graph.nodes {
        let mut routes: Vec<_> = node.routes.iter().collect();
        routes.sort();
        for (label, target) in routes {
            incoming.entry(target.as_str()).or_default().push(Incoming::Route {
                source: &node.id,
                label,
                target,
            });
        }
    }
    for deps in incoming.values_mut() {
        deps.sort_by_key(|dep| std::cmp::Reverse(dep.priority()));
    }

    let mut ready = Vec::new();
    let entry_run = start_node == graph.entry_node;
    for node in &graph.nodes {
        if completed.contains(&node.id) {
            continue;
        }
        let deps = incoming.get(node.id.as_str());
        let is_ready = match deps {
            Some(deps) if !deps.is_empty() => {
                // The synthetic START edge admits the run's start node once.
                let from_start = node.id == start_node && completed.contains(START);
                from_start
                    || deps.iter().any(|dep| {
                        dep_satisfied(graph, dep, completed, node_results, memory)
                    })
            }
            // No incoming edges: a root. Roots re-executing on a
            // resumed run would re-reach the pause node, so a resume
            // admits only its named entry here.
            _ => entry_run || node.id == start_node,
        };
        if is_ready {
            ready.push(node.id.clone());
        }
    }
    ready
}

fn dep_satisfied(
    graph: &GraphSpec,
    dep: &Incoming<'_>,
    completed: &AHashSet<String>,
    node_results: &HashMap<String, NodeResult>,
    memory: &SharedMemory,
) -> bool {
    let source = dep.source();
    if !completed.contains(source) {
        return false;
    }
    if source == START {
        return true;
    }
    let Some(result) = node_results.get(source) else {
        return false;
    };
    match dep {
        Incoming::Edge(edge) => match edge.condition {
            EdgeCondition::Always => true,
            EdgeCondition::OnSuccess => result.success,
            EdgeCondition::OnFailure => !result.success,
            EdgeCondition::LlmDecide => result.next_node.as_deref() == Some(edge.target.as_str()),
            EdgeCondition::Conditional => conditional_satisfied(graph, edge, result, memory),
        },
        Incoming::Route { label, target, .. } => {
            if !result.success {
                return false;
            }
            // A router records either the route label or the target id.
            matches!(result.next_node.as_deref(), Some(next) if next == *label || next == *target)
        }
    }
}

/// Evaluates a conditional edge through the safety checker's parse,
/// never raw evaluation.
fn conditional_satisfied(
    graph: &GraphSpec,
    edge: &EdgeSpec,
    result: &NodeResult,
    memory: &SharedMemory,
) -> bool {
    let Some(source) = graph.node(&edge.source) else {
        return false;
    };
    let Some(text) = edge.condition_expr.as_deref() else {
        return false;
    };
    let allowed = allowed_symbols(graph, source);
    let parsed = match expr::parse_expression(text, &allowed) {
        Ok(parsed) => parsed,
        Err(err) => {
            // The validator rejects these before a run; an unsafe
            // expression at runtime never fires.
            warn!(edge = %edge.id, error = %err, "conditional expression rejected at runtime");
            return false;
        }
    };

    let snapshot = memory.read_all();
    let mut scope: HashMap<String, Value> = HashMap::new();
    for key in graph
        .memory_keys
        .iter()
        .chain(source.input_keys.iter())
        .chain(source.output_keys.iter())
    {
        if let Some(value) = snapshot.get(key) {
            scope.insert(key.clone(), value.clone());
        }
    }
    scope.insert(
        "output".to_string(),
        Value::Object(result.output.clone().into_iter().collect()),
    );
    scope.insert("memory".to_string(), Value::Object(snapshot.into_iter().collect()));
    scope.insert(
        "result".to_string(),
        serde_json::json!({
            "success": result.success,
            "error": result.error,
            "next_node": result.next_node,
            "tokens_used": result.tokens_used,
            "latency_ms": result.latency_ms,
        }),
    );
    expr::truthy(&expr::evaluate(&parsed, &scope))
}

/// Whether the run may stop successfully: the synthetic END was
/// reached or any terminal node has completed.
fn terminal_reached(
    graph: &GraphSpec,
    completed: &AHashSet<String>,
    node_results: &HashMap<String, NodeResult>,
    memory: &SharedMemory,
) -> bool {
    if graph.nodes.iter().any(|node| completed.contains(&node.id) && graph.is_terminal(&node.id)) {
        return true;
    }
    graph.edges.iter().any(|edge| {
        edge.target == END
            && completed.contains(&edge.source)
            && dep_satisfied(graph, &Incoming::Edge(edge), completed, node_results, memory)
    })
}
