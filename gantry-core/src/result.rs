use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Value;

/// Outcome of one node execution. Consumed immediately by the
/// scheduler, not persisted beyond the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeResult {
    pub success: bool,
    #[serde(default)]
    pub output: HashMap<String, Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub latency_ms: u64,
    /// Router decision: the chosen route label or target node id.
    #[serde(default)]
    pub next_node: Option<String>,
}

impl NodeResult {
    pub fn ok(output: HashMap<String, Value>) -> Self {
        Self {
            success: true,
            output,
            error: None,
            tokens_used: 0,
            latency_ms: 0,
            next_node: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: HashMap::new(),
            error: Some(error.into()),
            tokens_used: 0,
            latency_ms: 0,
            next_node: None,
        }
    }

    pub fn routed(next_node: impl Into<String>) -> Self {
        Self {
            success: true,
            output: HashMap::new(),
            error: None,
            tokens_used: 0,
            latency_ms: 0,
            next_node: Some(next_node.into()),
        }
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens_used = tokens;
        self
    }

    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }
}

/// Outcome of one graph run. An aborted run still carries every
/// result gathered up to the abort point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: HashMap<String, Value>,
    /// Node ids in completion order.
    pub path: Vec<String>,
    pub node_results: HashMap<String, NodeResult>,
    pub total_tokens: u64,
    pub total_latency_ms: u64,
    /// Widest wave dispatched during the run.
    pub max_parallelism: usize,
    pub parallel_batches: usize,
    pub paused_at: Option<String>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}
