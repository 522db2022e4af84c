use std::collections::HashMap;
use std::sync::Arc;

use gantry_core::NodeType;

use crate::NodeExecutor;

/// Maps node types to their executors.
///
/// The generate executor is mandatory: it serves `llm_generate` and is
/// the documented fallback for any type without a registration,
/// including unknown (`Other`) types.
pub struct ExecutorRegistry {
    executors: HashMap<NodeType, Arc<dyn NodeExecutor>>,
    generate: Arc<dyn NodeExecutor>,
}

impl ExecutorRegistry {
    pub fn new(generate: Arc<dyn NodeExecutor>) -> Self {
        Self {
            executors: HashMap::new(),
            generate,
        }
    }

    pub fn register(&mut self, node_type: NodeType, executor: Arc<dyn NodeExecutor>) -> &mut Self {
        self.executors.insert(node_type, executor);
        self
    }

    pub fn lookup(&self, node_type: &NodeType) -> Arc<dyn NodeExecutor> {
        if node_type == &NodeType::LlmGenerate {
            return self.generate.clone();
        }
        self.executors
            .get(node_type)
            .cloned()
            .unwrap_or_else(|| self.generate.clone())
    }
}
