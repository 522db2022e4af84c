use async_trait::async_trait;

use gantry_core::{GantryError, NodeResult, NodeSpec};
use gantry_memory::ScopedMemory;

/// Execution context handed to a node: the node's identity, the tools
/// it may see, and a memory view limited to its declared keys.
pub struct NodeContext {
    pub node_id: String,
    pub tools: Vec<String>,
    pub memory: ScopedMemory,
}

/// The boundary to the LLM/tool execution layer.
///
/// Ordinary failures (network error, bad model output, tool fault)
/// must come back as `Ok(NodeResult { success: false, .. })`. An `Err`
/// reaching the scheduler is a contract violation; it is downgraded to
/// a failed result and logged as an implementation defect.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    async fn execute(&self, node: &NodeSpec, ctx: &NodeContext) -> Result<NodeResult, GantryError>;
}
