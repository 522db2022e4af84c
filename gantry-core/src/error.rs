use thiserror::Error;

#[derive(Debug, Error)]
pub enum GantryError {
    #[error("Executor failed for node '{node}': {reason}")]
    ExecutorFailed { node: String, reason: String },
    #[error("Unknown tool '{tool}' requested by node '{node}'")]
    UnknownTool { node: String, tool: String },
    #[error("Operation was cancelled")]
    Cancelled,
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Serialization/deserialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("{0}")]
    Custom(String),
}
