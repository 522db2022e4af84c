mod error;
mod result;
mod spec;
mod value;

pub use error::GantryError;
pub use result::{ExecutionResult, NodeResult};
pub use spec::{EdgeCondition, EdgeSpec, GraphSpec, NodeSpec, NodeType};
pub use value::Value;
