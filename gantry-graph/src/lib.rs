mod config;
mod error;
mod executor;
mod expr;
mod registry;
mod scheduler;
mod validator;

pub use config::SchedulerConfig;
pub use error::GraphError;
pub use executor::{NodeContext, NodeExecutor};
pub use expr::{check_expression, evaluate, parse_expression, truthy, CompareOp, Expr, ExprError};
pub use registry::ExecutorRegistry;
pub use scheduler::{CancelHandle, GraphScheduler, END, START};
pub use validator::{validate, validate_or_raise, ValidationError, ValidationErrorKind};
