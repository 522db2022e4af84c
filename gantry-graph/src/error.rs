use thiserror::Error;

use crate::validator::ValidationError;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("graph validation failed with {count} error(s): {summary}", count = .0.len(), summary = summarize(.0))]
    Validation(Vec<ValidationError>),
    #[error("unknown entry point: {0}")]
    UnknownEntryPoint(String),
}

fn summarize(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|error| error.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
