use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Position of a failure inside user-supplied factor code.
///
/// For the formula dialect this is the line/column reported by the parser;
/// for the program dialect `context` names the `let` binding (or the result
/// expression) that was being evaluated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeLocation {
    pub line: usize,
    pub column: usize,
    pub context: String,
}

impl std::fmt::Display for CodeLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}, column {} ({})", self.line, self.column, self.context)
    }
}

#[derive(Error, Debug)]
pub enum FactorError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("No data: {0}")]
    DataAvailability(String),

    #[error("Computation error: {message}")]
    Computation {
        message: String,
        location: Option<CodeLocation>,
    },

    #[error("Store error: {0}")]
    Transport(#[from] mongodb::error::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FactorError {
    pub fn computation(message: impl Into<String>) -> Self {
        FactorError::Computation {
            message: message.into(),
            location: None,
        }
    }

    pub fn computation_at(message: impl Into<String>, location: CodeLocation) -> Self {
        FactorError::Computation {
            message: message.into(),
            location: Some(location),
        }
    }
}
