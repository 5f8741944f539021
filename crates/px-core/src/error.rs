//! Error types for Probaxis

use thiserror::Error;

/// Probaxis error type
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Rank, shape or reduction-shape violation
    #[error("Validation error: {0}")]
    Validation(String),

    /// Dtype or structure incompatibility at a call boundary
    #[error("Type error: {0}")]
    Type(String),

    /// A required primitive is missing or the operation is undefined
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// Invalid argument value (construction args, sample shapes, model protocol)
    #[error("Value error: {0}")]
    Value(String),

    /// Numeric failure at run time
    #[error("Computation error: {0}")]
    Computation(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
