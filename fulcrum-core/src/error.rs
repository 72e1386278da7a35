//! Error taxonomy shared by every subsystem.
//!
//! Validation errors (`InvalidExport`, `InvalidParameterType`) are detected
//! when a module is submitted to a loading set and reject only the
//! offending module. Resource conflicts (`Duplicate`, `NotPermitted`,
//! `NotADependency`, `CyclicDependency`, `Detached`, `NotFound`) surface
//! from handle/registry operations straight to the caller. User callback
//! failures are wrapped in `OperationFailed` and torn down independently of
//! sibling instances.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FulcrumError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("operation not permitted: {0}")]
    NotPermitted(String),

    #[error("'{dependent}' does not depend on '{dependency}'")]
    NotADependency { dependent: String, dependency: String },

    #[error("adding '{dependent} -> {dependency}' would introduce a cycle")]
    CyclicDependency { dependent: String, dependency: String },

    #[error("instance '{0}' is detached")]
    Detached(String),

    #[error("invalid export '{name}': {reason}")]
    InvalidExport { name: String, reason: String },

    #[error("invalid parameter type for '{0}'")]
    InvalidParameterType(String),

    #[error("operation failed: {0}")]
    OperationFailed(String),
}

pub type Result<T> = std::result::Result<T, FulcrumError>;
