//! Engine error types

use crate::step::StepKind;
use thiserror::Error;

/// Deployment engine errors
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Plugin load failed for {package}@{version}: {message}")]
    PluginLoad {
        package: String,
        version: String,
        message: String,
    },

    #[error("Invalid provider configuration for {package}@{version}: {message}")]
    InvalidConfig {
        package: String,
        version: String,
        message: String,
    },

    #[error("Duplicate resource URN: {0}")]
    DuplicateUrn(String),

    #[error("{kind} step failed for {urn}: {message}")]
    StepExecution {
        urn: String,
        kind: StepKind,
        message: String,
    },

    #[error("Snapshot consistency violation: {0}")]
    SnapshotConsistency(String),

    #[error("Invalid URN: {0}")]
    InvalidUrn(String),

    #[error("Invalid provider reference: {0}")]
    InvalidProviderReference(String),

    #[error("Invalid inputs for {urn}: {}", .failures.join("; "))]
    InvalidInputs { urn: String, failures: Vec<String> },

    #[error("Resource {0} is protected and cannot be deleted or replaced")]
    ProtectedResource(String),

    #[error("Dependency {dependency} of {urn} was never registered")]
    UnresolvedDependency { urn: String, dependency: String },

    #[error("Step for {urn} skipped: {reason}")]
    Skipped { urn: String, reason: String },

    #[error("Deployment cancelled: {0}")]
    Cancelled(String),

    #[error("State file error: {0}")]
    StateError(String),

    #[error("Lock acquisition failed: {0}")]
    LockError(String),

    #[error("{kind} step for {urn} timed out: {message}")]
    Timeout {
        urn: String,
        kind: StepKind,
        message: String,
    },

    #[error("Program failed: {0}")]
    Program(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Errors that abort the whole run rather than a single step
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::SnapshotConsistency(_))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
