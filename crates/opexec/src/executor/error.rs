use thiserror::Error;

use crate::memory::ArgId;

/// Errors raised while selecting, building or running an executor.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// No catalog entry supports the configuration at all.
    #[error("no suitable implementation for {operation}: {config}")]
    NoSuitableImplementation { operation: String, config: String },
    /// Candidates exist but none fits the concrete shape.
    #[error("no implementation of {operation} is suitable for shapes {config}")]
    NoShapeSuitableImplementation { operation: String, config: String },
    /// An implementation's compliance answer broke the adaptation contract.
    #[error("implementation {implementation} violated its compliance contract: {detail}")]
    InternalComplianceViolation {
        implementation: String,
        detail: String,
    },
    #[error("memory argument {0} is not bound")]
    MissingArgument(ArgId),
    #[error("invalid memory: {0}")]
    InvalidMemory(String),
    #[error("unsupported conversion from {from} to {to}")]
    UnsupportedConversion { from: String, to: String },
    #[error("executor execution failure: {0}")]
    Execution(String),
}

impl ExecutorError {
    pub fn compliance(implementation: impl Into<String>, detail: impl Into<String>) -> Self {
        ExecutorError::InternalComplianceViolation {
            implementation: implementation.into(),
            detail: detail.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        ExecutorError::Execution(message.into())
    }
}

pub type ExecResult<T> = Result<T, ExecutorError>;
