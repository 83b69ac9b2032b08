//! Core error taxonomy.
//!
//! One variant per condition named in the component design; no catch-all,
//! mirroring the rest of this codebase's typed-error crates.

use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum CoreError {
    #[error("invalid name '{0}'")]
    InvalidName(String),

    #[error("bundle '{0}' not found")]
    NotFound(String),

    #[error("failed to parse bundle: {0}")]
    ParseError(String),

    #[error("bundle schema error: {0}")]
    SchemaError(String),

    #[error("duplicate step name '{0}'")]
    DuplicateStep(String),

    #[error("unresolved reference '{0}'")]
    UnresolvedReference(String),

    #[error("lock acquisition timed out after {0:?}")]
    LockTimeout(Duration),

    #[error("lock acquisition cancelled")]
    LockCancelled,

    #[error("failed to create workspace: {0}")]
    WorkspaceCreate(String),

    #[error("failed to write artifact: {0}")]
    WriteError(String),

    #[error("failed to read artifact(s): {0:?}")]
    ReadError(Vec<String>),

    #[error("tool execution failed: {0}")]
    ExecFailed(String),

    #[error("unknown step kind for '{0}'")]
    UnknownStep(String),

    #[error("{0} of {1} parallel children failed: {2}")]
    PartialFailure(usize, usize, String),

    #[error("run cancelled")]
    Cancelled,
}

impl CoreError {
    /// Stable machine-readable code, used as `Envelope::error.code` and
    /// surfaced in the CLI's `--format json` output.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidName(_) => "INVALID_NAME",
            Self::NotFound(_) => "NOT_FOUND",
            Self::ParseError(_) => "PARSE_ERROR",
            Self::SchemaError(_) => "SCHEMA_ERROR",
            Self::DuplicateStep(_) => "DUPLICATE_STEP",
            Self::UnresolvedReference(_) => "UNRESOLVED_REFERENCE",
            Self::LockTimeout(_) => "LOCK_TIMEOUT",
            Self::LockCancelled => "LOCK_CANCELLED",
            Self::WorkspaceCreate(_) => "WORKSPACE_CREATE",
            Self::WriteError(_) => "WRITE_ERROR",
            Self::ReadError(_) => "READ_ERROR",
            Self::ExecFailed(_) => "EXEC_FAILED",
            Self::UnknownStep(_) => "UNKNOWN_STEP",
            Self::PartialFailure(..) => "PARTIAL_FAILURE",
            Self::Cancelled => "CANCELLED",
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
