// agent/src/error.rs

use thiserror::Error;
use uuid::Uuid;

use crate::model::DeploymentStatus;
use crate::sys::tool::Stage;

/// Object storage failures (listing, reading, writing source bundles).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no files found under prefix {prefix}")]
    Empty { prefix: String },

    #[error("object not found: {key}")]
    NotFound { key: String },

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("object store transport failure: {0}")]
    Transport(String),

    #[error("refusing object key {key}: {reason}")]
    InvalidKey { key: String, reason: &'static str },

    #[error("{} file(s) failed to upload: {}", .failures.len(), .failures.join("; "))]
    Aggregate { failures: Vec<String> },

    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
}

/// Role assumption failures.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("role assumption rejected: {0}")]
    Rejected(String),

    #[error("invalid role assumption input: {0}")]
    InvalidInput(String),

    #[error("credential service unavailable: {0}")]
    Unavailable(String),

    #[error("malformed credential response: {0}")]
    Malformed(String),
}

/// A tool stage exited non-zero (or was cut off by the stage timeout).
/// `detail` is already ANSI-free.
#[derive(Debug, Error)]
#[error("{} failed: {detail}", .stage.label())]
pub struct ToolStageError {
    pub stage: Stage,
    pub detail: String,
}

/// A status write that the deployment state machine does not allow.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("deployment {deployment_id} cannot move from {current} to {requested}")]
pub struct GuardViolation {
    pub deployment_id: Uuid,
    pub current: DeploymentStatus,
    pub requested: DeploymentStatus,
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    ToolStage(#[from] ToolStageError),

    #[error(transparent)]
    Guard(#[from] GuardViolation),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} {id} does not belong to the caller")]
    Forbidden { kind: &'static str, id: String },

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("agent unavailable: {0}")]
    Unavailable(String),

    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Unexpected(String),
}

pub type Result<T> = std::result::Result<T, AgentError>;

impl AgentError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound { kind, id: id.to_string() }
    }

    pub fn forbidden(kind: &'static str, id: impl ToString) -> Self {
        Self::Forbidden { kind, id: id.to_string() }
    }

    /// Short machine-readable tag used on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Store(_) => "store",
            Self::Credential(_) => "credential",
            Self::ToolStage(_) => "tool_stage",
            Self::Guard(_) => "guard_violation",
            Self::NotFound { .. } => "not_found",
            Self::Forbidden { .. } => "forbidden",
            Self::Precondition(_) => "precondition",
            Self::Unavailable(_) => "unavailable",
            Self::Io(_) | Self::Unexpected(_) => "unexpected",
        }
    }

    /// The text recorded in a deployment's `error_message` when a background
    /// execution ends in this error.
    pub fn failure_message(&self) -> String {
        match self {
            Self::ToolStage(e) => e.to_string(),
            Self::Store(e) => format!("Source download failed: {e}"),
            Self::Credential(e) => format!("Credential error: {e}"),
            other => format!("Unexpected error: {other}"),
        }
    }
}
