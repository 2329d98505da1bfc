// ABOUTME: Error types for the sandbox execution engine
// ABOUTME: Taxonomy of environment, container, task, and signal failures with stable kind strings

use std::path::PathBuf;
use thiserror::Error;

use crate::providers::ProviderError;

/// Main error type for sandbox operations
#[derive(Error, Debug)]
pub enum SandboxError {
    /// Environment file contains a line that is not a comment, blank, or assignment
    #[error("Malformed environment file {path} at line {line}: {content:?}")]
    MalformedEnvironmentFile {
        path: PathBuf,
        line: usize,
        content: String,
    },

    /// Container could not be reached after bounded retries
    #[error("Container unavailable: {0}")]
    ContainerUnavailable(String),

    /// Image build failed; needs operator intervention
    #[error("Image build failed for {tag}: {details}")]
    BuildFailed { tag: String, details: String },

    /// Task identifier was never registered or has been pruned
    #[error("Unknown task: {0}")]
    UnknownTask(String),

    /// Waiting for a task gave up; the task itself keeps running
    #[error("Task {task_id} still running after {seconds} seconds")]
    ExecutionTimeout { task_id: String, seconds: u64 },

    /// Signal delivery failed for a task that is not terminal
    #[error("Failed to signal task {task_id}: {details}")]
    KillFailed { task_id: String, details: String },

    /// Caller supplied a path that is absolute or escapes the workspace
    #[error("Invalid workspace path: {0}")]
    InvalidPath(String),

    /// Request could not be understood
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    /// Stable machine-readable name of the error kind
    pub fn kind(&self) -> &'static str {
        match self {
            SandboxError::MalformedEnvironmentFile { .. } => "MalformedEnvironmentFile",
            SandboxError::ContainerUnavailable(_) => "ContainerUnavailable",
            SandboxError::BuildFailed { .. } => "BuildFailed",
            SandboxError::UnknownTask(_) => "UnknownTask",
            SandboxError::ExecutionTimeout { .. } => "ExecutionTimeout",
            SandboxError::KillFailed { .. } => "KillFailed",
            SandboxError::InvalidPath(_) => "InvalidPath",
            SandboxError::InvalidRequest(_) => "InvalidRequest",
            SandboxError::Json(_) => "Json",
            SandboxError::Io(_) => "Io",
        }
    }

    /// Whether the failure may clear up on its own
    pub fn is_transient(&self) -> bool {
        matches!(self, SandboxError::ContainerUnavailable(_))
    }
}

impl From<ProviderError> for SandboxError {
    fn from(err: ProviderError) -> Self {
        SandboxError::ContainerUnavailable(err.to_string())
    }
}

/// Type alias for Results that return SandboxError
pub type Result<T> = std::result::Result<T, SandboxError>;
