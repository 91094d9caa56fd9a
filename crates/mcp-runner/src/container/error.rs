//! Container runtime error types.

use thiserror::Error;

/// Result type for container operations.
pub type ContainerResult<T> = Result<T, ContainerError>;

/// Errors that can occur during container operations.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// The container command failed.
    #[error("container {command} failed: {message}")]
    CommandFailed { command: String, message: String },

    /// No container runtime available.
    #[error("no container runtime available (docker or podman)")]
    NoRuntimeAvailable,

    /// Invalid input provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A piped stdio handle was not available after spawning.
    #[error("container process is missing its {0} pipe")]
    MissingPipe(&'static str),

    /// Generic IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ContainerError {
    pub(crate) fn command_failed(command: &str, message: impl ToString) -> Self {
        ContainerError::CommandFailed {
            command: command.to_string(),
            message: message.to_string(),
        }
    }
}
