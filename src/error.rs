//! Error types for the task agent.

use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the engine and its request handlers.
#[derive(Error, Debug)]
pub enum AgentError {
    /// A trace or output log could not be created or initialized.
    /// The engine cannot run a task without both logs.
    #[error("log file {path}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A control or stdin request named a task this agent does not manage.
    #[error("wrong task id")]
    WrongTaskId { expected: u32, got: u32 },

    /// The request could not be parsed.
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// The interpreter side of a channel has gone away.
    #[error("interpreter channel closed")]
    InterpreterGone,

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    pub fn log_file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::LogFile {
            path: path.into(),
            source,
        }
    }

    /// Whether the error was caused by the caller rather than the agent.
    pub fn is_request_error(&self) -> bool {
        matches!(self, Self::WrongTaskId { .. } | Self::MalformedRequest(_))
    }
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, AgentError>;
