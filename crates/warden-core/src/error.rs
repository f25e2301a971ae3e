//! Error types for the warden crates

use std::io;
use thiserror::Error;

/// Result type for warden operations
pub type Result<T> = std::result::Result<T, WardenError>;

/// Errors that can occur while supervising a sandboxed process
#[derive(Error, Debug)]
pub enum WardenError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Syscall error: {0}")]
    Syscall(String),

    #[error("Attach error: {0}")]
    Attach(String),

    #[error("Comms error: {0}")]
    Comms(String),

    #[error("Proc error: {0}")]
    Proc(String),

    #[error("Unwind error: {0}")]
    Unwind(String),

    #[error("Monitor error: {0}")]
    Monitor(String),

    #[error("Monitor already running")]
    AlreadyRunning,

    #[error("Tracee {0} no longer exists")]
    TraceeGone(i32),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl WardenError {
    /// True when the error is a "task already died" race that callers
    /// are expected to swallow.
    pub fn is_tracee_gone(&self) -> bool {
        matches!(self, WardenError::TraceeGone(_))
    }
}
