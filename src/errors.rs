//! Error types for process execution

use std::io;
use thiserror::Error;

/// Result type for execution operations
pub type Result<T> = std::result::Result<T, ExecError>;

/// Errors that prevent an execution from producing a result.
///
/// Stream-level read/write failures are not represented here: they end the
/// affected stream and the call still completes with whatever was captured.
#[derive(Error, Debug)]
pub enum ExecError {
    #[error("Empty command: argv must contain at least the program name")]
    EmptyCommand,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Syscall error: {0}")]
    Syscall(String),
}

impl ExecError {
    pub(crate) fn syscall(call: &str, errno: nix::errno::Errno) -> Self {
        ExecError::Syscall(format!("{} failed: {}", call, errno))
    }
}
