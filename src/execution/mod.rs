//! Execution layer: process launch and stream multiplexing
//!
//! This module owns everything between "here is an argv" and "here is the
//! exit code and captured output".
//!
//! # Components
//!
//! - **pipe**: pipe buffer tuning, picks the transfer chunk size
//! - **launcher**: fork/exec with per-stream redirection, re-exec of self
//! - **source**: stdin sources (buffer or file) and progress notifications
//! - **multiplexer**: the poll-driven stdin/stdout/stderr transfer loop
//! - **reconcile**: exit-code mapping, reaping, final [`ExecResult`]

pub mod launcher;
pub mod multiplexer;
pub mod pipe;
pub mod reconcile;
pub mod source;

pub use launcher::{
    EXEC_FAILURE_EXIT_CODE, LaunchedChild, Redirection, StdioPlan, launch, prepare_argv,
    reexec_self,
};
pub use multiplexer::ChannelRole;
pub use pipe::{FALLBACK_CHUNK_SIZE, pipe_capacity, pipe_max_size, tuned_chunk_size};
pub use reconcile::{ExecResult, INDETERMINATE_EXIT_CODE, exit_code_from_status};
pub use source::{ExecInput, PROGRESS_DONE, ProgressSink};

pub(crate) use multiplexer::Multiplexer;

#[cfg(test)]
mod tests;
