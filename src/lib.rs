//! pipexec: deadlock-free process execution over standard streams
//!
//! Launches an external command, feeds its stdin from a buffer or a file,
//! drains stdout and stderr concurrently through a single readiness wait, and
//! reports a normalized exit code. A blocking call always returns: pipe
//! buffers filling up on any side cannot stall it.
//!
//! Linux is the primary target (pipe capacity tuning uses `F_SETPIPE_SZ`).
//!
//! # Modules
//!
//! - **execution**: launcher, multiplexer, pipe tuning, result reconciliation
//! - **controller**: request builder and blocking entry points
//! - **errors**: error type and `Result` alias
//!
//! # Example
//!
//! ```no_run
//! use pipexec::ExecBuilder;
//!
//! let result = ExecBuilder::new("sh")
//!     .args(["-c", "cat; echo done >&2; exit 3"])
//!     .input_bytes("hello\n")
//!     .capture_output(true)
//!     .run()?;
//!
//! assert_eq!(result.exit_code, 3);
//! assert_eq!(result.stdout.as_deref(), Some(&b"hello\n"[..]));
//! # Ok::<(), pipexec::ExecError>(())
//! ```

pub mod errors;
pub mod execution;

pub mod controller;

pub use controller::{ExecBuilder, ExecConfig, ExecRequest, exec, exec_command, exec_with_file_input};
pub use errors::{ExecError, Result};
pub use execution::{
    EXEC_FAILURE_EXIT_CODE, ExecInput, ExecResult, PROGRESS_DONE, ProgressSink, reexec_self,
};
