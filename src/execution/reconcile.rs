//! Result reconciliation: exit-code mapping, reaping and capture finalization

use std::borrow::Cow;

use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;

/// Exit code reported when the termination status cannot be interpreted
pub const INDETERMINATE_EXIT_CODE: i32 = -1;

/// Map a raw wait status to a normalized exit code.
///
/// Normal exit yields the process's own status, death by signal yields
/// `128 + signal`, anything else is indeterminate.
pub fn exit_code_from_status(status: &WaitStatus) -> i32 {
    match status {
        WaitStatus::Exited(_, code) => *code,
        WaitStatus::Signaled(_, signal, _) => 128 + *signal as i32,
        _ => INDETERMINATE_EXIT_CODE,
    }
}

fn is_termination(status: &WaitStatus) -> bool {
    matches!(status, WaitStatus::Exited(..) | WaitStatus::Signaled(..))
}

/// Outcome of a finished execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    /// Process ID of the launched child
    pub pid: Pid,
    /// Whether a termination status was observed
    pub exited: bool,
    /// Normalized exit code (see [`exit_code_from_status`])
    pub exit_code: i32,
    /// Captured stdout; `None` when capture was not requested.
    ///
    /// A stream that produced nothing while capture was on is `Some(vec![])`,
    /// never `None`. C-style capture APIs that return NULL for "no bytes"
    /// conflate the two; this field keeps them apart on purpose.
    pub stdout: Option<Vec<u8>>,
    /// Captured stderr, with the same absent/empty rule as [`stdout`](Self::stdout)
    pub stderr: Option<Vec<u8>>,
}

impl ExecResult {
    /// True if the process exited normally with status 0
    pub fn success(&self) -> bool {
        self.exited && self.exit_code == 0
    }

    /// Captured stdout decoded as UTF-8, replacing invalid sequences
    pub fn stdout_lossy(&self) -> Option<Cow<'_, str>> {
        self.stdout.as_deref().map(String::from_utf8_lossy)
    }

    /// Captured stderr decoded as UTF-8, replacing invalid sequences
    pub fn stderr_lossy(&self) -> Option<Cow<'_, str>> {
        self.stderr.as_deref().map(String::from_utf8_lossy)
    }
}

/// Growable capture buffer with an explicit logical length.
///
/// Capacity doubles, seeded at the transfer chunk size, whenever the free
/// space left is smaller than one chunk.
#[derive(Debug, Default)]
pub(crate) struct CaptureBuffer {
    data: Vec<u8>,
    len: usize,
}

impl CaptureBuffer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Writable window of exactly `chunk` bytes past the logical end
    pub(crate) fn spare(&mut self, chunk: usize) -> &mut [u8] {
        if self.data.len() - self.len < chunk {
            let doubled = if self.data.is_empty() {
                chunk
            } else {
                self.data.len() * 2
            };
            self.data.resize(doubled.max(self.len + chunk), 0);
        }
        &mut self.data[self.len..self.len + chunk]
    }

    /// Extend the logical length after `n` bytes were written into [`spare`](Self::spare)
    pub(crate) fn commit(&mut self, n: usize) {
        debug_assert!(self.len + n <= self.data.len());
        self.len += n;
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[cfg(test)]
    pub(crate) fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Exactly the accumulated bytes, nothing past the logical end
    pub(crate) fn into_bytes(mut self) -> Vec<u8> {
        self.data.truncate(self.len);
        self.data.shrink_to_fit();
        self.data
    }
}

/// Tracks the child's termination and assembles the final [`ExecResult`]
pub(crate) struct Reconciler {
    pid: Pid,
    status: Option<WaitStatus>,
}

impl Reconciler {
    pub(crate) fn new(pid: Pid) -> Self {
        Self { pid, status: None }
    }

    pub(crate) fn has_exited(&self) -> bool {
        self.status.is_some()
    }

    /// Non-blocking check for termination; records the status if the child is gone
    pub(crate) fn poll_exit(&mut self) -> bool {
        if self.has_exited() {
            return true;
        }

        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(status) if is_termination(&status) => {
                debug!("child {} terminated: {:?}", self.pid, status);
                self.status = Some(status);
                true
            }
            Ok(_) | Err(Errno::EINTR) => false,
            Err(e) => {
                // Nothing left to wait for; leave it to the blocking reap to report
                debug!("waitpid(WNOHANG) on {} failed: {}", self.pid, e);
                false
            }
        }
    }

    /// Block until the child terminates, retrying on interruption
    pub(crate) fn reap(&mut self) {
        while self.status.is_none() {
            match waitpid(self.pid, None) {
                Ok(status) if is_termination(&status) => self.status = Some(status),
                Ok(_) | Err(Errno::EINTR) => continue,
                Err(e) => {
                    warn!("waitpid on {} failed: {}", self.pid, e);
                    return;
                }
            }
        }
    }

    pub(crate) fn finish(
        self,
        stdout: Option<CaptureBuffer>,
        stderr: Option<CaptureBuffer>,
    ) -> ExecResult {
        let exit_code = self
            .status
            .as_ref()
            .map(exit_code_from_status)
            .unwrap_or(INDETERMINATE_EXIT_CODE);

        ExecResult {
            pid: self.pid,
            exited: self.status.is_some(),
            exit_code,
            stdout: stdout.map(CaptureBuffer::into_bytes),
            stderr: stderr.map(CaptureBuffer::into_bytes),
        }
    }
}
