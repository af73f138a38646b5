//! Process launch with per-stream redirection
//!
//! The child is created with `fork` and every descriptor it needs is resolved
//! beforehand, so between fork and exec the child only calls `dup2`,
//! `execvp` and `_exit`. All pipes are close-on-exec; `dup2` clears the flag
//! on the standard stream it installs.

use std::ffi::{CStr, CString, OsStr};
use std::fs::{File, OpenOptions};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use libc::c_char;
use log::debug;
use nix::fcntl::OFlag;
use nix::sys::signal::{SigHandler, SigSet, Signal, signal};
use nix::unistd::{ForkResult, Pid, fork, pipe2};

use crate::errors::{ExecError, Result};
use crate::execution::pipe::set_nonblocking;
use crate::execution::reconcile::{INDETERMINATE_EXIT_CODE, Reconciler};

/// Status the child exits with when the target program cannot be started.
///
/// Indistinguishable from a program that exits with 114 on its own.
pub const EXEC_FAILURE_EXIT_CODE: i32 = 114;

/// What a standard stream of the child is connected to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Redirection {
    /// Keep the caller's descriptor
    Inherit,
    /// Connect to the null device
    Null,
    /// Connect to a pipe whose other end goes to the caller
    Pipe,
}

/// Redirection of all three standard streams
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StdioPlan {
    pub stdin: Redirection,
    pub stdout: Redirection,
    pub stderr: Redirection,
}

impl StdioPlan {
    /// Plan for an execution request: only needed streams are piped, the rest
    /// go to the null device. Nothing is inherited from the caller's terminal.
    pub fn for_request(has_input: bool, capture_output: bool) -> Self {
        let pipe_or_null = |piped: bool| {
            if piped {
                Redirection::Pipe
            } else {
                Redirection::Null
            }
        };

        Self {
            stdin: pipe_or_null(has_input),
            stdout: pipe_or_null(capture_output),
            stderr: pipe_or_null(capture_output),
        }
    }

    /// All three streams inherited from the caller
    pub fn inherit() -> Self {
        Self {
            stdin: Redirection::Inherit,
            stdout: Redirection::Inherit,
            stderr: Redirection::Inherit,
        }
    }

    fn uses_null(&self) -> bool {
        [self.stdin, self.stdout, self.stderr].contains(&Redirection::Null)
    }
}

/// A freshly forked child and the caller's ends of its pipes
#[derive(Debug)]
pub struct LaunchedChild {
    pub pid: Pid,
    /// Write end of the child's stdin, non-blocking
    pub stdin: Option<File>,
    /// Read end of the child's stdout
    pub stdout: Option<File>,
    /// Read end of the child's stderr
    pub stderr: Option<File>,
}

/// Convert an argument list into exec-ready C strings
pub fn prepare_argv<S: AsRef<OsStr>>(argv: &[S]) -> Result<Vec<CString>> {
    if argv.is_empty() {
        return Err(ExecError::EmptyCommand);
    }

    argv.iter()
        .map(|arg| {
            CString::new(arg.as_ref().as_bytes()).map_err(|_| {
                ExecError::InvalidArgument(format!(
                    "argument contains a nul byte: {:?}",
                    arg.as_ref()
                ))
            })
        })
        .collect()
}

/// Launch `argv[0]` (resolved through `PATH`) with the given redirections
pub fn launch(argv: &[CString], plan: StdioPlan, null_device: &Path) -> Result<LaunchedChild> {
    let program = argv.first().ok_or(ExecError::EmptyCommand)?;
    spawn(program, argv, plan, null_device)
}

fn open_pipe() -> Result<(OwnedFd, OwnedFd)> {
    pipe2(OFlag::O_CLOEXEC).map_err(|e| ExecError::syscall("pipe", e))
}

fn open_pipe_if(redirection: Redirection) -> Result<Option<(OwnedFd, OwnedFd)>> {
    if redirection == Redirection::Pipe {
        open_pipe().map(Some)
    } else {
        Ok(None)
    }
}

fn child_fd(redirection: Redirection, piped: Option<&OwnedFd>, null: Option<&File>) -> Option<RawFd> {
    match redirection {
        Redirection::Inherit => None,
        Redirection::Null => null.map(|f| f.as_raw_fd()),
        Redirection::Pipe => piped.map(|fd| fd.as_raw_fd()),
    }
}

fn spawn(program: &CStr, argv: &[CString], plan: StdioPlan, null_device: &Path) -> Result<LaunchedChild> {
    // Everything the child touches is allocated before fork
    let mut argv_ptrs: Vec<*const c_char> = argv.iter().map(|arg| arg.as_ptr()).collect();
    argv_ptrs.push(std::ptr::null());

    let null = if plan.uses_null() {
        Some(OpenOptions::new().read(true).write(true).open(null_device)?)
    } else {
        None
    };

    // Any early return drops (closes) the pipes created so far
    let stdin_pipe = open_pipe_if(plan.stdin)?;
    let stdout_pipe = open_pipe_if(plan.stdout)?;
    let stderr_pipe = open_pipe_if(plan.stderr)?;

    if let Some((_, write_end)) = &stdin_pipe {
        set_nonblocking(write_end).map_err(|e| ExecError::syscall("fcntl", e))?;
    }

    let child_fds = [
        child_fd(plan.stdin, stdin_pipe.as_ref().map(|(read, _)| read), null.as_ref()),
        child_fd(plan.stdout, stdout_pipe.as_ref().map(|(_, write)| write), null.as_ref()),
        child_fd(plan.stderr, stderr_pipe.as_ref().map(|(_, write)| write), null.as_ref()),
    ];

    // SAFETY: the child branch only performs async-signal-safe calls on
    // memory prepared above and never returns.
    match unsafe { fork() } {
        Err(e) => Err(ExecError::syscall("fork", e)),
        Ok(ForkResult::Child) => exec_child(program, &argv_ptrs, &child_fds),
        Ok(ForkResult::Parent { child }) => {
            debug!("launched {:?} as pid {} ({:?})", program, child, plan);

            // Child halves close as they drop here
            let stdin = stdin_pipe.map(|(_, write)| File::from(write));
            let stdout = stdout_pipe.map(|(read, _)| File::from(read));
            let stderr = stderr_pipe.map(|(read, _)| File::from(read));

            Ok(LaunchedChild {
                pid: child,
                stdin,
                stdout,
                stderr,
            })
        }
    }
}

/// Move any source descriptor sitting on 0, 1 or 2 to a number of at least 3,
/// so installing one standard stream cannot clobber the source of another.
/// Slots sharing a descriptor keep sharing the moved copy. Returns `None` if
/// a copy cannot be made. Only async-signal-safe calls.
fn lift_std_fds(fds: &[Option<RawFd>; 3]) -> Option<[Option<RawFd>; 3]> {
    let mut lifted = *fds;
    for slot in 0..lifted.len() {
        let Some(source) = lifted[slot] else {
            continue;
        };
        if source > libc::STDERR_FILENO {
            continue;
        }

        // SAFETY: F_DUPFD_CLOEXEC only creates a new descriptor
        let copy = unsafe { libc::fcntl(source, libc::F_DUPFD_CLOEXEC, 3) };
        if copy < 0 {
            return None;
        }
        for entry in lifted.iter_mut().skip(slot) {
            if *entry == Some(source) {
                *entry = Some(copy);
            }
        }
    }
    Some(lifted)
}

/// Install the standard streams and exec. Only valid in a freshly forked child.
fn exec_child(program: &CStr, argv: &[*const c_char], fds: &[Option<RawFd>; 3]) -> ! {
    // SAFETY: raw libc calls in the forked child; no allocation, no unwinding
    unsafe {
        // The caller's ignored SIGPIPE and blocked signals would survive exec
        let _ = signal(Signal::SIGPIPE, SigHandler::SigDfl);
        let _ = SigSet::empty().thread_set_mask();

        let Some(fds) = lift_std_fds(fds) else {
            libc::_exit(EXEC_FAILURE_EXIT_CODE);
        };

        for (target, source) in fds.iter().enumerate() {
            let Some(source) = *source else {
                continue;
            };
            // dup2 leaves the new descriptor without close-on-exec
            if libc::dup2(source, target as libc::c_int) < 0 {
                libc::_exit(EXEC_FAILURE_EXIT_CODE);
            }
        }

        libc::execvp(program.as_ptr(), argv.as_ptr());
        libc::_exit(EXEC_FAILURE_EXIT_CODE)
    }
}

fn current_exe_path() -> Result<PathBuf> {
    let proc_exe = Path::new("/proc/self/exe");
    if proc_exe.exists() {
        return Ok(proc_exe.to_path_buf());
    }
    Ok(std::env::current_exe()?)
}

/// Run the current executable again with `args`, sharing the caller's terminal.
///
/// `args` becomes the new process's argv (`args[0]` is its program name; the
/// executable path is used when `args` is empty). Blocks until the child
/// terminates and returns its normalized exit code.
pub fn reexec_self<S: AsRef<OsStr>>(args: &[S]) -> Result<i32> {
    let exe = current_exe_path()?;
    let program = prepare_argv(&[exe.as_os_str()])?.remove(0);

    let argv = if args.is_empty() {
        vec![program.clone()]
    } else {
        prepare_argv(args)?
    };

    let child = spawn(&program, &argv, StdioPlan::inherit(), Path::new("/dev/null"))?;
    let mut reconciler = Reconciler::new(child.pid);
    reconciler.reap();

    let result = reconciler.finish(None, None);
    if !result.exited {
        return Ok(INDETERMINATE_EXIT_CODE);
    }
    Ok(result.exit_code)
}
