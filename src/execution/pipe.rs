//! Pipe capacity tuning and descriptor flags
//!
//! The transfer loop sizes its chunks after the kernel pipe buffer. Raising
//! the buffer and querying it are separate operations: the raise is
//! fire-and-forget, the query never changes anything.

use std::fs;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};

use log::trace;
use nix::fcntl::{FcntlArg, OFlag, fcntl};

/// Chunk size used when the pipe buffer size cannot be discovered
pub const FALLBACK_CHUNK_SIZE: usize = 4096;

const PIPE_MAX_SIZE_PATH: &str = "/proc/sys/fs/pipe-max-size";

/// System-wide upper bound for a pipe buffer, if the kernel exposes one
pub fn pipe_max_size() -> Option<usize> {
    fs::read_to_string(PIPE_MAX_SIZE_PATH)
        .ok()?
        .trim()
        .parse::<usize>()
        .ok()
        .filter(|&size| size > 0)
}

/// Try to grow the pipe behind `fd` to the system maximum. Failures are ignored.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn raise_pipe_capacity<Fd: AsFd>(fd: Fd) {
    let Some(max) = pipe_max_size().and_then(|size| libc::c_int::try_from(size).ok()) else {
        return;
    };

    if let Err(e) = fcntl(fd.as_fd().as_raw_fd(), FcntlArg::F_SETPIPE_SZ(max)) {
        trace!("F_SETPIPE_SZ({}) rejected: {}", max, e);
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn raise_pipe_capacity<Fd: AsFd>(_fd: Fd) {}

/// Current buffer size of the pipe behind `fd`
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn pipe_capacity<Fd: AsFd>(fd: Fd) -> Option<usize> {
    fcntl(fd.as_fd().as_raw_fd(), FcntlArg::F_GETPIPE_SZ)
        .ok()
        .and_then(|size| usize::try_from(size).ok())
        .filter(|&size| size > 0)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn pipe_capacity<Fd: AsFd>(_fd: Fd) -> Option<usize> {
    None
}

/// Pick the transfer chunk size for a set of pipe ends.
///
/// The smallest discovered capacity wins so a single chunk always fits every
/// pipe; `fallback` is returned when nothing could be discovered.
pub fn tuned_chunk_size(fds: &[BorrowedFd<'_>], raise: bool, fallback: usize) -> usize {
    fds.iter()
        .filter_map(|fd| {
            if raise {
                raise_pipe_capacity(*fd);
            }
            pipe_capacity(*fd)
        })
        .min()
        .unwrap_or(fallback)
}

fn update_status_flags<Fd: AsFd>(fd: Fd, nonblocking: bool) -> nix::Result<()> {
    let raw = fd.as_fd().as_raw_fd();
    let mut flags = OFlag::from_bits_truncate(fcntl(raw, FcntlArg::F_GETFL)?);
    flags.set(OFlag::O_NONBLOCK, nonblocking);
    fcntl(raw, FcntlArg::F_SETFL(flags))?;
    Ok(())
}

/// Put a descriptor into non-blocking mode
pub fn set_nonblocking<Fd: AsFd>(fd: Fd) -> nix::Result<()> {
    update_status_flags(fd, true)
}

/// Put a descriptor back into blocking mode
pub fn set_blocking<Fd: AsFd>(fd: Fd) -> nix::Result<()> {
    update_status_flags(fd, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::{ErrorKind, Read};
    use std::os::fd::AsFd;

    #[test]
    fn tuned_chunk_size_falls_back_without_descriptors() {
        assert_eq!(tuned_chunk_size(&[], true, FALLBACK_CHUNK_SIZE), 4096);
        assert_eq!(tuned_chunk_size(&[], false, 512), 512);
    }

    #[test]
    fn tuned_chunk_size_falls_back_for_regular_files() {
        let file = tempfile::tempfile().unwrap();
        let size = tuned_chunk_size(&[file.as_fd()], true, FALLBACK_CHUNK_SIZE);
        assert_eq!(size, FALLBACK_CHUNK_SIZE);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn pipe_capacity_reports_kernel_buffer() {
        let (read_end, _write_end) = nix::unistd::pipe().unwrap();
        let capacity = pipe_capacity(&read_end).unwrap();
        assert!(capacity >= 4096);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn raising_capacity_never_shrinks_the_pipe() {
        let (read_end, write_end) = nix::unistd::pipe().unwrap();
        let before = pipe_capacity(&read_end).unwrap();

        let tuned = tuned_chunk_size(&[read_end.as_fd(), write_end.as_fd()], true, 1);
        assert!(tuned >= before);

        if let Some(max) = pipe_max_size() {
            assert!(tuned <= max.max(before));
        }
    }

    #[test]
    fn set_nonblocking_turns_empty_reads_into_would_block() {
        let (read_end, _write_end) = nix::unistd::pipe().unwrap();
        set_nonblocking(&read_end).unwrap();

        let mut reader = File::from(read_end);
        let mut buf = [0u8; 16];
        let err = reader.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WouldBlock);
    }

    #[test]
    fn set_blocking_clears_the_flag() {
        let (read_end, _write_end) = nix::unistd::pipe().unwrap();
        set_nonblocking(&read_end).unwrap();
        set_blocking(&read_end).unwrap();

        let flags = OFlag::from_bits_truncate(fcntl(read_end.as_raw_fd(), FcntlArg::F_GETFL).unwrap());
        assert!(!flags.contains(OFlag::O_NONBLOCK));
    }
}
