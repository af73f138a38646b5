//! Readiness-driven transfer loop
//!
//! One `poll` covers every open channel, so a full stdin pipe never keeps
//! stdout/stderr from being drained and a slow reader never stalls input.
//! Each iteration first checks (without blocking) whether the child is gone;
//! if so, whatever the kernel already queued on the output pipes is drained
//! before the loop ends.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, ErrorKind, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};

use log::{debug, trace, warn};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

use crate::execution::launcher::LaunchedChild;
use crate::execution::pipe::{set_nonblocking, tuned_chunk_size};
use crate::execution::reconcile::{CaptureBuffer, ExecResult, Reconciler};
use crate::execution::source::{InputSource, PROGRESS_DONE, ProgressSink};

/// One directional endpoint managed by the loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChannelRole {
    StdinWriter,
    StdoutReader,
    StderrReader,
}

impl ChannelRole {
    fn interest(self) -> PollFlags {
        match self {
            ChannelRole::StdinWriter => PollFlags::POLLOUT,
            ChannelRole::StdoutReader | ChannelRole::StderrReader => PollFlags::POLLIN,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Keep,
    Close,
}

/// Result of one transfer attempt on a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transfer {
    Moved(usize),
    WouldBlock,
    Finished,
}

fn hang_up() -> PollFlags {
    PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL
}

/// Read one chunk from `file` into `buffer`, retrying interrupted reads
fn read_chunk(file: &File, buffer: &mut CaptureBuffer, chunk: usize) -> Transfer {
    let mut reader = file;
    loop {
        match reader.read(buffer.spare(chunk)) {
            Ok(0) => return Transfer::Finished,
            Ok(n) => {
                buffer.commit(n);
                return Transfer::Moved(n);
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Transfer::WouldBlock,
            Err(e) => {
                debug!("read failed, closing stream: {}", e);
                return Transfer::Finished;
            }
        }
    }
}

fn write_chunk(file: &File, data: &[u8]) -> io::Result<Transfer> {
    let mut writer = file;
    loop {
        match writer.write(data) {
            Ok(0) => return Ok(Transfer::Finished),
            Ok(n) => return Ok(Transfer::Moved(n)),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(Transfer::WouldBlock),
            Err(e) => return Err(e),
        }
    }
}

/// Drives one execution from launch to reaped child
pub(crate) struct Multiplexer<'p> {
    reconciler: Reconciler,
    chunk: usize,
    active: BTreeMap<ChannelRole, File>,
    source: Option<Box<dyn InputSource>>,
    stdout: Option<CaptureBuffer>,
    stderr: Option<CaptureBuffer>,
    written: u64,
    progress: Option<(&'p mut dyn ProgressSink, i32)>,
}

impl<'p> Multiplexer<'p> {
    /// Take ownership of the caller's pipe ends and size the transfer chunk
    pub(crate) fn new(
        child: LaunchedChild,
        source: Option<Box<dyn InputSource>>,
        raise_pipe_capacity: bool,
        fallback_chunk_size: usize,
    ) -> Self {
        let LaunchedChild {
            pid,
            stdin,
            stdout,
            stderr,
        } = child;

        let chunk = {
            let fds: Vec<BorrowedFd<'_>> = [&stdout, &stderr, &stdin]
                .into_iter()
                .filter_map(|end| end.as_ref().map(|file| file.as_fd()))
                .collect();
            tuned_chunk_size(&fds, raise_pipe_capacity, fallback_chunk_size).max(1)
        };

        let mut active = BTreeMap::new();
        let mut capture = |role, end: Option<File>| {
            end.map(|file| {
                active.insert(role, file);
                CaptureBuffer::new()
            })
        };
        let stdout = capture(ChannelRole::StdoutReader, stdout);
        let stderr = capture(ChannelRole::StderrReader, stderr);

        let source = match (stdin, source) {
            (Some(file), Some(source)) => {
                active.insert(ChannelRole::StdinWriter, file);
                Some(source)
            }
            // A stdin pipe with nothing to send closes right away
            (_, source) => source,
        };

        debug!(
            "multiplexing pid {} with chunk size {} over {:?}",
            pid,
            chunk,
            active.keys().collect::<Vec<_>>()
        );

        Self {
            reconciler: Reconciler::new(pid),
            chunk,
            active,
            source,
            stdout,
            stderr,
            written: 0,
            progress: None,
        }
    }

    /// Report transfer progress to `sink` on every iteration, tagged with `slot`
    pub(crate) fn with_progress(mut self, sink: &'p mut dyn ProgressSink, slot: i32) -> Self {
        self.progress = Some((sink, slot));
        self
    }

    #[cfg(test)]
    pub(crate) fn chunk_size(&self) -> usize {
        self.chunk
    }

    /// Run until every channel is closed and the child is reaped
    pub(crate) fn run(mut self) -> ExecResult {
        while !self.active.is_empty() {
            if self.reconciler.poll_exit() {
                self.drain_after_exit();
                break;
            }

            self.report_progress();

            let ready = match self.wait_ready() {
                Ok(ready) => ready,
                Err(e) => {
                    warn!("poll failed, abandoning open streams: {}", e);
                    break;
                }
            };

            for (role, events) in ready {
                let step = match role {
                    ChannelRole::StdinWriter => self.feed_stdin(events),
                    ChannelRole::StdoutReader | ChannelRole::StderrReader => {
                        self.service_reader(role, events)
                    }
                };
                if step == Step::Close {
                    self.close(role);
                }
            }
        }

        // Closing first lets a child still blocked on stdin see end-of-file
        self.active.clear();
        self.reconciler.reap();

        if let Some((sink, slot)) = self.progress.as_mut() {
            sink.notify(PROGRESS_DONE, *slot);
        }

        let Multiplexer {
            reconciler,
            stdout,
            stderr,
            ..
        } = self;
        reconciler.finish(stdout, stderr)
    }

    fn close(&mut self, role: ChannelRole) {
        if self.active.remove(&role).is_some() {
            debug!("{:?} closed", role);
        }
    }

    /// Block until some channel is ready. An interrupted wait reports nothing
    /// ready so the caller re-checks the child first.
    fn wait_ready(&self) -> nix::Result<Vec<(ChannelRole, PollFlags)>> {
        let roles: Vec<ChannelRole> = self.active.keys().copied().collect();
        let mut fds: Vec<PollFd<'_>> = self
            .active
            .iter()
            .map(|(role, file)| PollFd::new(file.as_fd(), role.interest()))
            .collect();

        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        }

        Ok(roles
            .into_iter()
            .zip(fds.iter())
            .filter_map(|(role, fd)| {
                fd.revents()
                    .filter(|events| !events.is_empty())
                    .map(|events| (role, events))
            })
            .collect())
    }

    fn feed_stdin(&mut self, events: PollFlags) -> Step {
        if events.contains(PollFlags::POLLOUT) {
            let (Some(file), Some(source)) = (
                self.active.get(&ChannelRole::StdinWriter),
                self.source.as_mut(),
            ) else {
                return Step::Close;
            };

            let pending = match source.pending(self.chunk) {
                Ok([]) => {
                    debug!("stdin source exhausted after {} bytes", self.written);
                    return Step::Close;
                }
                Ok(bytes) => bytes,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                    return Step::Keep;
                }
                Err(e) => {
                    debug!("stdin source failed: {}", e);
                    return Step::Close;
                }
            };

            match write_chunk(file, pending) {
                Ok(Transfer::Moved(n)) => {
                    source.consume(n);
                    self.written += n as u64;
                    trace!("wrote {} bytes to stdin ({} total)", n, self.written);
                }
                Ok(Transfer::WouldBlock) => {}
                Ok(Transfer::Finished) => return Step::Close,
                Err(e) => {
                    debug!("stdin write failed: {}", e);
                    return Step::Close;
                }
            }
        }

        if events.intersects(hang_up()) {
            Step::Close
        } else {
            Step::Keep
        }
    }

    fn service_reader(&mut self, role: ChannelRole, events: PollFlags) -> Step {
        // Hang-up alongside readable data is handled by the zero-byte read
        // that eventually follows; closing early would drop queued output.
        if !events.contains(PollFlags::POLLIN) {
            return if events.intersects(hang_up()) {
                Step::Close
            } else {
                Step::Keep
            };
        }

        let buffer = match role {
            ChannelRole::StdoutReader => self.stdout.as_mut(),
            ChannelRole::StderrReader => self.stderr.as_mut(),
            ChannelRole::StdinWriter => None,
        };
        let (Some(file), Some(buffer)) = (self.active.get(&role), buffer) else {
            return Step::Close;
        };

        match read_chunk(file, buffer, self.chunk) {
            Transfer::Moved(n) => {
                trace!("read {} bytes from {:?}", n, role);
                Step::Keep
            }
            Transfer::WouldBlock => Step::Keep,
            Transfer::Finished => Step::Close,
        }
    }

    /// Collect output the child queued before exiting, without blocking
    fn drain_after_exit(&mut self) {
        for (role, buffer) in [
            (ChannelRole::StdoutReader, self.stdout.as_mut()),
            (ChannelRole::StderrReader, self.stderr.as_mut()),
        ] {
            let (Some(file), Some(buffer)) = (self.active.get(&role), buffer) else {
                continue;
            };

            // A descriptor shared with a surviving grandchild could block forever
            if let Err(e) = set_nonblocking(file) {
                debug!("cannot drain {:?} without blocking: {}", role, e);
                continue;
            }

            let mut drained = 0;
            while let Transfer::Moved(n) = read_chunk(file, buffer, self.chunk) {
                drained += n;
            }
            trace!("drained {} bytes from {:?} after exit", drained, role);
        }
    }

    fn report_progress(&mut self) {
        let Some((sink, slot)) = self.progress.as_mut() else {
            return;
        };

        let total = self
            .source
            .as_ref()
            .map(|source| source.estimated_len())
            .unwrap_or(1);
        let fraction = (self.written as f64 / total as f64).min(1.0) as f32;
        sink.notify(fraction, *slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writers_wait_for_output_readiness_and_readers_for_input() {
        assert_eq!(ChannelRole::StdinWriter.interest(), PollFlags::POLLOUT);
        assert_eq!(ChannelRole::StdoutReader.interest(), PollFlags::POLLIN);
        assert_eq!(ChannelRole::StderrReader.interest(), PollFlags::POLLIN);
    }

    #[test]
    fn read_chunk_distinguishes_data_would_block_and_eof() {
        let (read_end, write_end) = nix::unistd::pipe().unwrap();
        set_nonblocking(&read_end).unwrap();
        let reader = File::from(read_end);
        let writer = File::from(write_end);
        let mut buffer = CaptureBuffer::new();

        assert_eq!(read_chunk(&reader, &mut buffer, 8), Transfer::WouldBlock);

        (&writer).write_all(b"abc").unwrap();
        assert_eq!(read_chunk(&reader, &mut buffer, 8), Transfer::Moved(3));

        drop(writer);
        assert_eq!(read_chunk(&reader, &mut buffer, 8), Transfer::Finished);
        assert_eq!(buffer.into_bytes(), b"abc".to_vec());
    }

    #[test]
    fn write_chunk_reports_would_block_on_full_pipe() {
        let (_read_end, write_end) = nix::unistd::pipe().unwrap();
        set_nonblocking(&write_end).unwrap();
        let writer = File::from(write_end);
        let block = vec![0u8; 64 * 1024];

        let mut saw_would_block = false;
        for _ in 0..1024 {
            if write_chunk(&writer, &block).unwrap() == Transfer::WouldBlock {
                saw_would_block = true;
                break;
            }
        }
        assert!(saw_would_block);
    }

    #[test]
    fn write_chunk_fails_once_reader_is_gone() {
        let (read_end, write_end) = nix::unistd::pipe().unwrap();
        drop(read_end);
        let writer = File::from(write_end);

        // Rust binaries ignore SIGPIPE, so this surfaces as EPIPE
        let err = write_chunk(&writer, b"lost").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BrokenPipe);
    }
}
