//! Stdin sources and progress notifications
//!
//! The multiplexer feeds the child's stdin from an [`InputSource`]: either a
//! pre-loaded buffer or a file descriptor read incrementally, one bounded
//! read per writable event.

use std::fs::File;
use std::io::{self, ErrorKind, Read};
use std::os::unix::fs::FileTypeExt;

use log::debug;

use crate::execution::pipe::set_blocking;

/// Fraction passed to [`ProgressSink::notify`] once the transfer is finished
pub const PROGRESS_DONE: f32 = -1.0;

/// Receiver of transfer progress, implemented by a rendering collaborator.
///
/// `fraction` is in `[0, 1]` while input is being transferred and
/// [`PROGRESS_DONE`] once the execution completes. `slot` is passed through
/// untouched so one renderer can track several executions.
pub trait ProgressSink {
    fn notify(&mut self, fraction: f32, slot: i32);
}

impl<F> ProgressSink for F
where
    F: FnMut(f32, i32),
{
    fn notify(&mut self, fraction: f32, slot: i32) {
        self(fraction, slot)
    }
}

/// Data fed to the child's stdin
#[derive(Debug)]
pub enum ExecInput {
    /// In-memory buffer, written as-is (embedded zero bytes included)
    Bytes(Vec<u8>),
    /// Readable descriptor streamed until end-of-file. It is switched to
    /// blocking mode; the change is visible through any duplicate of it.
    File(File),
}

impl ExecInput {
    pub(crate) fn into_source(self) -> Box<dyn InputSource> {
        match self {
            ExecInput::Bytes(data) => Box::new(BufferSource::new(data)),
            ExecInput::File(file) => Box::new(FileSource::new(file)),
        }
    }
}

impl From<Vec<u8>> for ExecInput {
    fn from(data: Vec<u8>) -> Self {
        ExecInput::Bytes(data)
    }
}

impl From<&[u8]> for ExecInput {
    fn from(data: &[u8]) -> Self {
        ExecInput::Bytes(data.to_vec())
    }
}

impl From<String> for ExecInput {
    fn from(data: String) -> Self {
        ExecInput::Bytes(data.into_bytes())
    }
}

impl From<&str> for ExecInput {
    fn from(data: &str) -> Self {
        ExecInput::Bytes(data.as_bytes().to_vec())
    }
}

impl From<File> for ExecInput {
    fn from(file: File) -> Self {
        ExecInput::File(file)
    }
}

/// Cursor over the bytes still owed to the child
pub(crate) trait InputSource {
    /// Up to `max` bytes that have not been written yet.
    ///
    /// An empty slice means the source is exhausted.
    fn pending(&mut self, max: usize) -> io::Result<&[u8]>;

    /// Mark the first `n` bytes of the last [`pending`](Self::pending) slice as written
    fn consume(&mut self, n: usize);

    /// Total size used for progress fractions, never zero
    fn estimated_len(&self) -> u64;
}

pub(crate) struct BufferSource {
    data: Vec<u8>,
    cursor: usize,
}

impl BufferSource {
    pub(crate) fn new(data: Vec<u8>) -> Self {
        Self { data, cursor: 0 }
    }
}

impl InputSource for BufferSource {
    fn pending(&mut self, max: usize) -> io::Result<&[u8]> {
        let end = self.data.len().min(self.cursor.saturating_add(max));
        Ok(&self.data[self.cursor..end])
    }

    fn consume(&mut self, n: usize) {
        self.cursor = (self.cursor + n).min(self.data.len());
    }

    fn estimated_len(&self) -> u64 {
        (self.data.len() as u64).max(1)
    }
}

/// Streams a descriptor; bytes read but refused by a short write are kept
pub(crate) struct FileSource {
    file: File,
    chunk: Vec<u8>,
    offset: usize,
    eof: bool,
    estimated_len: u64,
}

impl FileSource {
    pub(crate) fn new(file: File) -> Self {
        // A non-blocking source would keep the writable stdin pipe spinning
        if let Err(e) = set_blocking(&file) {
            debug!("cannot clear O_NONBLOCK on stdin source: {}", e);
        }
        let estimated_len = estimate_len(&file);
        Self {
            file,
            chunk: Vec::new(),
            offset: 0,
            eof: false,
            estimated_len,
        }
    }
}

/// Regular files and FIFOs report a size; everything else is indeterminate (1)
fn estimate_len(file: &File) -> u64 {
    match file.metadata() {
        Ok(meta) if meta.file_type().is_file() || meta.file_type().is_fifo() => meta.len().max(1),
        _ => 1,
    }
}

impl InputSource for FileSource {
    fn pending(&mut self, max: usize) -> io::Result<&[u8]> {
        if self.offset == self.chunk.len() && !self.eof {
            self.chunk.resize(max, 0);
            self.offset = 0;
            loop {
                match self.file.read(&mut self.chunk) {
                    Ok(n) => {
                        self.chunk.truncate(n);
                        self.eof = n == 0;
                        break;
                    }
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        self.chunk.clear();
                        return Err(e);
                    }
                }
            }
        }
        Ok(&self.chunk[self.offset..])
    }

    fn consume(&mut self, n: usize) {
        self.offset = (self.offset + n).min(self.chunk.len());
    }

    fn estimated_len(&self) -> u64 {
        self.estimated_len
    }
}
