//! Execution requests: configuration, builder and blocking entry points

use std::ffi::{OsStr, OsString};
use std::fs::File;
use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::errors::{ExecError, Result};
use crate::execution::{
    ExecInput, ExecResult, FALLBACK_CHUNK_SIZE, Multiplexer, ProgressSink, StdioPlan, launch,
    prepare_argv,
};

/// Tuning knobs for an execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecConfig {
    /// Try to grow each pipe to the system maximum before sizing chunks
    pub raise_pipe_capacity: bool,
    /// Chunk size when pipe capacity cannot be discovered
    pub fallback_chunk_size: usize,
    /// Device unpiped standard streams are connected to
    pub null_device: PathBuf,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            raise_pipe_capacity: true,
            fallback_chunk_size: FALLBACK_CHUNK_SIZE,
            null_device: PathBuf::from("/dev/null"),
        }
    }
}

impl ExecConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.fallback_chunk_size == 0 {
            return Err(ExecError::InvalidArgument(
                "fallback chunk size must be positive".to_string(),
            ));
        }

        if self.null_device.as_os_str().is_empty() {
            return Err(ExecError::InvalidArgument(
                "null device path cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}

/// A validated command ready to run
#[derive(Debug)]
pub struct ExecRequest {
    argv: Vec<OsString>,
    input: Option<ExecInput>,
    capture_output: bool,
    config: ExecConfig,
}

impl ExecRequest {
    pub fn argv(&self) -> &[OsString] {
        &self.argv
    }

    pub fn has_input(&self) -> bool {
        self.input.is_some()
    }

    pub fn capture_output(&self) -> bool {
        self.capture_output
    }

    pub fn config(&self) -> &ExecConfig {
        &self.config
    }

    /// Run to completion
    pub fn run(self) -> Result<ExecResult> {
        self.execute(None)
    }

    /// Run to completion, reporting input progress to `sink` under `slot`
    pub fn run_with_progress(self, sink: &mut dyn ProgressSink, slot: i32) -> Result<ExecResult> {
        self.execute(Some((sink, slot)))
    }

    fn execute(self, progress: Option<(&mut dyn ProgressSink, i32)>) -> Result<ExecResult> {
        let argv = prepare_argv(&self.argv)?;
        let plan = StdioPlan::for_request(self.input.is_some(), self.capture_output);

        info!("Executing: {:?}", self.argv);

        let child = launch(&argv, plan, &self.config.null_device)?;
        let source = self.input.map(ExecInput::into_source);

        let mut multiplexer = Multiplexer::new(
            child,
            source,
            self.config.raise_pipe_capacity,
            self.config.fallback_chunk_size,
        );
        if let Some((sink, slot)) = progress {
            multiplexer = multiplexer.with_progress(sink, slot);
        }

        let result = multiplexer.run();

        debug!(
            "pid {} finished: exited={} exit_code={} stdout={:?} stderr={:?}",
            result.pid,
            result.exited,
            result.exit_code,
            result.stdout.as_ref().map(Vec::len),
            result.stderr.as_ref().map(Vec::len),
        );

        Ok(result)
    }
}

/// Builder pattern for execution requests
#[derive(Debug)]
pub struct ExecBuilder {
    argv: Vec<OsString>,
    input: Option<ExecInput>,
    capture_output: bool,
    config: ExecConfig,
}

impl ExecBuilder {
    /// Start a request for `program`, looked up through `PATH`
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self::from_argv(&[program])
    }

    /// Start from a complete argv; an empty argv fails at [`build`](Self::build)
    pub fn from_argv<S: AsRef<OsStr>>(argv: &[S]) -> Self {
        Self {
            argv: argv.iter().map(|arg| arg.as_ref().to_os_string()).collect(),
            input: None,
            capture_output: false,
            config: ExecConfig::default(),
        }
    }

    /// Append one argument
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.argv.push(arg.as_ref().to_os_string());
        self
    }

    /// Append several arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.argv
            .extend(args.into_iter().map(|arg| arg.as_ref().to_os_string()));
        self
    }

    /// Feed stdin from an in-memory buffer
    pub fn input_bytes(self, data: impl Into<Vec<u8>>) -> Self {
        self.input(ExecInput::Bytes(data.into()))
    }

    /// Feed stdin from a readable file, streamed incrementally
    pub fn input_file(self, file: File) -> Self {
        self.input(ExecInput::File(file))
    }

    /// Set stdin input
    pub fn input(mut self, input: impl Into<ExecInput>) -> Self {
        self.input = Some(input.into());
        self
    }

    /// Capture stdout and stderr
    pub fn capture_output(mut self, capture: bool) -> Self {
        self.capture_output = capture;
        self
    }

    /// Enable or disable the best-effort pipe capacity increase
    pub fn raise_pipe_capacity(mut self, raise: bool) -> Self {
        self.config.raise_pipe_capacity = raise;
        self
    }

    /// Set the chunk size used when pipe capacity is unknown
    pub fn fallback_chunk_size(mut self, size: usize) -> Self {
        self.config.fallback_chunk_size = size;
        self
    }

    /// Set the device used for streams that are neither piped nor inherited
    pub fn null_device(mut self, path: impl AsRef<Path>) -> Self {
        self.config.null_device = path.as_ref().to_path_buf();
        self
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: ExecConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the request. Fails before touching any OS resource.
    pub fn build(self) -> Result<ExecRequest> {
        if self.argv.is_empty() {
            return Err(ExecError::EmptyCommand);
        }
        self.config.validate()?;
        prepare_argv(&self.argv)?;

        Ok(ExecRequest {
            argv: self.argv,
            input: self.input,
            capture_output: self.capture_output,
            config: self.config,
        })
    }

    /// Build and run
    pub fn run(self) -> Result<ExecResult> {
        self.build()?.run()
    }
}

/// Run `argv`, optionally feeding `input` and capturing output, and wait for it
pub fn exec<S: AsRef<OsStr>>(
    argv: &[S],
    input: Option<&[u8]>,
    capture_output: bool,
) -> Result<ExecResult> {
    let mut builder = ExecBuilder::from_argv(argv).capture_output(capture_output);
    if let Some(data) = input {
        builder = builder.input_bytes(data);
    }
    builder.run()
}

/// Run `argv` with all standard streams on the null device; return its exit code
pub fn exec_command<S: AsRef<OsStr>>(argv: &[S]) -> Result<i32> {
    Ok(ExecBuilder::from_argv(argv).run()?.exit_code)
}

/// Run `argv` with stdin streamed from `file`.
///
/// When `progress` is given it is notified with the fraction of the file
/// written on every loop iteration, then with
/// [`PROGRESS_DONE`](crate::execution::PROGRESS_DONE).
pub fn exec_with_file_input<S: AsRef<OsStr>>(
    argv: &[S],
    file: File,
    capture_output: bool,
    progress: Option<&mut dyn ProgressSink>,
    slot: i32,
) -> Result<ExecResult> {
    let request = ExecBuilder::from_argv(argv)
        .input_file(file)
        .capture_output(capture_output)
        .build()?;

    match progress {
        Some(sink) => request.run_with_progress(sink, slot),
        None => request.run(),
    }
}
