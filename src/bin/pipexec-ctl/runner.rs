use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use console::{Term, style};
use log::{debug, info};
use pipexec::{ExecBuilder, ExecResult, PROGRESS_DONE, ProgressSink};
use serde::Serialize;

/// Configuration for a single run
pub struct RunConfig {
    pub program: String,
    pub args: Vec<String>,
    pub capture: bool,
    pub input: Option<String>,
    pub input_file: Option<PathBuf>,
    pub progress: bool,
    pub json: bool,
}

/// JSON view of an [`ExecResult`]
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub pid: i32,
    pub exited: bool,
    pub exit_code: i32,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

impl From<&ExecResult> for RunReport {
    fn from(result: &ExecResult) -> Self {
        Self {
            pid: result.pid.as_raw(),
            exited: result.exited,
            exit_code: result.exit_code,
            stdout: result.stdout_lossy().map(|s| s.into_owned()),
            stderr: result.stderr_lossy().map(|s| s.into_owned()),
        }
    }
}

/// Renders progress as one rewritten line on stderr
struct ProgressLine {
    term: Term,
    last_percent: Option<u32>,
}

impl ProgressLine {
    fn new() -> Self {
        Self {
            term: Term::stderr(),
            last_percent: None,
        }
    }
}

fn progress_text(fraction: f32) -> String {
    if fraction == PROGRESS_DONE {
        "stdin: done".to_string()
    } else {
        format!("stdin: {:>3}%", (fraction.clamp(0.0, 1.0) * 100.0).round() as u32)
    }
}

impl ProgressSink for ProgressLine {
    fn notify(&mut self, fraction: f32, _slot: i32) {
        let percent = (fraction != PROGRESS_DONE).then(|| (fraction * 100.0) as u32);
        if percent.is_some() && percent == self.last_percent {
            return;
        }
        self.last_percent = percent;

        let _ = self.term.clear_line();
        let _ = self.term.write_str(&progress_text(fraction));
        if fraction == PROGRESS_DONE {
            let _ = self.term.write_line("");
        }
    }
}

pub fn run_command(config: RunConfig) -> Result<i32, Box<dyn std::error::Error>> {
    let mut builder = ExecBuilder::new(&config.program)
        .args(&config.args)
        .capture_output(config.capture);

    if let Some(text) = config.input {
        debug!("Feeding {} bytes of text to stdin", text.len());
        builder = builder.input_bytes(text);
    }

    if let Some(path) = config.input_file {
        debug!("Streaming {:?} to stdin", path);
        let file = File::open(&path).map_err(|e| format!("cannot open {:?}: {}", path, e))?;
        builder = builder.input_file(file);
    }

    let request = builder.build()?;
    info!("Executing: {} {:?}", config.program, config.args);

    let result = if config.progress {
        let mut line = ProgressLine::new();
        request.run_with_progress(&mut line, 0)?
    } else {
        request.run()?
    };

    if config.json {
        println!("{}", serde_json::to_string_pretty(&RunReport::from(&result))?);
        return Ok(result.exit_code);
    }

    if let Some(out) = &result.stdout {
        std::io::stdout().write_all(out)?;
    }
    if let Some(err) = &result.stderr {
        std::io::stderr().write_all(err)?;
    }

    let exit_code_styled = if result.success() {
        style(result.exit_code).green().bold()
    } else {
        style(result.exit_code).red().bold()
    };

    eprint!(
        "{}={} | {}={}",
        style("pid").dim(),
        style(result.pid).bold(),
        style("exit_code").dim(),
        exit_code_styled,
    );
    if !result.exited {
        eprint!(" | {}={}", style("exited").red(), style("false").red().bold());
    }
    eprintln!();

    Ok(result.exit_code)
}
