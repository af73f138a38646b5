use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "pipexec-ctl")]
#[command(version, about = "Run a command with stdin fed and stdout/stderr drained concurrently", long_about = None)]
#[command(after_help = "EXAMPLES:
    # Feed text and collect both output streams
    pipexec-ctl run --capture --input 'hello' -- sh -c 'cat; echo oops >&2'

    # Stream a file through a filter with a progress line
    pipexec-ctl run --capture --progress --input-file big.log gzip -c > big.log.gz

    # Machine-readable result
    pipexec-ctl run --capture --json -- uname -a

    # Inspect pipe sizing on this host
    pipexec-ctl check
")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Show verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a program and wait for it
    Run {
        /// Capture stdout and stderr instead of discarding them
        #[arg(short, long)]
        capture: bool,

        /// Text written to the program's stdin
        #[arg(short, long, value_name = "TEXT", conflicts_with = "input_file")]
        input: Option<String>,

        /// File streamed to the program's stdin
        #[arg(short = 'f', long, value_name = "PATH")]
        input_file: Option<PathBuf>,

        /// Show stdin transfer progress on stderr
        #[arg(short, long)]
        progress: bool,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,

        /// Program to run
        program: String,

        /// Program arguments
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Show pipe capacity and transfer chunk size on this system
    Check,
}
