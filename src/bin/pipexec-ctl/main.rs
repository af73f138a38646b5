//! pipexec controller CLI - run commands with deadlock-free stdio plumbing

mod cli;
mod commands;
mod logging;
mod runner;

use clap::Parser;
use cli::{Cli, Commands};
use commands::check_pipe_sizing;
use console::style;
use runner::{RunConfig, run_command};

fn main() {
    let cli = Cli::parse();

    logging::init_logger(cli.verbose);

    match cli.command {
        Commands::Run {
            capture,
            input,
            input_file,
            progress,
            json,
            program,
            args,
        } => {
            let config = RunConfig {
                program,
                args,
                capture,
                input,
                input_file,
                progress,
                json,
            };
            match run_command(config) {
                Ok(code) => std::process::exit(code),
                Err(e) => {
                    eprintln!("{} {}", style("error:").red().bold(), e);
                    std::process::exit(1);
                }
            }
        }
        Commands::Check => check_pipe_sizing(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_pipe_sizing_runs() {
        check_pipe_sizing();
    }
}
