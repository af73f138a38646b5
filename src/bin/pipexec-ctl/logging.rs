use console::style;
use env_logger::{Builder, Env};
use log::{Level, LevelFilter};
use std::io::Write;

fn level_tag(level: Level) -> String {
    match level {
        Level::Error => style("ERROR").red().bold().to_string(),
        Level::Warn => style("WARN ").yellow().bold().to_string(),
        Level::Info => style("INFO ").green().to_string(),
        Level::Debug => style("DEBUG").cyan().to_string(),
        Level::Trace => style("TRACE").dim().to_string(),
    }
}

/// Initialize logger; `RUST_LOG` overrides the level picked by `--verbose`
pub fn init_logger(verbose: bool) {
    let default = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    };

    Builder::new()
        .filter_level(default)
        .parse_env(Env::default())
        .format(|buf, record| {
            writeln!(
                buf,
                "{} {} {}",
                level_tag(record.level()),
                style(record.target()).dim(),
                record.args()
            )
        })
        .init();
}
