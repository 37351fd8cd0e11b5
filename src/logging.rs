use std::io::stderr;

use anyhow::Result;
use chrono::Local;
use fern::colors::{Color, ColoredLevelConfig};
use log::{LevelFilter, Record};

/// `-v` count to the level of this crate's own records.
pub fn level_for_verbosity(verbose: u8) -> LevelFilter {
    match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    }
}

/// Dependencies stay quiet unless the user asks for everything.
fn dependency_level(level: LevelFilter) -> LevelFilter {
    match level {
        LevelFilter::Debug | LevelFilter::Trace => LevelFilter::Warn,
        _ => LevelFilter::Error,
    }
}

fn call_site(record: &Record) -> String {
    match (record.file(), record.line()) {
        (Some(path), Some(line)) => format!("{path}:{line}"),
        _ => record.target().to_string(),
    }
}

pub fn setup_logger(level: LevelFilter) -> Result<()> {
    let colors = ColoredLevelConfig::new()
        .error(Color::Red)
        .warn(Color::Yellow)
        .info(Color::Green)
        .debug(Color::Magenta)
        .trace(Color::BrightBlue);

    fern::Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                colors.color(record.level()),
                call_site(record),
                message,
            ))
        })
        .level(LevelFilter::Off)
        .level_for(env!("CARGO_PKG_NAME"), level)
        .level_for("webrtc", dependency_level(level))
        .level_for("tokio_tungstenite", dependency_level(level))
        .chain(stderr())
        .apply()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_maps_to_levels() {
        assert_eq!(level_for_verbosity(0), LevelFilter::Warn);
        assert_eq!(level_for_verbosity(1), LevelFilter::Info);
        assert_eq!(level_for_verbosity(4), LevelFilter::Debug);
        assert_eq!(dependency_level(LevelFilter::Debug), LevelFilter::Warn);
        assert_eq!(dependency_level(LevelFilter::Info), LevelFilter::Error);
    }
}
