//! Logging initialisation on top of the `log` facade.

use crate::utils::LoggingConfig;
use log::LevelFilter;

/// Initialise `env_logger` from configuration and CLI verbosity.
///
/// Each verbosity step raises the configured level by one; `quiet` clamps the
/// output to errors. `RUST_LOG`, when set, still refines per-module filters.
/// Calling this more than once is harmless.
pub fn init(config: &LoggingConfig, verbosity: u8, quiet: bool) {
    let base = parse_level(&config.level);
    let level = if quiet {
        LevelFilter::Error
    } else {
        raise(base, verbosity)
    };

    let _ = env_logger::Builder::new()
        .filter_level(level)
        .parse_env("RUST_LOG")
        .format_timestamp_millis()
        .try_init();
}

fn parse_level(level: &str) -> LevelFilter {
    level.parse().unwrap_or(LevelFilter::Info)
}

fn raise(level: LevelFilter, steps: u8) -> LevelFilter {
    let mut current = level;
    for _ in 0..steps {
        current = match current {
            LevelFilter::Off => LevelFilter::Error,
            LevelFilter::Error => LevelFilter::Warn,
            LevelFilter::Warn => LevelFilter::Info,
            LevelFilter::Info => LevelFilter::Debug,
            LevelFilter::Debug | LevelFilter::Trace => LevelFilter::Trace,
        };
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_raises_level() {
        assert_eq!(raise(LevelFilter::Info, 0), LevelFilter::Info);
        assert_eq!(raise(LevelFilter::Info, 1), LevelFilter::Debug);
        assert_eq!(raise(LevelFilter::Warn, 5), LevelFilter::Trace);
    }

    #[test]
    fn test_unknown_level_falls_back_to_info() {
        assert_eq!(parse_level("debug"), LevelFilter::Debug);
        assert_eq!(parse_level("nonsense"), LevelFilter::Info);
    }
}
