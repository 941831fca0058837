//! The `--log-level` flag and `env_logger` wiring shared by every binary in
//! the suite, so each thin CLI crate doesn't reimplement the same clap enum
//! and builder setup four times.

use clap::ValueEnum;

/// Minimum severity `env_logger` emits. Maps onto [`log::LevelFilter`].
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for log::LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

/// Initializes `env_logger` at `level`, still overridable at runtime via
/// `RUST_LOG` like every other `env_logger` consumer in the pack.
pub fn init_logger(level: LogLevel) {
    env_logger::Builder::new()
        .filter_level(level.into())
        .parse_default_env()
        .init();
}
