pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Logger};

/// Builds a terminal logger for binaries and demos. Library components take a
/// parent `Logger` (or `None` for a discarding one) instead of calling this.
pub fn init() -> Logger {
    use sloggers::{Config, LoggerConfig};

    let config: LoggerConfig = serdeconv::from_toml_str(
        r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#,
    )
    .unwrap();

    config.build_logger().unwrap()
}

/// A logger that drops everything. Used as the fallback when a component is
/// constructed without a parent logger.
#[inline]
pub fn null() -> Logger {
    Logger::root(Discard, o!())
}
