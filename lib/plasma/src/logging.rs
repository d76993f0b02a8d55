pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Drain, Level, Logger};

/// Builds the process logger writing to stderr at the requested level.
/// `level` is one of `trace`, `debug`, `info`, `warning`, `error`.
pub fn init(level: &str) -> Logger {
    use sloggers::{Config, LoggerConfig};

    let config: LoggerConfig = serdeconv::from_toml_str(&format!(
        r#"
type = "terminal"
level = "{}"
destination = "stderr"
"#,
        level
    ))
    .expect("logger configuration must parse");

    config.build_logger().expect("logger must build")
}

/// A logger that drops everything. Components take this when the caller has
/// no logging set up (mostly tests).
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}
