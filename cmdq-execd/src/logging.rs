//! Maps spec.md's PostgreSQL-flavored log level names onto a `tracing`
//! `EnvFilter`, and builds the subscriber through `tracing-appender`'s
//! non-blocking writer — the async "logger thread" the original design
//! calls out, expressed the idiomatic way.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// `DEBUG1`..`DEBUG5` have no `tracing` equivalent; they compress onto
/// `debug`/`trace` in decreasing order of verbosity (DEBUG1 is the
/// least chatty of the five, DEBUG5 the most, matching PostgreSQL's own
/// convention).
pub fn directive_for(level: &str) -> &'static str {
    let normalized = level
        .trim()
        .to_ascii_uppercase()
        .strip_prefix("LOG_")
        .map(str::to_string)
        .unwrap_or_else(|| level.trim().to_ascii_uppercase());

    match normalized.as_str() {
        "NONE" => "off",
        "PANIC" | "FATAL" | "LOG" | "ERROR" => "error",
        "WARNING" => "warn",
        "NOTICE" | "INFO" => "info",
        "DEBUG1" | "DEBUG2" => "debug",
        "DEBUG3" | "DEBUG4" | "DEBUG5" => "trace",
        _ => "info",
    }
}

/// Installs the global subscriber and returns the `WorkerGuard` the caller
/// must hold for the process lifetime (dropping it stops the writer
/// thread and would silently swallow any log line still in flight).
pub fn init(level: &str, log_times: bool) -> WorkerGuard {
    let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());
    let filter = EnvFilter::new(directive_for(level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(writer);
    if log_times {
        builder.init();
    } else {
        builder.without_time().init();
    }

    guard
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tolerates_log_prefix_and_case() {
        assert_eq!(directive_for("LOG_WARNING"), "warn");
        assert_eq!(directive_for("warning"), "warn");
    }

    #[test]
    fn compresses_debug_levels() {
        assert_eq!(directive_for("DEBUG1"), "debug");
        assert_eq!(directive_for("DEBUG5"), "trace");
    }

    #[test]
    fn none_disables_logging() {
        assert_eq!(directive_for("NONE"), "off");
    }
}
