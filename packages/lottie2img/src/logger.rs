//! The logger capability handed to a session.
//!
//! Sessions report user-facing events (the synchronous fallback warning,
//! failed conversions, lines the runtime prints) through a [`Logger`].
//! Internal diagnostics always go through `tracing` regardless of the
//! logger in use.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Severity of a logged message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        })
    }
}

/// Receives log messages from a session.
///
/// Logging is best-effort: nothing a logger does changes the outcome of a
/// conversion.
pub trait Logger: Send + Sync {
    fn log(&self, level: LogLevel, message: &str);
}

impl<F> Logger for F
where
    F: Fn(LogLevel, &str) + Send + Sync,
{
    fn log(&self, level: LogLevel, message: &str) {
        self(level, message)
    }
}

/// Forwards messages to `tracing` under the `lottie2img` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Info => tracing::info!(target: "lottie2img", "{message}"),
            LogLevel::Warn => tracing::warn!(target: "lottie2img", "{message}"),
            LogLevel::Error => tracing::error!(target: "lottie2img", "{message}"),
        }
    }
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLogger;

impl Logger for NoopLogger {
    fn log(&self, _level: LogLevel, _message: &str) {}
}

/// Output stream of the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

const WARN_PREFIX: &str = "[warn]";

/// Pick the level for a line the runtime printed.
///
/// Standard output is informational. Standard error is an error unless the
/// line carries the runtime's `[warn]` prefix, which is stripped.
pub fn route_output(stream: Stream, line: &str) -> (LogLevel, &str) {
    match stream {
        Stream::Stdout => (LogLevel::Info, line),
        Stream::Stderr => match line.strip_prefix(WARN_PREFIX) {
            Some(rest) => (LogLevel::Warn, rest.trim_start()),
            None => (LogLevel::Error, line),
        },
    }
}

/// Log every line of a runtime print through `logger`.
pub fn log_output(logger: &dyn Logger, stream: Stream, text: &str) {
    for line in text.lines().filter(|l| !l.is_empty()) {
        let (level, message) = route_output(stream, line);
        logger.log(level, message);
    }
}

/// Shared handle to a logger.
pub type SharedLogger = Arc<dyn Logger>;

/// Wraps a user logger so that a panic inside it drops the message instead
/// of unwinding into the session.
pub struct GuardedLogger {
    inner: SharedLogger,
}

impl GuardedLogger {
    pub fn new(inner: SharedLogger) -> Self {
        Self { inner }
    }
}

impl Logger for GuardedLogger {
    fn log(&self, level: LogLevel, message: &str) {
        let logged = panic::catch_unwind(AssertUnwindSafe(|| self.inner.log(level, message)));
        if logged.is_err() {
            tracing::warn!(%level, "logger panicked, message dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn stdout_is_info() {
        assert_eq!(
            route_output(Stream::Stdout, "Gzip header detected"),
            (LogLevel::Info, "Gzip header detected")
        );
    }

    #[test]
    fn stderr_warn_prefix_is_stripped() {
        assert_eq!(
            route_output(Stream::Stderr, "[warn] Unknown argument: foo=1, ignored."),
            (LogLevel::Warn, "Unknown argument: foo=1, ignored.")
        );
    }

    #[test]
    fn stderr_without_prefix_is_error() {
        assert_eq!(
            route_output(Stream::Stderr, "Could not decompress"),
            (LogLevel::Error, "Could not decompress")
        );
    }

    #[test]
    fn closures_are_loggers() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let logger = move |level: LogLevel, message: &str| {
            sink.lock().unwrap().push((level, message.to_string()));
        };

        log_output(&logger, Stream::Stderr, "[warn]one\n\nboom\n");
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (LogLevel::Warn, "one".to_string()),
                (LogLevel::Error, "boom".to_string())
            ]
        );
    }

    #[test]
    fn guarded_logger_swallows_panics() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let logger = GuardedLogger::new(Arc::new(move |level: LogLevel, message: &str| {
            if level == LogLevel::Error {
                panic!("logger failure");
            }
            sink.lock().unwrap().push(message.to_string());
        }));

        logger.log(LogLevel::Error, "dropped");
        logger.log(LogLevel::Info, "kept");
        assert_eq!(*seen.lock().unwrap(), vec!["kept".to_string()]);
    }
}
