use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde_json::Value;

/// Severity, ordered from most to least important so that `level <= min`
/// means "emit".
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum LogLevel {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Verbose = 5,
}

impl LogLevel {
    /// Accepts the names used in `logging.level`, plus `warning` and `trace`.
    pub fn from_config_value(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "error" => Some(Self::Error),
            "warn" | "warning" => Some(Self::Warn),
            "info" => Some(Self::Info),
            "debug" => Some(Self::Debug),
            "verbose" | "trace" => Some(Self::Verbose),
            _ => None,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Warn => "WARN",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
            Self::Verbose => "VERBOSE",
        }
    }

    fn ansi_color(self) -> u8 {
        match self {
            Self::Error => 31,
            Self::Warn => 33,
            Self::Info => 32,
            Self::Debug => 36,
            Self::Verbose => 35,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Clone, Debug)]
pub struct LoggerConfig {
    pub min_level: LogLevel,
    /// Colored levels and `key=value` payloads instead of raw JSON.
    pub human_friendly: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            min_level: LogLevel::Info,
            human_friendly: false,
        }
    }
}

pub trait LogSink: Send + Sync {
    fn write_line(&self, line: &str);
}

pub struct StdoutSink;

impl LogSink for StdoutSink {
    fn write_line(&self, line: &str) {
        let _ = writeln!(io::stdout().lock(), "{line}");
    }
}

struct NullSink;

impl LogSink for NullSink {
    fn write_line(&self, _line: &str) {}
}

/// Line-oriented structured logger shared by every loop of the runtime.
///
/// A line is `<rfc3339> [LEVEL] [context] message payload`. The context is a
/// tag such as `worker::w1` or `pools::connections`.
pub struct Logger {
    config: LoggerConfig,
    sink: Arc<dyn LogSink>,
}

impl Logger {
    pub fn new(config: LoggerConfig) -> Self {
        Self::with_sink(config, Arc::new(StdoutSink))
    }

    pub fn with_sink(config: LoggerConfig, sink: Arc<dyn LogSink>) -> Self {
        Self { config, sink }
    }

    /// Drops everything. Used where a caller has no logger to hand in.
    pub fn silent() -> Self {
        Self::with_sink(
            LoggerConfig {
                min_level: LogLevel::Error,
                human_friendly: false,
            },
            Arc::new(NullSink),
        )
    }

    pub fn is_enabled(&self, level: LogLevel) -> bool {
        level <= self.config.min_level
    }

    pub fn error(&self, context: Option<&str>, message: &str) {
        self.log(LogLevel::Error, context, message, None);
    }

    pub fn warn(&self, context: Option<&str>, message: &str) {
        self.log(LogLevel::Warn, context, message, None);
    }

    pub fn info(&self, context: Option<&str>, message: &str) {
        self.log(LogLevel::Info, context, message, None);
    }

    pub fn debug(&self, context: Option<&str>, message: &str) {
        self.log(LogLevel::Debug, context, message, None);
    }

    pub fn log(
        &self,
        level: LogLevel,
        context: Option<&str>,
        message: &str,
        payload: Option<Value>,
    ) {
        if self.is_enabled(level) {
            self.sink
                .write_line(&self.render(level, context, message, payload.as_ref()));
        }
    }

    fn render(
        &self,
        level: LogLevel,
        context: Option<&str>,
        message: &str,
        payload: Option<&Value>,
    ) -> String {
        let mut line = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);

        if self.config.human_friendly {
            line.push_str(&format!(" [\x1b[{}m{}\x1b[0m]", level.ansi_color(), level.label()));
        } else {
            line.push_str(&format!(" [{}]", level.label()));
        }
        if let Some(context) = context.filter(|context| !context.is_empty()) {
            line.push_str(&format!(" [{context}]"));
        }
        line.push(' ');
        line.push_str(message);

        match payload {
            Some(Value::Object(fields)) if self.config.human_friendly => {
                for (key, value) in fields {
                    match value {
                        Value::String(text) => line.push_str(&format!(" {key}={text}")),
                        other => line.push_str(&format!(" {key}={other}")),
                    }
                }
            }
            Some(value) => line.push_str(&format!(" payload={value}")),
            None => {}
        }
        line
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use crate::testing::MemorySink;

    use super::{LogLevel, Logger, LoggerConfig};

    fn capture(config: LoggerConfig) -> (Logger, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::default());
        (Logger::with_sink(config, sink.clone()), sink)
    }

    #[test]
    fn parses_config_levels_case_insensitively() {
        assert_eq!(LogLevel::from_config_value("DEBUG"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::from_config_value(" warn "), Some(LogLevel::Warn));
        assert_eq!(LogLevel::from_config_value("trace"), Some(LogLevel::Verbose));
        assert_eq!(LogLevel::from_config_value("loud"), None);
    }

    #[test]
    fn info_threshold_excludes_debug_logs() {
        let (logger, sink) = capture(LoggerConfig::default());

        logger.info(Some("worker::w1"), "fetched job");
        logger.debug(Some("worker::w1"), "fetch round trip");

        let lines = sink.lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("[INFO] [worker::w1] fetched job"));
        assert!(logger.is_enabled(LogLevel::Warn));
        assert!(!logger.is_enabled(LogLevel::Debug));
    }

    #[test]
    fn machine_format_appends_json_payload() {
        let (logger, sink) = capture(LoggerConfig::default());

        logger.log(
            LogLevel::Info,
            Some("worker::w1"),
            "Job acknowledged",
            Some(json!({"jid":"abc123","queue":"critical"})),
        );

        let line = &sink.lines()[0];
        assert!(line.starts_with("20"));
        assert!(line.ends_with("Job acknowledged payload={\"jid\":\"abc123\",\"queue\":\"critical\"}"));
    }

    #[test]
    fn human_format_colors_level_and_flattens_payload() {
        let (logger, sink) = capture(LoggerConfig {
            min_level: LogLevel::Debug,
            human_friendly: true,
        });

        logger.log(
            LogLevel::Warn,
            None,
            "Fetch failed",
            Some(json!({"error":"broker gone","retries":2})),
        );

        let line = &sink.lines()[0];
        assert!(line.contains("[\x1b[33mWARN\x1b[0m] Fetch failed"));
        assert!(line.contains(" error=broker gone"));
        assert!(line.contains(" retries=2"));
        assert!(!line.contains("payload="));
    }

    #[test]
    fn silent_logger_only_admits_errors_and_drops_them() {
        let logger = Logger::silent();
        logger.error(Some("tests::silent"), "should vanish");
        assert!(logger.is_enabled(LogLevel::Error));
        assert!(!logger.is_enabled(LogLevel::Warn));
    }
}
