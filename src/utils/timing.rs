use std::time::{Duration, Instant};

use serde_json::json;

use crate::logging::{LogLevel, Logger};

/// Result of a timed call together with its wall-clock duration.
#[derive(Debug)]
pub struct Timed<T> {
    pub value: T,
    pub elapsed: Duration,
}

/// Runs `task` and logs its duration at debug level under `context`.
pub fn measure_execution<T, F>(label: &str, context: Option<&str>, logger: &Logger, task: F) -> Timed<T>
where
    F: FnOnce() -> T,
{
    let started_at = Instant::now();
    let value = task();
    let elapsed = started_at.elapsed();

    if logger.is_enabled(LogLevel::Debug) {
        logger.log(
            LogLevel::Debug,
            context,
            &format!("{label} finished in {}", format_duration(elapsed)),
            Some(json!({ "elapsed_ms": elapsed.as_millis() as u64 })),
        );
    }

    Timed { value, elapsed }
}

pub fn format_duration(duration: Duration) -> String {
    let total_ms = duration.as_secs_f64() * 1000.0;
    if total_ms < 1_000.0 {
        return format!("{total_ms:.2} ms");
    }

    let total_seconds = total_ms / 1_000.0;
    if total_seconds < 60.0 {
        return format!("{total_seconds:.2} s");
    }

    let minutes = (total_seconds / 60.0).floor();
    let seconds_remainder = total_seconds - (minutes * 60.0);
    format!("{minutes:.0}m {seconds_remainder:.2}s")
}
