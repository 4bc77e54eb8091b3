use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};

use crate::client::{BeatSignal, ClientError};
use crate::config::AppConfig;
use crate::logging::LogLevel;
use crate::runtime::RuntimeContext;

const LOG_CONTEXT: &str = "heartbeat";

pub const MIN_INTERVAL_MS: u64 = 100;
pub const MAX_INTERVAL_MS: u64 = 60_000;
pub const DEFAULT_INTERVAL_MS: u64 = 5_000;

#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[repr(u8)]
pub enum LifecycleState {
    Running = 0,
    Quiet = 1,
    Terminating = 2,
}

impl LifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Quiet => "quiet",
            Self::Terminating => "terminating",
        }
    }

    /// Value of `current_state` in `BEAT`; omitted while running.
    pub fn beat_state(self) -> Option<&'static str> {
        match self {
            Self::Running => None,
            Self::Quiet => Some("quiet"),
            Self::Terminating => Some("terminate"),
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Running,
            1 => Self::Quiet,
            _ => Self::Terminating,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared RUNNING -> QUIET -> TERMINATING state. Never moves backwards.
#[derive(Clone, Debug, Default)]
pub struct Lifecycle {
    state: Arc<AtomicU8>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Returns `true` when this call moved the state forward.
    pub fn advance_to(&self, next: LifecycleState) -> bool {
        let previous = self.state.fetch_max(next as u8, Ordering::SeqCst);
        previous < next as u8
    }

    pub fn is_running(&self) -> bool {
        self.current() == LifecycleState::Running
    }
}

#[derive(Clone, Copy, Debug)]
pub struct HeartbeatConfig {
    pub interval_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_INTERVAL_MS,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum HeartbeatError {
    InvalidInterval { provided_ms: u64 },
}

impl fmt::Display for HeartbeatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidInterval { provided_ms } => write!(
                f,
                "heartbeat interval must be between {MIN_INTERVAL_MS}ms and {MAX_INTERVAL_MS}ms, got {provided_ms}ms"
            ),
        }
    }
}

impl std::error::Error for HeartbeatError {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeartbeatExit {
    /// The shutdown token was set by someone else.
    Shutdown,
    /// The broker answered a beat with `terminate`.
    Terminated,
}

pub struct Heartbeat {
    pub initiated_at: DateTime<Utc>,
    interval_ms: u64,
    context: RuntimeContext,
}

impl Heartbeat {
    pub fn new(context: RuntimeContext, config: HeartbeatConfig) -> Result<Self, HeartbeatError> {
        Self::validate_interval(config.interval_ms)?;

        Ok(Self {
            initiated_at: Utc::now(),
            interval_ms: config.interval_ms,
            context,
        })
    }

    pub fn from_app_config(
        context: RuntimeContext,
        app_config: &AppConfig,
    ) -> Result<Self, HeartbeatError> {
        Self::new(
            context,
            HeartbeatConfig {
                interval_ms: app_config.heartbeat.interval_ms,
            },
        )
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn initial_metadata_payload(&self) -> Value {
        json!({
            "initiated_at": self.initiated_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            "interval_ms": self.interval_ms,
            "state": self.context.lifecycle.current().as_str(),
        })
    }

    /// Sends one `BEAT` reporting the current lifecycle state and applies the
    /// broker's answer.
    pub fn beat_once(&self) -> Result<LifecycleState, ClientError> {
        let reported = self.context.lifecycle.current();
        let signal = self
            .context
            .pool
            .with_connection(|client| client.beat(reported.beat_state()))?;
        Ok(self.apply_signal(signal))
    }

    pub fn apply_signal(&self, signal: BeatSignal) -> LifecycleState {
        let logger = &self.context.logger;
        match signal {
            BeatSignal::Continue => {}
            BeatSignal::Quiet => {
                if self.context.lifecycle.advance_to(LifecycleState::Quiet) {
                    logger.warn(
                        Some(LOG_CONTEXT),
                        "Broker requested quiet, workers stop fetching new jobs",
                    );
                }
            }
            BeatSignal::Terminate => {
                self.context.lifecycle.advance_to(LifecycleState::Terminating);
                if self.context.shutdown.trigger() {
                    logger.warn(
                        Some(LOG_CONTEXT),
                        "Broker requested termination, shutdown triggered",
                    );
                }
            }
        }
        self.context.lifecycle.current()
    }

    pub fn run(&self) -> HeartbeatExit {
        self.context.logger.log(
            LogLevel::Info,
            Some(LOG_CONTEXT),
            "Heartbeat started",
            Some(self.initial_metadata_payload()),
        );

        let exit = loop {
            if self.context.shutdown.is_triggered() {
                break HeartbeatExit::Shutdown;
            }

            match self.beat_once() {
                Ok(LifecycleState::Terminating) => break HeartbeatExit::Terminated,
                Ok(_) => {}
                Err(error) => self.context.logger.log(
                    LogLevel::Warn,
                    Some(LOG_CONTEXT),
                    "Heartbeat failed, retrying next interval",
                    Some(json!({
                        "error": error.to_string(),
                        "connection_fault": error.is_connection_fault(),
                    })),
                ),
            }

            if !self.context.shutdown.wait_timeout(self.interval()) {
                break HeartbeatExit::Shutdown;
            }
        };

        self.context.logger.info(
            Some(LOG_CONTEXT),
            &format!("Heartbeat stopped ({exit:?})"),
        );
        exit
    }

    fn validate_interval(interval_ms: u64) -> Result<(), HeartbeatError> {
        if (MIN_INTERVAL_MS..=MAX_INTERVAL_MS).contains(&interval_ms) {
            Ok(())
        } else {
            Err(HeartbeatError::InvalidInterval {
                provided_ms: interval_ms,
            })
        }
    }
}

impl fmt::Debug for Heartbeat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heartbeat")
            .field("initiated_at", &self.initiated_at)
            .field("interval_ms", &self.interval_ms)
            .field("state", &self.context.lifecycle.current())
            .finish()
    }
}
