use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use crate::client::ClientError;
use crate::config::AppConfig;
use crate::job::{format_timestamp, Job, DEFAULT_QUEUE};
use crate::logging::LogLevel;
use crate::runtime::RuntimeContext;

const LOG_CONTEXT: &str = "producer";

pub const DEFAULT_INTERVAL_MS: u64 = 2_000;
pub const DEFAULT_JOBTYPE: &str = "Echo";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProducerConfig {
    pub interval: Duration,
    pub queue: String,
    pub jobtype: String,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(DEFAULT_INTERVAL_MS),
            queue: DEFAULT_QUEUE.to_owned(),
            jobtype: DEFAULT_JOBTYPE.to_owned(),
        }
    }
}

impl ProducerConfig {
    pub fn from_app_config(app_config: &AppConfig) -> Self {
        let producer = &app_config.producer;
        Self {
            interval: Duration::from_millis(producer.interval_ms),
            queue: producer.queue.clone(),
            jobtype: producer.jobtype.clone(),
        }
    }
}

/// Periodically pushes generated jobs carrying `[sequence, timestamp]`.
pub struct ProducerLoop {
    context: RuntimeContext,
    config: ProducerConfig,
    sequence: AtomicU64,
}

impl ProducerLoop {
    pub fn new(context: RuntimeContext, config: ProducerConfig) -> Self {
        Self {
            context,
            config,
            sequence: AtomicU64::new(0),
        }
    }

    pub fn build_job(&self) -> Job {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        Job::new(
            self.config.jobtype.clone(),
            vec![json!(sequence), json!(format_timestamp(Utc::now()))],
        )
        .with_queue(self.config.queue.clone())
    }

    /// Pushes one job and returns its jid.
    pub fn run_once(&self) -> Result<String, ClientError> {
        let job = self.build_job();
        self.context.pool.with_connection(|client| client.push(&job))?;
        Ok(job.jid)
    }

    /// Runs until shutdown and returns how many pushes succeeded.
    pub fn run(&self) -> u64 {
        self.context.logger.log(
            LogLevel::Info,
            Some(LOG_CONTEXT),
            "Producer started",
            Some(json!({
                "queue": self.config.queue,
                "jobtype": self.config.jobtype,
                "interval_ms": self.config.interval.as_millis() as u64,
            })),
        );

        let mut pushed = 0;
        while !self.context.shutdown.is_triggered() {
            match self.run_once() {
                Ok(jid) => {
                    pushed += 1;
                    self.context
                        .logger
                        .debug(Some(LOG_CONTEXT), &format!("Pushed job {jid}"));
                }
                Err(error) => self.context.logger.log(
                    LogLevel::Warn,
                    Some(LOG_CONTEXT),
                    "Push failed",
                    Some(json!({ "error": error.to_string() })),
                ),
            }

            if !self.context.shutdown.wait_timeout(self.config.interval) {
                break;
            }
        }

        self.context.logger.info(
            Some(LOG_CONTEXT),
            &format!("Producer stopped after {pushed} push(es)"),
        );
        pushed
    }
}
