pub mod registry;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crate::config::AppConfig;
use crate::job::Job;
use crate::logging::LogLevel;
use crate::runtime::RuntimeContext;
use crate::utils::timing::measure_execution;

pub use registry::{HandlerError, JobHandler, JobRegistry};

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Queue names in priority order.
    pub queues: Vec<String>,
    pub poll_interval: Duration,
}

impl WorkerConfig {
    pub fn new(queues: Vec<String>) -> Self {
        Self {
            queues,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        }
    }

    pub fn from_app_config(app_config: &AppConfig) -> Self {
        Self {
            queues: app_config.worker.queues.clone(),
            poll_interval: Duration::from_millis(app_config.worker.poll_interval_ms),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum WorkerError {
    EmptyQueueList,
    BlankQueueName,
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyQueueList => write!(f, "worker needs at least one queue to fetch from"),
            Self::BlankQueueName => write!(f, "worker queue names must not be blank"),
        }
    }
}

impl std::error::Error for WorkerError {}

/// What a single fetch/execute/report pass ended with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IterationOutcome {
    ShutdownRequested,
    Quiet,
    Idle,
    Acked { jid: String },
    Failed { jid: String },
    /// The job ran but neither ACK nor FAIL reached the broker.
    ReportFailed { jid: String },
    FetchFailed,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    pub acked: u64,
    pub failed: u64,
    pub report_errors: u64,
    pub fetch_errors: u64,
}

impl WorkerSummary {
    pub fn processed(&self) -> u64 {
        self.acked + self.failed + self.report_errors
    }

    fn record(&mut self, outcome: &IterationOutcome) {
        match outcome {
            IterationOutcome::Acked { .. } => self.acked += 1,
            IterationOutcome::Failed { .. } => self.failed += 1,
            IterationOutcome::ReportFailed { .. } => self.report_errors += 1,
            IterationOutcome::FetchFailed => self.fetch_errors += 1,
            IterationOutcome::ShutdownRequested
            | IterationOutcome::Quiet
            | IterationOutcome::Idle => {}
        }
    }
}

/// Sequential fetch/execute/report loop. Several may share one pool.
pub struct WorkerLoop {
    name: String,
    log_context: String,
    context: RuntimeContext,
    registry: Arc<JobRegistry>,
    config: WorkerConfig,
}

impl WorkerLoop {
    pub fn new(
        name: impl Into<String>,
        context: RuntimeContext,
        registry: Arc<JobRegistry>,
        config: WorkerConfig,
    ) -> Result<Self, WorkerError> {
        if config.queues.is_empty() {
            return Err(WorkerError::EmptyQueueList);
        }
        if config.queues.iter().any(|queue| queue.trim().is_empty()) {
            return Err(WorkerError::BlankQueueName);
        }

        let name = name.into();
        Ok(Self {
            log_context: format!("worker::{name}"),
            name,
            context,
            registry,
            config,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn run_once(&self) -> IterationOutcome {
        if self.context.shutdown.is_triggered() {
            return IterationOutcome::ShutdownRequested;
        }
        if !self.context.lifecycle.is_running() {
            return IterationOutcome::Quiet;
        }

        let queues = self.config.queues.as_slice();
        match self.context.pool.with_connection(|client| client.fetch(queues)) {
            Ok(Some(job)) => self.process(job),
            Ok(None) => IterationOutcome::Idle,
            Err(error) => {
                self.context.logger.log(
                    LogLevel::Warn,
                    Some(&self.log_context),
                    "Fetch failed",
                    Some(json!({
                        "queues": queues,
                        "error": error.to_string(),
                    })),
                );
                IterationOutcome::FetchFailed
            }
        }
    }

    pub fn run(&self) -> WorkerSummary {
        self.context.logger.log(
            LogLevel::Info,
            Some(&self.log_context),
            "Worker started",
            Some(json!({
                "queues": self.config.queues,
                "poll_interval_ms": self.config.poll_interval.as_millis() as u64,
                "jobtypes": self.registry.jobtypes(),
            })),
        );

        if self.registry.is_empty() {
            self.context.logger.warn(
                Some(&self.log_context),
                "No job handlers registered, every fetched job will be failed",
            );
        }

        let mut summary = WorkerSummary::default();
        loop {
            let outcome = self.run_once();
            summary.record(&outcome);

            match outcome {
                IterationOutcome::ShutdownRequested => break,
                IterationOutcome::Quiet | IterationOutcome::Idle | IterationOutcome::FetchFailed => {
                    if !self.context.shutdown.wait_timeout(self.config.poll_interval) {
                        break;
                    }
                }
                IterationOutcome::Acked { .. }
                | IterationOutcome::Failed { .. }
                | IterationOutcome::ReportFailed { .. } => {}
            }
        }

        self.context.logger.log(
            LogLevel::Info,
            Some(&self.log_context),
            "Worker stopped",
            Some(json!({
                "acked": summary.acked,
                "failed": summary.failed,
                "report_errors": summary.report_errors,
                "fetch_errors": summary.fetch_errors,
            })),
        );
        summary
    }

    fn process(&self, job: Job) -> IterationOutcome {
        let jid = job.jid.clone();
        let timed = measure_execution(
            &format!("job '{}' ({jid})", job.jobtype),
            Some(&self.log_context),
            &self.context.logger,
            || self.registry.execute(&job),
        );

        let elapsed_ms = timed.elapsed.as_millis() as u64;
        match timed.value {
            Ok(()) => match self.context.pool.with_connection(|client| client.ack(&jid)) {
                Ok(()) => IterationOutcome::Acked { jid },
                Err(error) => {
                    self.report_error("ACK", &jid, &error.to_string());
                    IterationOutcome::ReportFailed { jid }
                }
            },
            Err(handler_error) => {
                self.context.logger.log(
                    LogLevel::Warn,
                    Some(&self.log_context),
                    "Job failed",
                    Some(json!({
                        "jid": jid,
                        "jobtype": job.jobtype,
                        "errtype": handler_error.errtype,
                        "message": handler_error.message,
                        "elapsed_ms": elapsed_ms,
                    })),
                );
                let report = handler_error.into_report(&jid);
                match self.context.pool.with_connection(|client| client.fail(&report)) {
                    Ok(()) => IterationOutcome::Failed { jid },
                    Err(error) => {
                        self.report_error("FAIL", &jid, &error.to_string());
                        IterationOutcome::ReportFailed { jid }
                    }
                }
            }
        }
    }

    fn report_error(&self, command: &str, jid: &str, error: &str) {
        self.context.logger.log(
            LogLevel::Error,
            Some(&self.log_context),
            &format!("{command} did not reach the broker"),
            Some(json!({
                "jid": jid,
                "error": error,
            })),
        );
    }
}

impl fmt::Debug for WorkerLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerLoop")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("registry", &self.registry)
            .finish()
    }
}
