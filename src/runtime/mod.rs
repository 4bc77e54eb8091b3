use std::any::Any;
use std::fmt;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::heartbeat::Lifecycle;
use crate::logging::Logger;
use crate::pools::ConnectionPool;
use crate::shutdown::ShutdownToken;

const LOG_CONTEXT: &str = "runtime::supervisor";

/// Everything a loop needs, cloned into each thread.
#[derive(Clone, Debug)]
pub struct RuntimeContext {
    pub pool: Arc<ConnectionPool>,
    pub shutdown: ShutdownToken,
    pub lifecycle: Lifecycle,
    pub logger: Arc<Logger>,
}

impl RuntimeContext {
    pub fn new(pool: Arc<ConnectionPool>, shutdown: ShutdownToken, logger: Arc<Logger>) -> Self {
        Self {
            pool,
            shutdown,
            lifecycle: Lifecycle::new(),
            logger,
        }
    }
}

/// Process identity reported to the broker in `HELLO` and `BEAT`.
pub fn random_wid() -> String {
    let mut wid = Uuid::new_v4().simple().to_string();
    wid.truncate(16);
    wid
}

pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with non-string payload".to_owned()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Failed(String),
    Panicked(String),
}

#[derive(Clone, Debug)]
pub struct TaskReport {
    pub name: String,
    pub outcome: TaskOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl TaskReport {
    pub fn is_success(&self) -> bool {
        self.outcome == TaskOutcome::Completed
    }

    pub fn log_payload(&self) -> Value {
        let (outcome, detail) = match &self.outcome {
            TaskOutcome::Completed => ("completed", None),
            TaskOutcome::Failed(message) => ("failed", Some(message.as_str())),
            TaskOutcome::Panicked(message) => ("panicked", Some(message.as_str())),
        };
        json!({
            "task": self.name,
            "outcome": outcome,
            "detail": detail,
            "started_at": self.started_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            "finished_at": self.finished_at.to_rfc3339_opts(SecondsFormat::Millis, true),
        })
    }
}

#[derive(Debug)]
pub enum SupervisorError {
    Spawn { name: String, source: io::Error },
}

impl fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spawn { name, source } => {
                write!(f, "failed to spawn task thread '{name}': {source}")
            }
        }
    }
}

impl std::error::Error for SupervisorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Spawn { source, .. } => Some(source),
        }
    }
}

/// Runs named tasks on their own threads and collects how each one ended.
pub struct Supervisor {
    logger: Arc<Logger>,
    reports_tx: Sender<TaskReport>,
    reports_rx: Receiver<TaskReport>,
    handles: Vec<(String, JoinHandle<()>)>,
}

impl Supervisor {
    pub fn new(logger: Arc<Logger>) -> Self {
        let (reports_tx, reports_rx) = mpsc::channel();
        Self {
            logger,
            reports_tx,
            reports_rx,
            handles: Vec::new(),
        }
    }

    pub fn spawn<F, E>(&mut self, name: impl Into<String>, task: F) -> Result<(), SupervisorError>
    where
        F: FnOnce() -> Result<(), E> + Send + 'static,
        E: fmt::Display + 'static,
    {
        let name = name.into();
        let reports_tx = self.reports_tx.clone();
        let task_name = name.clone();

        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let started_at = Utc::now();
                let outcome = match catch_unwind(AssertUnwindSafe(task)) {
                    Ok(Ok(())) => TaskOutcome::Completed,
                    Ok(Err(error)) => TaskOutcome::Failed(error.to_string()),
                    Err(payload) => TaskOutcome::Panicked(panic_message(payload.as_ref())),
                };
                let _ = reports_tx.send(TaskReport {
                    name: task_name,
                    outcome,
                    started_at,
                    finished_at: Utc::now(),
                });
            })
            .map_err(|source| SupervisorError::Spawn {
                name: name.clone(),
                source,
            })?;

        self.logger
            .debug(Some(LOG_CONTEXT), &format!("Spawned task '{name}'"));
        self.handles.push((name, handle));
        Ok(())
    }

    pub fn task_count(&self) -> usize {
        self.handles.len()
    }

    /// Blocks until every task has finished and returns their reports in
    /// completion order.
    pub fn join_all(self) -> Vec<TaskReport> {
        let Self {
            logger,
            reports_tx,
            reports_rx,
            handles,
        } = self;
        drop(reports_tx);

        for (name, handle) in handles {
            if handle.join().is_err() {
                logger.error(
                    Some(LOG_CONTEXT),
                    &format!("task thread '{name}' could not be joined"),
                );
            }
        }

        reports_rx.into_iter().collect()
    }
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.handles.iter().map(|(name, _)| name.as_str()).collect();
        f.debug_struct("Supervisor").field("tasks", &names).finish()
    }
}
