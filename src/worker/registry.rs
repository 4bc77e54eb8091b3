use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::job::{FailureReport, Job};
use crate::runtime::panic_message;

pub const DEFAULT_ERRTYPE: &str = "HandlerError";
pub const UNKNOWN_JOB_TYPE_ERRTYPE: &str = "UnknownJobType";
pub const PANIC_ERRTYPE: &str = "Panic";

pub type JobHandler = Arc<dyn Fn(&Job) -> Result<(), HandlerError> + Send + Sync>;

/// Failure produced by a job handler, reported to the broker through `FAIL`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandlerError {
    pub message: String,
    pub errtype: String,
    pub backtrace: Vec<String>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            errtype: DEFAULT_ERRTYPE.to_owned(),
            backtrace: Vec::new(),
        }
    }

    pub fn with_errtype(mut self, errtype: impl Into<String>) -> Self {
        self.errtype = errtype.into();
        self
    }

    pub fn with_backtrace(mut self, backtrace: Vec<String>) -> Self {
        self.backtrace = backtrace;
        self
    }

    pub fn unknown_job_type(jobtype: &str) -> Self {
        Self::new(format!("no handler registered for job type '{jobtype}'"))
            .with_errtype(UNKNOWN_JOB_TYPE_ERRTYPE)
    }

    pub fn from_panic(message: impl Into<String>) -> Self {
        Self::new(message).with_errtype(PANIC_ERRTYPE)
    }

    /// Uses the error's type name as `errtype` and its source chain as the
    /// backtrace lines.
    pub fn from_error<E: std::error::Error>(error: &E) -> Self {
        let type_name = std::any::type_name::<E>();
        let errtype = type_name.rsplit("::").next().unwrap_or(type_name);

        let mut backtrace = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            backtrace.push(cause.to_string());
            source = cause.source();
        }

        Self::new(error.to_string())
            .with_errtype(errtype)
            .with_backtrace(backtrace)
    }

    pub fn into_report(self, jid: &str) -> FailureReport {
        FailureReport::new(jid, self.message, self.errtype, self.backtrace)
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.errtype, self.message)
    }
}

impl std::error::Error for HandlerError {}

/// Maps job types to handlers. Shared read-only by every worker.
#[derive(Clone, Default)]
pub struct JobRegistry {
    handlers: HashMap<String, JobHandler>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `jobtype`, returning the handler it replaced.
    pub fn register<F>(&mut self, jobtype: impl Into<String>, handler: F) -> Option<JobHandler>
    where
        F: Fn(&Job) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.handlers.insert(jobtype.into(), Arc::new(handler))
    }

    pub fn resolve(&self, jobtype: &str) -> Option<JobHandler> {
        self.handlers.get(jobtype).cloned()
    }

    pub fn jobtypes(&self) -> Vec<String> {
        let mut jobtypes: Vec<String> = self.handlers.keys().cloned().collect();
        jobtypes.sort();
        jobtypes
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Runs the handler for `job.jobtype` on the calling thread. A panicking
    /// handler becomes a `Panic` failure.
    pub fn execute(&self, job: &Job) -> Result<(), HandlerError> {
        let handler = self
            .resolve(&job.jobtype)
            .ok_or_else(|| HandlerError::unknown_job_type(&job.jobtype))?;

        match catch_unwind(AssertUnwindSafe(|| handler(job))) {
            Ok(result) => result,
            Err(payload) => Err(HandlerError::from_panic(panic_message(payload.as_ref()))),
        }
    }
}

impl fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRegistry")
            .field("jobtypes", &self.jobtypes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::fmt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use serde_json::json;

    use crate::job::Job;

    use super::{HandlerError, JobRegistry, PANIC_ERRTYPE, UNKNOWN_JOB_TYPE_ERRTYPE};

    #[derive(Debug)]
    struct LowLevel;

    impl fmt::Display for LowLevel {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "disk unplugged")
        }
    }

    impl std::error::Error for LowLevel {}

    #[derive(Debug)]
    struct ExportFailed(LowLevel);

    impl fmt::Display for ExportFailed {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "export failed")
        }
    }

    impl std::error::Error for ExportFailed {
        fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn executes_registered_handler_with_job() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = JobRegistry::new();
        {
            let calls = Arc::clone(&calls);
            registry.register("Echo", move |job| {
                assert_eq!(job.args, vec![json!("hello")]);
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        registry
            .execute(&Job::new("Echo", vec![json!("hello")]))
            .expect("echo should succeed");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.jobtypes(), vec!["Echo".to_owned()]);
    }

    #[test]
    fn register_returns_replaced_handler() {
        let mut registry = JobRegistry::new();
        assert!(registry.register("Echo", |_| Ok(())).is_none());
        assert!(registry.register("Echo", |_| Ok(())).is_some());
    }

    #[test]
    fn unknown_job_type_is_a_handler_failure() {
        let registry = JobRegistry::new();
        let error = registry
            .execute(&Job::new("Missing", Vec::new()))
            .expect_err("unknown jobtype should fail");

        assert_eq!(error.errtype, UNKNOWN_JOB_TYPE_ERRTYPE);
        assert!(error.message.contains("Missing"));
    }

    #[test]
    fn panicking_handler_is_converted_to_failure() {
        let mut registry = JobRegistry::new();
        registry.register("Explode", |_| panic!("kaboom"));

        let error = registry
            .execute(&Job::new("Explode", Vec::new()))
            .expect_err("panic should become a failure");

        assert_eq!(error.errtype, PANIC_ERRTYPE);
        assert_eq!(error.message, "kaboom");
    }

    #[test]
    fn from_error_collects_type_name_and_source_chain() {
        let error = HandlerError::from_error(&ExportFailed(LowLevel));

        assert_eq!(error.errtype, "ExportFailed");
        assert_eq!(error.message, "export failed");
        assert_eq!(error.backtrace, vec!["disk unplugged".to_owned()]);
    }

    #[test]
    fn into_report_keeps_all_failure_fields() {
        let report = HandlerError::new("bad input")
            .with_errtype("ArgumentError")
            .with_backtrace(vec!["frame 1".to_owned()])
            .into_report("jid-1");

        let encoded = serde_json::to_value(&report).expect("report should serialize");
        assert_eq!(
            encoded,
            json!({
                "jid": "jid-1",
                "message": "bad input",
                "errtype": "ArgumentError",
                "backtrace": ["frame 1"],
            })
        );
    }
}
