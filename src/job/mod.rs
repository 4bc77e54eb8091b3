use std::fmt;

use chrono::{DateTime, Duration as TimeDelta, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub const DEFAULT_QUEUE: &str = "default";

pub const RETRY_DEFAULT: i64 = 25;
pub const RETRY_EPHEMERAL: i64 = 0;
pub const RETRY_DIRECT_TO_MORGUE: i64 = -1;

pub const CUSTOM_UNIQUE_FOR: &str = "unique_for";
pub const CUSTOM_UNIQUE_UNTIL: &str = "unique_until";
pub const CUSTOM_EXPIRES_AT: &str = "expires_at";

fn default_queue() -> String {
    DEFAULT_QUEUE.to_owned()
}

/// A unit of work as it travels over the wire.
///
/// The broker owns every state transition; a client only builds jobs, pushes
/// them, and receives reserved ones back from `FETCH`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub jid: String,
    #[serde(default = "default_queue")]
    pub queue: String,
    pub jobtype: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enqueued_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reserve_for: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backtrace: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
}

/// Failure history the broker attaches to retried jobs.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    #[serde(default)]
    pub retry_count: i64,
    #[serde(default, rename = "remaining")]
    pub retry_remaining: i64,
    #[serde(default)]
    pub failed_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errtype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backtrace: Option<Vec<String>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UniqueUntil {
    Success,
    Start,
}

impl UniqueUntil {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Start => "start",
        }
    }
}

impl Job {
    pub fn new(jobtype: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            jid: random_jid(),
            queue: default_queue(),
            jobtype: jobtype.into(),
            args,
            at: None,
            retry: Some(RETRY_DEFAULT),
            custom: None,
            created_at: Some(format_timestamp(Utc::now())),
            enqueued_at: None,
            reserve_for: None,
            backtrace: None,
            failure: None,
        }
    }

    pub fn with_jid(mut self, jid: impl Into<String>) -> Self {
        self.jid = jid.into();
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_retry(mut self, retry: i64) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_reserve_for(mut self, seconds: u64) -> Self {
        self.reserve_for = Some(seconds);
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.at = Some(format_timestamp(at));
        self
    }

    pub fn scheduled_in(self, delay: TimeDelta) -> Self {
        self.scheduled_at(Utc::now() + delay)
    }

    pub fn set_custom(&mut self, name: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.custom
            .get_or_insert_with(Map::new)
            .insert(name.into(), value.into());
        self
    }

    pub fn custom_value(&self, name: &str) -> Option<&Value> {
        self.custom.as_ref().and_then(|custom| custom.get(name))
    }

    pub fn unique_for(&mut self, seconds: u64) -> &mut Self {
        self.set_custom(CUSTOM_UNIQUE_FOR, seconds)
    }

    pub fn unique_until(&mut self, until: UniqueUntil) -> &mut Self {
        self.set_custom(CUSTOM_UNIQUE_UNTIL, until.as_str())
    }

    pub fn expires_at(&mut self, at: DateTime<Utc>) -> &mut Self {
        self.set_custom(CUSTOM_EXPIRES_AT, format_timestamp(at))
    }

    pub fn expires_in(&mut self, ttl: TimeDelta) -> &mut Self {
        self.expires_at(Utc::now() + ttl)
    }

    pub fn scheduled_for(&self) -> Option<DateTime<Utc>> {
        self.at
            .as_deref()
            .and_then(|at| DateTime::parse_from_rfc3339(at).ok())
            .map(|at| at.with_timezone(&Utc))
    }

    pub fn validate(&self) -> Result<(), JobError> {
        if self.jid.trim().is_empty() {
            return Err(JobError::MissingJid);
        }
        if self.jobtype.trim().is_empty() {
            return Err(JobError::MissingJobType {
                jid: self.jid.clone(),
            });
        }
        if self.queue.trim().is_empty() || self.queue.chars().any(char::is_whitespace) {
            return Err(JobError::InvalidQueue {
                queue: self.queue.clone(),
            });
        }
        if let Some(at) = self.at.as_deref() {
            if DateTime::parse_from_rfc3339(at).is_err() {
                return Err(JobError::InvalidSchedule { at: at.to_owned() });
            }
        }
        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum JobError {
    MissingJid,
    MissingJobType { jid: String },
    InvalidQueue { queue: String },
    InvalidSchedule { at: String },
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingJid => write!(f, "job must have a non-empty jid"),
            Self::MissingJobType { jid } => write!(f, "job {jid} must have a jobtype"),
            Self::InvalidQueue { queue } => write!(f, "invalid queue name '{queue}'"),
            Self::InvalidSchedule { at } => {
                write!(f, "'at' must be an RFC 3339 timestamp, got '{at}'")
            }
        }
    }
}

impl std::error::Error for JobError {}

/// Payload of the `FAIL` command. All four fields are always sent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReport {
    pub jid: String,
    pub message: String,
    pub errtype: String,
    pub backtrace: Vec<String>,
}

impl FailureReport {
    pub fn new(
        jid: impl Into<String>,
        message: impl Into<String>,
        errtype: impl Into<String>,
        backtrace: Vec<String>,
    ) -> Self {
        Self {
            jid: jid.into(),
            message: message.into(),
            errtype: errtype.into(),
            backtrace,
        }
    }
}

pub fn random_jid() -> String {
    Uuid::new_v4().simple().to_string()
}

pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}
