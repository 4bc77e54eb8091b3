use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use toml::Value;

use crate::client::{
    DEFAULT_ADDRESS, DEFAULT_READ_TIMEOUT_MS, DEFAULT_TIMEOUT_MS, MIN_READ_TIMEOUT_MS,
};
use crate::heartbeat::{DEFAULT_INTERVAL_MS, MAX_INTERVAL_MS, MIN_INTERVAL_MS};
use crate::job::DEFAULT_QUEUE;
use crate::logging::{LogLevel, LoggerConfig};
use crate::producer::{DEFAULT_INTERVAL_MS as DEFAULT_PRODUCER_INTERVAL_MS, DEFAULT_JOBTYPE};
use crate::worker::DEFAULT_POLL_INTERVAL_MS;

pub const CONFIG_PATH_ENV: &str = "HOPLINE_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "hopline.toml";
pub const BROKER_PROVIDER_ENV: &str = "FAKTORY_PROVIDER";
pub const DEFAULT_BROKER_URL_ENV: &str = "FAKTORY_URL";

const CONFIG_ARG: &str = "config";
const BROKER_URL_SCHEME: &str = "tcp://";

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub broker: BrokerConfig,
    pub pool: PoolConfig,
    pub heartbeat: HeartbeatConfig,
    pub worker: WorkerConfig,
    pub producer: ProducerConfig,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: String,
    pub human_friendly: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            human_friendly: false,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct BrokerConfig {
    pub address: String,
    /// Empty means no password is sent.
    pub password: String,
    /// TCP connect timeout.
    pub timeout_ms: u64,
    /// Per-command read/write timeout. Must outlast the broker's `FETCH` block.
    pub read_timeout_ms: u64,
    pub labels: Vec<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_owned(),
            password: String::new(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            labels: vec!["rust".to_owned()],
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    pub capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { capacity: 5 }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
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

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub queues: Vec<String>,
    pub poll_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            queues: vec![DEFAULT_QUEUE.to_owned()],
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ProducerConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    pub queue: String,
    pub jobtype: String,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: DEFAULT_PRODUCER_INTERVAL_MS,
            queue: DEFAULT_QUEUE.to_owned(),
            jobtype: DEFAULT_JOBTYPE.to_owned(),
        }
    }
}

/// Broker location parsed from a `tcp://[:password@]host:port` URL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub address: String,
    pub password: Option<String>,
}

impl AppConfig {
    /// Loads configuration from the process environment and `args`
    /// (command line without the program name).
    pub fn load_with_discovery(args: impl IntoIterator<Item = String>) -> Result<Self, ConfigError> {
        Self::load_with(args, |name| std::env::var(name).ok())
    }

    /// Layers built-in defaults, the config file, the broker URL variable and
    /// CLI overrides, in that order.
    pub fn load_with<F>(args: impl IntoIterator<Item = String>, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let cli = parse_cli_args(args)?;

        let mut root_value = Value::try_from(Self::default()).map_err(ConfigError::Serialize)?;

        if let Some(path) = discover_config_path(cli.config_path, &env) {
            let file_value = read_toml_file(&path)?;
            merge_values(&mut root_value, file_value);
        }

        let provider = env(BROKER_PROVIDER_ENV)
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BROKER_URL_ENV.to_owned());
        if let Some(url) = env(&provider).filter(|url| !url.trim().is_empty()) {
            let endpoint = parse_broker_url(&url)?;
            apply_override(&mut root_value, "broker.address", &endpoint.address)?;
            if let Some(password) = endpoint.password {
                apply_override(&mut root_value, "broker.password", &password)?;
            }
        }

        for (key_path, raw_value) in cli.overrides {
            apply_override(&mut root_value, &key_path, &raw_value)?;
        }

        let config: Self = root_value.try_into().map_err(ConfigError::Deserialize)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if LogLevel::from_config_value(&self.logging.level).is_none() {
            return Err(invalid(
                "logging.level",
                "allowed values: error, warn, info, debug, verbose",
            ));
        }
        if self.broker.address.trim().is_empty() {
            return Err(invalid("broker.address", "must not be empty"));
        }
        if self.broker.timeout_ms == 0 {
            return Err(invalid("broker.timeout_ms", "must be greater than zero"));
        }
        if self.broker.read_timeout_ms < MIN_READ_TIMEOUT_MS {
            return Err(invalid(
                "broker.read_timeout_ms",
                &format!("must be at least {MIN_READ_TIMEOUT_MS} to outlast a blocking FETCH"),
            ));
        }
        if self.pool.capacity == 0 {
            return Err(invalid("pool.capacity", "must be at least 1"));
        }
        if !(MIN_INTERVAL_MS..=MAX_INTERVAL_MS).contains(&self.heartbeat.interval_ms) {
            return Err(invalid(
                "heartbeat.interval_ms",
                &format!("must be between {MIN_INTERVAL_MS} and {MAX_INTERVAL_MS}"),
            ));
        }
        if self.worker.concurrency == 0 {
            return Err(invalid("worker.concurrency", "must be at least 1"));
        }
        if self.worker.queues.is_empty() {
            return Err(invalid("worker.queues", "must name at least one queue"));
        }
        if self.worker.queues.iter().any(|queue| queue.trim().is_empty()) {
            return Err(invalid("worker.queues", "queue names must not be blank"));
        }
        if self.worker.poll_interval_ms == 0 {
            return Err(invalid("worker.poll_interval_ms", "must be greater than zero"));
        }
        if self.producer.enabled {
            if self.producer.interval_ms == 0 {
                return Err(invalid("producer.interval_ms", "must be greater than zero"));
            }
            if self.producer.queue.trim().is_empty() {
                return Err(invalid("producer.queue", "must not be blank"));
            }
            if self.producer.jobtype.trim().is_empty() {
                return Err(invalid("producer.jobtype", "must not be blank"));
            }
        }
        Ok(())
    }

    pub fn logger_config(&self) -> LoggerConfig {
        LoggerConfig {
            min_level: LogLevel::from_config_value(&self.logging.level).unwrap_or(LogLevel::Info),
            human_friendly: self.logging.human_friendly,
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: String,
        source: std::io::Error,
    },
    TomlParse {
        path: String,
        source: toml::de::Error,
    },
    Serialize(toml::ser::Error),
    Deserialize(toml::de::Error),
    MissingValueForArg {
        key: String,
    },
    InvalidArgFormat {
        arg: String,
    },
    InvalidPath {
        key: String,
    },
    UnknownPath {
        key: String,
    },
    UnsupportedOverrideType {
        key: String,
    },
    InvalidValueForType {
        key: String,
        expected: &'static str,
        value: String,
    },
    InvalidValue {
        key: String,
        reason: String,
    },
    InvalidBrokerUrl {
        url: String,
        reason: &'static str,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "failed to read config file '{path}': {source}")
            }
            Self::TomlParse { path, source } => {
                write!(f, "failed to parse TOML config '{path}': {source}")
            }
            Self::Serialize(source) => write!(f, "failed to render default config: {source}"),
            Self::Deserialize(source) => write!(f, "failed to deserialize config: {source}"),
            Self::MissingValueForArg { key } => {
                write!(f, "missing value for CLI argument '--{key}'")
            }
            Self::InvalidArgFormat { arg } => write!(
                f,
                "invalid CLI argument format '{arg}', expected '--section.key value' or '--config path'"
            ),
            Self::InvalidPath { key } => write!(f, "invalid override key path '{key}'"),
            Self::UnknownPath { key } => write!(f, "unknown override key path '{key}'"),
            Self::UnsupportedOverrideType { key } => {
                write!(f, "override not supported for complex TOML type at '{key}'")
            }
            Self::InvalidValueForType {
                key,
                expected,
                value,
            } => write!(
                f,
                "invalid value '{value}' for '{key}', expected type {expected}"
            ),
            Self::InvalidValue { key, reason } => write!(f, "invalid value for '{key}': {reason}"),
            Self::InvalidBrokerUrl { url, reason } => {
                write!(f, "invalid broker URL '{url}': {reason}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

fn invalid(key: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_owned(),
        reason: reason.to_owned(),
    }
}

/// Parses `tcp://[:password@]host:port`.
pub fn parse_broker_url(url: &str) -> Result<BrokerEndpoint, ConfigError> {
    let invalid_url = |reason| ConfigError::InvalidBrokerUrl {
        url: url.to_owned(),
        reason,
    };

    let rest = url
        .trim()
        .strip_prefix(BROKER_URL_SCHEME)
        .ok_or_else(|| invalid_url("expected scheme 'tcp://'"))?;
    let rest = rest.trim_end_matches('/');

    let (password, host_port) = match rest.rsplit_once('@') {
        Some((userinfo, host_port)) => {
            let password = userinfo.split_once(':').map_or(userinfo, |(_, pwd)| pwd);
            (Some(password.to_owned()).filter(|pwd| !pwd.is_empty()), host_port)
        }
        None => (None, rest),
    };

    let (host, port) = host_port
        .rsplit_once(':')
        .ok_or_else(|| invalid_url("expected host:port"))?;
    if host.is_empty() {
        return Err(invalid_url("host must not be empty"));
    }
    port.parse::<u16>()
        .map_err(|_| invalid_url("port must be a number between 0 and 65535"))?;

    Ok(BrokerEndpoint {
        address: host_port.to_owned(),
        password,
    })
}

#[derive(Debug, Default)]
struct CliArgs {
    config_path: Option<PathBuf>,
    overrides: Vec<(String, String)>,
}

fn parse_cli_args(args: impl IntoIterator<Item = String>) -> Result<CliArgs, ConfigError> {
    let mut parsed = CliArgs::default();
    let mut iter = args.into_iter();

    while let Some(arg) = iter.next() {
        let Some(stripped) = arg.strip_prefix("--") else {
            return Err(ConfigError::InvalidArgFormat { arg });
        };

        if stripped.is_empty() {
            return Err(ConfigError::InvalidArgFormat { arg });
        }

        let value = iter.next().ok_or_else(|| ConfigError::MissingValueForArg {
            key: stripped.to_owned(),
        })?;

        if stripped == CONFIG_ARG {
            parsed.config_path = Some(PathBuf::from(value));
        } else {
            parsed.overrides.push((stripped.to_owned(), value));
        }
    }

    Ok(parsed)
}

fn discover_config_path<F>(explicit: Option<PathBuf>, env: &F) -> Option<PathBuf>
where
    F: Fn(&str) -> Option<String>,
{
    if explicit.is_some() {
        return explicit;
    }
    if let Some(path) = env(CONFIG_PATH_ENV).filter(|path| !path.trim().is_empty()) {
        return Some(PathBuf::from(path));
    }
    let fallback = PathBuf::from(DEFAULT_CONFIG_FILE);
    fallback.is_file().then_some(fallback)
}

fn read_toml_file(path: &Path) -> Result<Value, ConfigError> {
    let display_path = path.to_string_lossy().to_string();
    let toml_content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: display_path.clone(),
        source,
    })?;

    toml::from_str::<toml::Table>(&toml_content)
        .map(Value::Table)
        .map_err(|source| ConfigError::TomlParse {
            path: display_path,
            source,
        })
}

/// Tables merge key by key; any other value in `overlay` replaces the base.
fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Table(base_table), Value::Table(overlay_table)) => {
            for (key, overlay_value) in overlay_table {
                match base_table.get_mut(&key) {
                    Some(base_value) => merge_values(base_value, overlay_value),
                    None => {
                        base_table.insert(key, overlay_value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn apply_override(root: &mut Value, key_path: &str, raw_value: &str) -> Result<(), ConfigError> {
    let parts: Vec<&str> = key_path.split('.').collect();
    if parts.len() < 2 || parts.iter().any(|part| part.is_empty()) {
        return Err(ConfigError::InvalidPath {
            key: key_path.to_owned(),
        });
    }

    let unknown = || ConfigError::UnknownPath {
        key: key_path.to_owned(),
    };

    let mut current = root;
    for section in &parts[..parts.len() - 1] {
        current = current
            .as_table_mut()
            .ok_or_else(unknown)?
            .get_mut(*section)
            .ok_or_else(unknown)?;
    }

    let final_key = parts[parts.len() - 1];
    let current_value = current
        .as_table_mut()
        .ok_or_else(unknown)?
        .get_mut(final_key)
        .ok_or_else(unknown)?;

    *current_value = parse_value_using_current_type(key_path, raw_value, current_value)?;
    Ok(())
}

fn parse_value_using_current_type(
    key_path: &str,
    raw_value: &str,
    current_value: &Value,
) -> Result<Value, ConfigError> {
    let type_error = |expected| ConfigError::InvalidValueForType {
        key: key_path.to_owned(),
        expected,
        value: raw_value.to_owned(),
    };

    match current_value {
        Value::String(_) => Ok(Value::String(raw_value.to_owned())),
        Value::Integer(_) => raw_value
            .parse::<i64>()
            .map(Value::Integer)
            .map_err(|_| type_error("integer")),
        Value::Float(_) => raw_value
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| type_error("float")),
        Value::Boolean(_) => raw_value
            .parse::<bool>()
            .map(Value::Boolean)
            .map_err(|_| type_error("boolean")),
        Value::Array(_) => Ok(Value::Array(
            raw_value
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(|item| Value::String(item.to_owned()))
                .collect(),
        )),
        Value::Datetime(_) | Value::Table(_) => Err(ConfigError::UnsupportedOverrideType {
            key: key_path.to_owned(),
        }),
    }
}
