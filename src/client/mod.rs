use std::collections::HashMap;
use std::fmt;
use std::io::{self, BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::AppConfig;
use crate::job::{FailureReport, Job, JobError};
use crate::wire::codec::{encode_command, read_response, CodecError, Response};
use crate::wire::handshake::{build_client_data, parse_greeting, HandshakeError};

pub const DEFAULT_ADDRESS: &str = "localhost:7419";
pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 10_000;
/// Longest time the broker holds a `FETCH` open before answering nil.
pub const FETCH_BLOCK_MS: u64 = 2_000;
/// Reads shorter than this would give up on a reply to a blocked `FETCH`
/// after the broker already reserved the job.
pub const MIN_READ_TIMEOUT_MS: u64 = FETCH_BLOCK_MS + 1_000;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectOptions {
    pub address: String,
    pub password: Option<String>,
    /// TCP connect timeout.
    pub timeout: Duration,
    /// Read/write timeout for every command after connecting.
    pub read_timeout: Duration,
    pub wid: Option<String>,
    pub labels: Vec<String>,
}

impl ConnectOptions {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            password: None,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            read_timeout: Duration::from_millis(DEFAULT_READ_TIMEOUT_MS),
            wid: None,
            labels: Vec::new(),
        }
    }

    pub fn from_app_config(app_config: &AppConfig, wid: Option<String>) -> Self {
        let broker = &app_config.broker;
        Self {
            address: broker.address.clone(),
            password: Some(broker.password.clone()).filter(|value| !value.is_empty()),
            timeout: Duration::from_millis(broker.timeout_ms),
            read_timeout: Duration::from_millis(broker.read_timeout_ms),
            wid,
            labels: broker.labels.clone(),
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_wid(mut self, wid: impl Into<String>) -> Self {
        self.wid = Some(wid.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// The configured read timeout, raised to [`MIN_READ_TIMEOUT_MS`] when shorter.
    pub fn effective_read_timeout(&self) -> Duration {
        self.read_timeout
            .max(Duration::from_millis(MIN_READ_TIMEOUT_MS))
    }
}

#[derive(Debug)]
pub enum ClientError {
    Connection(io::Error),
    Framing(CodecError),
    Auth { message: String },
    Protocol { message: String },
    Serialization(serde_json::Error),
    InvalidRequest { reason: String },
    Closed,
}

impl ClientError {
    /// Transport and framing failures poison the connection; everything else
    /// leaves the byte stream aligned and the client reusable.
    pub fn is_connection_fault(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Framing(_) | Self::Closed)
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(source) => write!(f, "broker connection error: {source}"),
            Self::Framing(source) => write!(f, "broker framing error: {source}"),
            Self::Auth { message } => write!(f, "broker rejected handshake: {message}"),
            Self::Protocol { message } => write!(f, "broker error: {message}"),
            Self::Serialization(source) => write!(f, "payload serialization error: {source}"),
            Self::InvalidRequest { reason } => write!(f, "invalid request: {reason}"),
            Self::Closed => write!(f, "client connection is closed"),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Connection(source) => Some(source),
            Self::Framing(source) => Some(source),
            Self::Serialization(source) => Some(source),
            _ => None,
        }
    }
}

impl From<CodecError> for ClientError {
    fn from(value: CodecError) -> Self {
        match value {
            CodecError::Io(source) => Self::Connection(source),
            other => Self::Framing(other),
        }
    }
}

impl From<JobError> for ClientError {
    fn from(value: JobError) -> Self {
        Self::InvalidRequest {
            reason: value.to_string(),
        }
    }
}

impl From<HandshakeError> for ClientError {
    fn from(value: HandshakeError) -> Self {
        match value {
            HandshakeError::PasswordRequired => Self::Auth {
                message: value.to_string(),
            },
            other => Self::Framing(CodecError::UnexpectedResponse {
                expected: "HI",
                actual: other.to_string(),
            }),
        }
    }
}

/// Tri-state answer to `BEAT`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BeatSignal {
    Continue,
    Quiet,
    Terminate,
}

impl BeatSignal {
    pub fn from_state(state: &str) -> Option<Self> {
        match state {
            "" | "running" => Some(Self::Continue),
            "quiet" => Some(Self::Quiet),
            "terminate" => Some(Self::Terminate),
            _ => None,
        }
    }
}

/// Administrative `QUEUE` subcommands. `"*"` addresses every known queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueAction {
    Pause,
    Resume,
    Remove,
}

impl QueueAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pause => "PAUSE",
            Self::Resume => "RESUME",
            Self::Remove => "REMOVE",
        }
    }
}

#[derive(Deserialize)]
struct BeatReply {
    #[serde(default)]
    state: String,
}

/// One exclusive, blocking connection to the broker.
///
/// Commands are strictly request/response. After any transport or framing
/// failure the client is marked invalid and refuses further commands.
pub struct ProtocolClient {
    id: u64,
    address: String,
    peer_addr: SocketAddr,
    protocol_version: i64,
    authenticated: bool,
    wid: Option<String>,
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    valid: bool,
    closed: bool,
}

impl ProtocolClient {
    pub fn connect(options: &ConnectOptions) -> Result<Self, ClientError> {
        let stream = open_stream(&options.address, options.timeout)?;
        configure_stream(&stream, options.effective_read_timeout())
            .map_err(ClientError::Connection)?;
        let peer_addr = stream.peer_addr().map_err(ClientError::Connection)?;
        let writer = stream.try_clone().map_err(ClientError::Connection)?;
        let mut reader = BufReader::new(stream);

        let greeting = match read_response(&mut reader)? {
            Response::Simple(line) => parse_greeting(&line)?,
            Response::Error(message) => return Err(ClientError::Auth { message }),
            other => {
                return Err(ClientError::Framing(CodecError::UnexpectedResponse {
                    expected: "HI",
                    actual: describe(&other),
                }))
            }
        };

        let client_data = build_client_data(
            &greeting,
            options.password.as_deref(),
            options.wid.as_deref(),
            &options.labels,
        )?;
        let authenticated = client_data.pwdhash.is_some();

        let mut client = Self {
            id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
            address: options.address.clone(),
            peer_addr,
            protocol_version: greeting.version,
            authenticated,
            wid: client_data.wid.clone(),
            reader,
            writer,
            valid: true,
            closed: false,
        };

        let payload = serde_json::to_vec(&client_data).map_err(ClientError::Serialization)?;
        match client.round_trip("HELLO", &[], Some(&payload)) {
            Ok(response) => client.expect_ok("HELLO", response)?,
            Err(ClientError::Protocol { message }) => {
                client.valid = false;
                return Err(ClientError::Auth { message });
            }
            Err(error) => return Err(error),
        }

        Ok(client)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn protocol_version(&self) -> i64 {
        self.protocol_version
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn wid(&self) -> Option<&str> {
        self.wid.as_deref()
    }

    pub fn is_usable(&self) -> bool {
        self.valid && !self.closed
    }

    pub fn push(&mut self, job: &Job) -> Result<(), ClientError> {
        job.validate()?;
        let payload = serde_json::to_vec(job).map_err(ClientError::Serialization)?;
        let response = self.round_trip("PUSH", &[], Some(&payload))?;
        self.expect_ok("PUSH", response)
    }

    /// Pushes several jobs in one `PUSHB` round trip.
    ///
    /// Returns the jobs the broker refused, keyed by jid with the broker's
    /// reason. An empty map means every job was accepted.
    pub fn push_bulk(&mut self, jobs: &[Job]) -> Result<HashMap<String, String>, ClientError> {
        if jobs.is_empty() {
            return Ok(HashMap::new());
        }
        for job in jobs {
            job.validate()?;
        }
        let payload = serde_json::to_vec(jobs).map_err(ClientError::Serialization)?;

        match self.round_trip("PUSHB", &[], Some(&payload))? {
            Response::Bulk(None) => Ok(HashMap::new()),
            Response::Bulk(Some(bytes)) => {
                serde_json::from_slice(&bytes).map_err(ClientError::Serialization)
            }
            other => Err(self.unexpected("PUSHB results", &other)),
        }
    }

    /// Reserves the next ready job, preferring earlier queues.
    /// An empty result is `Ok(None)`, not an error.
    pub fn fetch<S: AsRef<str>>(&mut self, queues: &[S]) -> Result<Option<Job>, ClientError> {
        if queues.is_empty() {
            return Err(ClientError::InvalidRequest {
                reason: "fetch requires at least one queue".to_owned(),
            });
        }
        let queue_args = queues.iter().map(AsRef::as_ref).collect::<Vec<&str>>();

        match self.round_trip("FETCH", &queue_args, None)? {
            Response::Bulk(None) => Ok(None),
            Response::Bulk(Some(bytes)) if bytes.is_empty() => Ok(None),
            Response::Bulk(Some(bytes)) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(ClientError::Serialization),
            other => Err(self.unexpected("FETCH job", &other)),
        }
    }

    pub fn ack(&mut self, jid: &str) -> Result<(), ClientError> {
        let payload = serde_json::to_vec(&json!({ "jid": jid })).map_err(ClientError::Serialization)?;
        let response = self.round_trip("ACK", &[], Some(&payload))?;
        self.expect_ok("ACK", response)
    }

    pub fn fail(&mut self, report: &FailureReport) -> Result<(), ClientError> {
        let payload = serde_json::to_vec(report).map_err(ClientError::Serialization)?;
        let response = self.round_trip("FAIL", &[], Some(&payload))?;
        self.expect_ok("FAIL", response)
    }

    /// Sends a liveness beat, optionally reporting the local lifecycle state.
    pub fn beat(&mut self, current_state: Option<&str>) -> Result<BeatSignal, ClientError> {
        let mut body = json!({
            "wid": self.wid.clone().unwrap_or_default(),
            "rss_kb": resident_set_kb(),
        });
        if let Some(state) = current_state {
            body["current_state"] = Value::String(state.to_owned());
        }
        let payload = serde_json::to_vec(&body).map_err(ClientError::Serialization)?;

        match self.round_trip("BEAT", &[], Some(&payload))? {
            Response::Simple(text) if text == "OK" => Ok(BeatSignal::Continue),
            Response::Bulk(None) => Ok(BeatSignal::Continue),
            Response::Bulk(Some(bytes)) => {
                let reply: BeatReply =
                    serde_json::from_slice(&bytes).map_err(ClientError::Serialization)?;
                BeatSignal::from_state(&reply.state).ok_or_else(|| ClientError::Protocol {
                    message: format!("unknown heartbeat state '{}'", reply.state),
                })
            }
            other => Err(self.unexpected("BEAT", &other)),
        }
    }

    pub fn info(&mut self) -> Result<Value, ClientError> {
        match self.round_trip("INFO", &[], None)? {
            Response::Bulk(Some(bytes)) => {
                serde_json::from_slice(&bytes).map_err(ClientError::Serialization)
            }
            Response::Bulk(None) => Ok(Value::Null),
            other => Err(self.unexpected("INFO", &other)),
        }
    }

    /// Per-queue sizes from the `faktory.queues` section of `INFO`.
    pub fn queue_sizes(&mut self) -> Result<HashMap<String, u64>, ClientError> {
        let info = self.info()?;
        match info.pointer("/faktory/queues") {
            None | Some(Value::Null) => Ok(HashMap::new()),
            Some(queues) => {
                serde_json::from_value(queues.clone()).map_err(ClientError::Serialization)
            }
        }
    }

    pub fn flush(&mut self) -> Result<(), ClientError> {
        let response = self.round_trip("FLUSH", &[], None)?;
        self.expect_ok("FLUSH", response)
    }

    pub fn pause_queues<S: AsRef<str>>(&mut self, names: &[S]) -> Result<(), ClientError> {
        self.queue_command(QueueAction::Pause, names)
    }

    pub fn resume_queues<S: AsRef<str>>(&mut self, names: &[S]) -> Result<(), ClientError> {
        self.queue_command(QueueAction::Resume, names)
    }

    /// Drops the named queues and every job waiting in them.
    pub fn remove_queues<S: AsRef<str>>(&mut self, names: &[S]) -> Result<(), ClientError> {
        self.queue_command(QueueAction::Remove, names)
    }

    pub fn queue_command<S: AsRef<str>>(
        &mut self,
        action: QueueAction,
        names: &[S],
    ) -> Result<(), ClientError> {
        if names.is_empty() {
            return Err(ClientError::InvalidRequest {
                reason: format!("QUEUE {} requires at least one queue name", action.as_str()),
            });
        }
        let mut args: Vec<&str> = vec![action.as_str()];
        args.extend(names.iter().map(AsRef::as_ref));

        let response = self.round_trip("QUEUE", &args, None)?;
        self.expect_ok("QUEUE", response)
    }

    /// Sends `END` and closes the socket. Calling it again is a no-op.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if self.valid {
            if let Ok(frame) = encode_command("END", &[], None) {
                let _ = self.writer.write_all(&frame);
                let _ = self.writer.flush();
            }
        }
        self.valid = false;
        let _ = self.writer.shutdown(Shutdown::Both);
    }

    fn round_trip(
        &mut self,
        verb: &str,
        args: &[&str],
        payload: Option<&[u8]>,
    ) -> Result<Response, ClientError> {
        self.ensure_usable()?;
        let frame = encode_command(verb, args, payload).map_err(|error| {
            ClientError::InvalidRequest {
                reason: error.to_string(),
            }
        })?;

        if let Err(error) = self.writer.write_all(&frame).and_then(|()| self.writer.flush()) {
            self.valid = false;
            return Err(ClientError::Connection(error));
        }

        match read_response(&mut self.reader) {
            Ok(Response::Error(message)) => Err(ClientError::Protocol {
                message: strip_error_marker(&message),
            }),
            Ok(response) => Ok(response),
            Err(error) => {
                self.valid = false;
                Err(error.into())
            }
        }
    }

    fn expect_ok(&mut self, command: &'static str, response: Response) -> Result<(), ClientError> {
        match response {
            Response::Simple(text) if text == "OK" => Ok(()),
            other => Err(self.unexpected(command, &other)),
        }
    }

    fn unexpected(&mut self, expected: &'static str, response: &Response) -> ClientError {
        self.valid = false;
        ClientError::Framing(CodecError::UnexpectedResponse {
            expected,
            actual: describe(response),
        })
    }

    fn ensure_usable(&self) -> Result<(), ClientError> {
        if self.closed {
            return Err(ClientError::Closed);
        }
        if !self.valid {
            return Err(ClientError::Connection(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection was invalidated by an earlier failure",
            )));
        }
        Ok(())
    }
}

impl Drop for ProtocolClient {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for ProtocolClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolClient")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("protocol_version", &self.protocol_version)
            .field("valid", &self.valid)
            .field("closed", &self.closed)
            .finish()
    }
}

fn open_stream(address: &str, connect_timeout: Duration) -> Result<TcpStream, ClientError> {
    let addrs = address
        .to_socket_addrs()
        .map_err(ClientError::Connection)?
        .collect::<Vec<_>>();

    let mut last_error = io::Error::new(
        io::ErrorKind::AddrNotAvailable,
        format!("'{address}' did not resolve to any socket address"),
    );
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, connect_timeout) {
            Ok(stream) => return Ok(stream),
            Err(error) => last_error = error,
        }
    }

    Err(ClientError::Connection(last_error))
}

fn configure_stream(stream: &TcpStream, io_timeout: Duration) -> io::Result<()> {
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(io_timeout))?;
    stream.set_write_timeout(Some(io_timeout))
}

fn strip_error_marker(message: &str) -> String {
    message
        .strip_prefix("ERR ")
        .unwrap_or(message)
        .to_owned()
}

fn describe(response: &Response) -> String {
    match response {
        Response::Simple(text) => format!("simple '{text}'"),
        Response::Bulk(None) => "nil bulk".to_owned(),
        Response::Bulk(Some(bytes)) => format!("bulk of {} bytes", bytes.len()),
        Response::Integer(value) => format!("integer {value}"),
        Response::Error(message) => format!("error '{message}'"),
    }
}

#[cfg(target_os = "linux")]
fn resident_set_kb() -> u64 {
    std::fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|status| {
            status
                .lines()
                .find(|line| line.starts_with("VmRSS:"))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|value| value.parse().ok())
        })
        .unwrap_or(0)
}

#[cfg(not(target_os = "linux"))]
fn resident_set_kb() -> u64 {
    0
}
