use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{self, BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::client::ConnectOptions;
use crate::logging::{LogLevel, LogSink, Logger, LoggerConfig};
use crate::pools::ConnectionPool;
use crate::runtime::RuntimeContext;
use crate::shutdown::ShutdownToken;
use crate::wire::handshake::hash_password;

const TEST_SALT: &str = "5c0ffee5";
const TEST_ITERATIONS: u32 = 3;

#[derive(Default)]
pub struct MemorySink {
    lines: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().expect("memory sink mutex poisoned").clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|line| line.contains(needle))
    }
}

impl LogSink for MemorySink {
    fn write_line(&self, line: &str) {
        self.lines
            .lock()
            .expect("memory sink mutex poisoned")
            .push(line.to_owned());
    }
}

/// Context wired to `broker` with a fresh shutdown token and a silent logger.
pub fn runtime_context(broker: &FakeBroker, capacity: usize) -> RuntimeContext {
    runtime_context_with_logger(broker, capacity, Arc::new(Logger::silent()))
}

/// Same as [`runtime_context`] but logging at debug level into the returned sink.
pub fn logged_runtime_context(
    broker: &FakeBroker,
    capacity: usize,
) -> (RuntimeContext, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::default());
    let logger = Logger::with_sink(
        LoggerConfig {
            min_level: LogLevel::Debug,
            human_friendly: false,
        },
        sink.clone(),
    );
    (
        runtime_context_with_logger(broker, capacity, Arc::new(logger)),
        sink,
    )
}

fn runtime_context_with_logger(
    broker: &FakeBroker,
    capacity: usize,
    logger: Arc<Logger>,
) -> RuntimeContext {
    let pool = ConnectionPool::new(capacity, broker.options(), Arc::clone(&logger))
        .expect("test pool should be created");
    RuntimeContext::new(Arc::new(pool), ShutdownToken::new(), logger)
}

#[derive(Clone, Debug)]
pub enum BeatReply {
    Ok,
    Quiet,
    Terminate,
    Error(String),
    Drop,
}

#[derive(Default)]
struct BrokerState {
    password: Option<String>,
    queues: HashMap<String, VecDeque<Value>>,
    scheduled: Vec<Value>,
    reserved: HashMap<String, Value>,
    known_jids: HashSet<String>,
    acked: Vec<String>,
    failures: Vec<Value>,
    beats: Vec<Value>,
    beat_replies: VecDeque<BeatReply>,
    hellos: Vec<Value>,
    commands: Vec<String>,
    drop_next: HashSet<String>,
    delay_next: HashMap<String, Duration>,
    paused: HashSet<String>,
    accepted: usize,
}

/// In-process broker speaking the wire protocol over loopback TCP.
pub struct FakeBroker {
    addr: SocketAddr,
    state: Arc<Mutex<BrokerState>>,
    stop: Arc<AtomicBool>,
    acceptor: Option<JoinHandle<()>>,
}

impl FakeBroker {
    pub fn start() -> Self {
        Self::launch(None)
    }

    pub fn with_password(password: &str) -> Self {
        Self::launch(Some(password.to_owned()))
    }

    pub fn unused_address() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").expect("ephemeral bind should work");
        let addr = listener.local_addr().expect("local addr should exist");
        drop(listener);
        addr.to_string()
    }

    fn launch(password: Option<String>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("fake broker should bind");
        listener
            .set_nonblocking(true)
            .expect("fake broker listener should be non-blocking");
        let addr = listener.local_addr().expect("fake broker addr should exist");

        let state = Arc::new(Mutex::new(BrokerState {
            password,
            ..BrokerState::default()
        }));
        let stop = Arc::new(AtomicBool::new(false));

        let acceptor = {
            let state = Arc::clone(&state);
            let stop = Arc::clone(&stop);
            thread::spawn(move || accept_loop(listener, state, stop))
        };

        Self {
            addr,
            state,
            stop,
            acceptor: Some(acceptor),
        }
    }

    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    pub fn options(&self) -> ConnectOptions {
        ConnectOptions::new(self.address()).with_timeout(Duration::from_secs(2))
    }

    pub fn push_beat_reply(&self, reply: BeatReply) {
        self.with_state(|state| state.beat_replies.push_back(reply));
    }

    /// The next command with this verb closes the connection without a reply.
    pub fn drop_next(&self, verb: &str) {
        self.with_state(|state| {
            state.drop_next.insert(verb.to_owned());
        });
    }

    /// The next command with this verb is handled at once but its reply is
    /// held back for `delay`, like a broker blocking on an empty queue.
    pub fn delay_next(&self, verb: &str, delay: Duration) {
        self.with_state(|state| {
            state.delay_next.insert(verb.to_owned(), delay);
        });
    }

    pub fn enqueue(&self, job: Value) {
        self.with_state(|state| enqueue_job(state, job));
    }

    pub fn acked(&self) -> Vec<String> {
        self.with_state(|state| state.acked.clone())
    }

    pub fn failures(&self) -> Vec<Value> {
        self.with_state(|state| state.failures.clone())
    }

    pub fn beats(&self) -> Vec<Value> {
        self.with_state(|state| state.beats.clone())
    }

    pub fn hellos(&self) -> Vec<Value> {
        self.with_state(|state| state.hellos.clone())
    }

    pub fn commands(&self) -> Vec<String> {
        self.with_state(|state| state.commands.clone())
    }

    pub fn reserved_jids(&self) -> Vec<String> {
        self.with_state(|state| state.reserved.keys().cloned().collect())
    }

    pub fn queued_count(&self, queue: &str) -> usize {
        self.with_state(|state| state.queues.get(queue).map_or(0, VecDeque::len))
    }

    pub fn is_paused(&self, queue: &str) -> bool {
        self.with_state(|state| state.paused.contains(queue))
    }

    pub fn scheduled_count(&self) -> usize {
        self.with_state(|state| state.scheduled.len())
    }

    pub fn accepted_connections(&self) -> usize {
        self.with_state(|state| state.accepted)
    }

    pub fn wait_for_command(&self, verb: &str) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if self
                .commands()
                .iter()
                .any(|command| command.split(' ').next() == Some(verb))
            {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut BrokerState) -> T) -> T {
        let mut state = self.state.lock().expect("fake broker state poisoned");
        f(&mut state)
    }
}

impl Drop for FakeBroker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.acceptor.take() {
            let _ = handle.join();
        }
    }
}

fn accept_loop(listener: TcpListener, state: Arc<Mutex<BrokerState>>, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                let state = Arc::clone(&state);
                let stop = Arc::clone(&stop);
                thread::spawn(move || {
                    let _ = serve_connection(stream, state, stop);
                });
            }
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(2));
            }
            Err(_) => return,
        }
    }
}

fn serve_connection(
    stream: TcpStream,
    state: Arc<Mutex<BrokerState>>,
    stop: Arc<AtomicBool>,
) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(Duration::from_millis(50)))?;
    let mut writer = stream.try_clone()?;
    let mut reader = BufReader::new(stream);

    let password = {
        let mut guard = state.lock().expect("fake broker state poisoned");
        guard.accepted += 1;
        guard.password.clone()
    };
    match password {
        Some(_) => write!(
            writer,
            "+HI {{\"v\":2,\"s\":\"{TEST_SALT}\",\"i\":{TEST_ITERATIONS}}}\r\n"
        )?,
        None => writer.write_all(b"+HI {\"v\":2}\r\n")?,
    }

    let Some(hello) = next_line(&mut reader, &stop)? else {
        return Ok(());
    };
    let Some(body) = hello.strip_prefix("HELLO ") else {
        writer.write_all(b"-ERR expected HELLO\r\n")?;
        return Ok(());
    };
    let client_data: Value = serde_json::from_str(body).unwrap_or(Value::Null);
    if let Some(password) = password {
        let expected = hash_password(&password, TEST_SALT, TEST_ITERATIONS);
        if client_data["pwdhash"].as_str() != Some(expected.as_str()) {
            writer.write_all(b"-ERR Invalid password\r\n")?;
            return Ok(());
        }
    }
    state
        .lock()
        .expect("fake broker state poisoned")
        .hellos
        .push(client_data);
    writer.write_all(b"+OK\r\n")?;

    while let Some(line) = next_line(&mut reader, &stop)? {
        let (verb, rest) = line.split_once(' ').unwrap_or((line.as_str(), ""));
        let (reply, delay) = {
            let mut guard = state.lock().expect("fake broker state poisoned");
            guard.commands.push(line.clone());
            if guard.drop_next.remove(verb) {
                return Ok(());
            }
            let delay = guard.delay_next.remove(verb);
            (handle_command(&mut guard, verb, rest), delay)
        };
        if let Some(delay) = delay {
            thread::sleep(delay);
        }

        match reply {
            Some(bytes) => writer.write_all(&bytes)?,
            None => return Ok(()),
        }
    }

    Ok(())
}

fn next_line(reader: &mut BufReader<TcpStream>, stop: &AtomicBool) -> io::Result<Option<String>> {
    let mut line = String::new();
    loop {
        match reader.read_line(&mut line) {
            Ok(0) => return Ok(None),
            Ok(_) if line.ends_with('\n') => {
                let trimmed = line.trim_end_matches(['\r', '\n']).to_owned();
                return Ok(Some(trimmed));
            }
            Ok(_) => {}
            Err(error)
                if matches!(
                    error.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                if stop.load(Ordering::SeqCst) {
                    return Ok(None);
                }
            }
            Err(error) => return Err(error),
        }
    }
}

fn handle_command(state: &mut BrokerState, verb: &str, rest: &str) -> Option<Vec<u8>> {
    let reply = match verb {
        "END" => return None,
        "PUSH" => push(state, rest),
        "PUSHB" => push_bulk(state, rest),
        "QUEUE" => queue(state, rest),
        "FETCH" => fetch(state, rest),
        "ACK" => ack(state, rest),
        "FAIL" => fail(state, rest),
        "BEAT" => return beat(state, rest),
        "INFO" => info(state),
        "FLUSH" => {
            state.queues.clear();
            state.scheduled.clear();
            ok()
        }
        other => error(&format!("ERR Unknown command {other}")),
    };
    Some(reply)
}

fn push(state: &mut BrokerState, rest: &str) -> Vec<u8> {
    let Ok(job) = serde_json::from_str::<Value>(rest) else {
        return error("ERR Invalid job payload");
    };
    let Some(jid) = job["jid"].as_str().map(str::to_owned) else {
        return error("ERR All jobs must have a jid");
    };
    if job["custom"]["unique_for"].is_number() && state.known_jids.contains(&jid) {
        return error("NOTUNIQUE Job not unique");
    }
    state.known_jids.insert(jid);

    let scheduled_later = job["at"]
        .as_str()
        .and_then(|at| DateTime::parse_from_rfc3339(at).ok())
        .is_some_and(|at| at.with_timezone(&Utc) > Utc::now());
    if scheduled_later {
        state.scheduled.push(job);
    } else {
        enqueue_job(state, job);
    }
    ok()
}

fn push_bulk(state: &mut BrokerState, rest: &str) -> Vec<u8> {
    let Ok(jobs) = serde_json::from_str::<Vec<Value>>(rest) else {
        return error("ERR Invalid PUSHB payload");
    };
    let mut refused = serde_json::Map::new();
    for job in jobs {
        let jid = job["jid"].as_str().unwrap_or_default().to_owned();
        if job["jobtype"].as_str().map_or(true, str::is_empty) {
            refused.insert(jid, json!("jobs must have a jobtype parameter"));
            continue;
        }
        let reply = push(state, &job.to_string());
        if reply != ok() {
            let message = String::from_utf8_lossy(&reply[1..]).trim_end().to_owned();
            refused.insert(jid, Value::String(message));
        }
    }
    bulk(Value::Object(refused).to_string().as_bytes())
}

fn queue(state: &mut BrokerState, rest: &str) -> Vec<u8> {
    let mut parts = rest.split_whitespace();
    let subcommand = parts.next().unwrap_or_default();
    let mut names: Vec<String> = parts.map(str::to_owned).collect();
    if names.iter().any(|name| name == "*") {
        names = state.queues.keys().cloned().collect();
    }

    match subcommand {
        "PAUSE" => state.paused.extend(names),
        "RESUME" => {
            for name in &names {
                state.paused.remove(name);
            }
        }
        "REMOVE" => {
            for name in &names {
                state.queues.remove(name);
                state.paused.remove(name);
            }
        }
        _ => return error("ERR No such QUEUE subcommand"),
    }
    ok()
}

fn enqueue_job(state: &mut BrokerState, job: Value) {
    let queue = job["queue"].as_str().unwrap_or("default").to_owned();
    state.queues.entry(queue).or_default().push_back(job);
}

fn fetch(state: &mut BrokerState, rest: &str) -> Vec<u8> {
    for queue in rest.split_whitespace() {
        if state.paused.contains(queue) {
            continue;
        }
        let Some(job) = state.queues.get_mut(queue).and_then(VecDeque::pop_front) else {
            continue;
        };
        let jid = job["jid"].as_str().unwrap_or_default().to_owned();
        let payload = job.to_string();
        state.reserved.insert(jid, job);
        return bulk(payload.as_bytes());
    }
    b"$-1\r\n".to_vec()
}

fn ack(state: &mut BrokerState, rest: &str) -> Vec<u8> {
    let jid = serde_json::from_str::<Value>(rest)
        .ok()
        .and_then(|value| value["jid"].as_str().map(str::to_owned))
        .unwrap_or_default();
    if state.reserved.remove(&jid).is_none() {
        return error(&format!("ERR Unknown job {jid}"));
    }
    state.acked.push(jid);
    ok()
}

fn fail(state: &mut BrokerState, rest: &str) -> Vec<u8> {
    let Ok(report) = serde_json::from_str::<Value>(rest) else {
        return error("ERR Invalid FAIL payload");
    };
    let jid = report["jid"].as_str().unwrap_or_default().to_owned();
    if state.reserved.remove(&jid).is_none() {
        return error(&format!("ERR Unknown job {jid}"));
    }
    state.failures.push(report);
    ok()
}

fn beat(state: &mut BrokerState, rest: &str) -> Option<Vec<u8>> {
    state
        .beats
        .push(serde_json::from_str(rest).unwrap_or(Value::Null));
    let reply = match state.beat_replies.pop_front().unwrap_or(BeatReply::Ok) {
        BeatReply::Ok => ok(),
        BeatReply::Quiet => bulk(br#"{"state":"quiet"}"#),
        BeatReply::Terminate => bulk(br#"{"state":"terminate"}"#),
        BeatReply::Error(message) => error(&message),
        BeatReply::Drop => return None,
    };
    Some(reply)
}

fn info(state: &BrokerState) -> Vec<u8> {
    let enqueued: usize = state.queues.values().map(VecDeque::len).sum();
    let sizes: serde_json::Map<String, Value> = state
        .queues
        .iter()
        .map(|(name, jobs)| (name.clone(), json!(jobs.len())))
        .collect();
    let body = json!({
        "faktory": {
            "total_enqueued": enqueued,
            "total_queues": state.queues.len(),
            "queues": sizes,
        },
        "server": {"faktory_version": "fake"},
    });
    bulk(body.to_string().as_bytes())
}

fn ok() -> Vec<u8> {
    b"+OK\r\n".to_vec()
}

fn error(message: &str) -> Vec<u8> {
    format!("-{message}\r\n").into_bytes()
}

fn bulk(payload: &[u8]) -> Vec<u8> {
    let mut frame = format!("${}\r\n", payload.len()).into_bytes();
    frame.extend_from_slice(payload);
    frame.extend_from_slice(b"\r\n");
    frame
}
