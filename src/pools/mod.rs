use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use serde_json::json;

use crate::client::{ClientError, ConnectOptions, ProtocolClient};
use crate::logging::{LogLevel, Logger};

const LOG_CONTEXT: &str = "pools::connections";

pub type ClientFactory = Arc<dyn Fn() -> Result<ProtocolClient, ClientError> + Send + Sync>;

#[derive(Debug, PartialEq, Eq)]
pub enum PoolError {
    ZeroCapacity,
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroCapacity => write!(f, "connection pool capacity must be at least 1"),
        }
    }
}

impl std::error::Error for PoolError {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub total: usize,
    pub capacity: usize,
}

#[derive(Default)]
struct PoolState {
    idle: Vec<ProtocolClient>,
    total: usize,
    closed: bool,
}

/// Bounded, lazily-populated set of broker connections.
///
/// Callers borrow a client for the duration of one closure. Connection faults
/// discard the client; broker-reported errors are passed through untouched.
pub struct ConnectionPool {
    capacity: usize,
    factory: ClientFactory,
    state: Mutex<PoolState>,
    released: Condvar,
    logger: Arc<Logger>,
}

impl ConnectionPool {
    pub fn new(
        capacity: usize,
        options: ConnectOptions,
        logger: Arc<Logger>,
    ) -> Result<Self, PoolError> {
        let factory: ClientFactory = Arc::new(move || ProtocolClient::connect(&options));
        Self::with_factory(capacity, factory, logger)
    }

    pub fn with_factory(
        capacity: usize,
        factory: ClientFactory,
        logger: Arc<Logger>,
    ) -> Result<Self, PoolError> {
        if capacity == 0 {
            return Err(PoolError::ZeroCapacity);
        }

        Ok(Self {
            capacity,
            factory,
            state: Mutex::new(PoolState::default()),
            released: Condvar::new(),
            logger,
        })
    }

    pub fn with_connection<T, F>(&self, operation: F) -> Result<T, ClientError>
    where
        F: FnOnce(&mut ProtocolClient) -> Result<T, ClientError>,
    {
        let mut lease = Lease {
            pool: self,
            client: Some(self.checkout()?),
        };
        let client = lease.client.as_mut().ok_or(ClientError::Closed)?;

        let result = operation(client);
        let keep = match &result {
            Err(error) if error.is_connection_fault() => false,
            _ => client.is_usable(),
        };
        if let Some(client) = lease.client.take() {
            self.release(client, keep);
        }

        result
    }

    /// Dials one connection up front so startup fails fast on a bad broker.
    pub fn warm_up(&self) -> Result<(), ClientError> {
        self.with_connection(|_| Ok(()))
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock_state();
        PoolStats {
            idle: state.idle.len(),
            total: state.total,
            capacity: self.capacity,
        }
    }

    /// Ends idle connections and refuses new checkouts. Leased clients are
    /// discarded when they come back.
    pub fn close_all(&self) {
        let drained = {
            let mut state = self.lock_state();
            state.closed = true;
            let drained = std::mem::take(&mut state.idle);
            state.total -= drained.len();
            drained
        };
        self.released.notify_all();

        let count = drained.len();
        for mut client in drained {
            client.close();
        }
        self.logger.debug(
            Some(LOG_CONTEXT),
            &format!("connection pool closed, {count} idle connection(s) ended"),
        );
    }

    fn checkout(&self) -> Result<ProtocolClient, ClientError> {
        let mut state = self.lock_state();
        loop {
            if state.closed {
                return Err(ClientError::Closed);
            }

            if let Some(client) = state.idle.pop() {
                if client.is_usable() {
                    return Ok(client);
                }
                state.total -= 1;
                continue;
            }

            if state.total < self.capacity {
                state.total += 1;
                drop(state);
                return self.dial();
            }

            state = self
                .released
                .wait(state)
                .expect("connection pool lock poisoned");
        }
    }

    fn dial(&self) -> Result<ProtocolClient, ClientError> {
        match (self.factory)() {
            Ok(client) => {
                self.logger.log(
                    LogLevel::Debug,
                    Some(LOG_CONTEXT),
                    "Opened broker connection",
                    Some(json!({
                        "client_id": client.id(),
                        "address": client.address(),
                        "peer_addr": client.peer_addr().to_string(),
                    })),
                );
                Ok(client)
            }
            Err(error) => {
                self.lock_state().total -= 1;
                self.released.notify_one();
                Err(error)
            }
        }
    }

    fn release(&self, client: ProtocolClient, keep: bool) {
        let discarded = {
            let mut state = self.lock_state();
            if keep && !state.closed && client.is_usable() {
                state.idle.push(client);
                None
            } else {
                state.total -= 1;
                Some(client)
            }
        };
        self.released.notify_one();

        if let Some(mut client) = discarded {
            self.logger.log(
                LogLevel::Debug,
                Some(LOG_CONTEXT),
                "Discarded broker connection",
                Some(json!({
                    "client_id": client.id(),
                    "usable": client.is_usable(),
                })),
            );
            client.close();
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().expect("connection pool lock poisoned")
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("stats", &self.stats())
            .finish()
    }
}

/// Returns a leased client as discarded if the borrowing closure unwinds.
struct Lease<'a> {
    pool: &'a ConnectionPool,
    client: Option<ProtocolClient>,
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            self.pool.release(client, false);
        }
    }
}
