pub mod client;
pub mod config;
pub mod heartbeat;
pub mod job;
pub mod logging;
pub mod pools;
pub mod producer;
pub mod runtime;
pub mod shutdown;
pub mod utils;
pub mod wire;
pub mod worker;

#[cfg(test)]
mod testing;
