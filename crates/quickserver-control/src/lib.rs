pub mod admission;
pub mod audit;
pub mod config;
pub mod error;
pub mod http;
pub mod ports;
pub mod probe;
pub mod reapers;
pub mod shutdown;
pub mod state;
pub mod store;
pub mod task_queue;
pub mod terminate;
pub mod webhook;

#[cfg(test)]
pub(crate) mod testing;
