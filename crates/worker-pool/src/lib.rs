//! NoETL Worker Pool
//!
//! A long-running process that leases jobs from the control plane,
//! executes tool adapters, streams progress, and reports terminal results
//! through the event log's idempotent publication path.

pub mod client;
pub mod config;
pub mod nats;
pub mod runner;
pub mod secrets;
pub mod worker;

pub use config::WorkerConfig;
pub use worker::Worker;
