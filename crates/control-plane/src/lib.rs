//! NoETL Control Plane Library
//!
//! The execution plane of NoETL: the event log and its projector, the
//! playbook interpreter, the broker/scheduler, the durable job queue, and
//! the worker registry, fronted by an HTTP control API.
//!
//! ## Architecture
//!
//! All control-plane state is an append-only event log in PostgreSQL with
//! a compare-and-append guard on `(execution_id, seq)`. Brokers fold the
//! log into a projection, plan the next scheduling actions with a pure
//! interpreter, and apply them back through the same guard, so any number
//! of broker instances can run concurrently. NATS subjects are wake-up
//! channels only.
//!
//! ## Modules
//!
//! - [`config`]: environment-driven configuration
//! - [`db`]: pool, schema bootstrap, models, and queries
//! - [`engine`]: projector, interpreter, iterator planning, and the broker
//! - [`playbook`]: DSL types and validation
//! - [`template`]: Jinja-style expression resolution
//! - [`services`]: catalog, event log, executions, queue, worker registry
//! - [`handlers`]: HTTP route handlers

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod nats;
pub mod playbook;
pub mod sanitize;
pub mod services;
pub mod state;
pub mod template;

pub use error::{AppError, AppResult};
