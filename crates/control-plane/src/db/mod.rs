//! Database module for the NoETL Control Plane server.
//!
//! Provides PostgreSQL connectivity, the schema bootstrap, models, and
//! queries. Every durable fact of the execution plane lives in the `noetl`
//! schema; the event table is the source of truth, the job and worker
//! tables are runtime coordination state.

pub mod models;
pub mod pool;
pub mod queries;
pub mod schema;

pub use pool::{create_pool, DbPool};
