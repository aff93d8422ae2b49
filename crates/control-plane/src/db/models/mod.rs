//! Database models for the execution plane.

pub mod catalog;
pub mod event;
pub mod job;
pub mod worker;

pub use catalog::CatalogEntry;
pub use event::{Event, EventKind, NewEvent};
pub use job::{Job, JobKey};
pub use worker::WorkerRecord;
