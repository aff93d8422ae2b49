//! HTTP handlers for the NoETL Control Plane API.
//!
//! Organized by domain: catalog, executions, worker events, jobs, workers,
//! health.

pub mod catalog;
pub mod events;
pub mod executions;
pub mod health;
pub mod jobs;
pub mod workers;

pub use health::{api_health, health_check};
