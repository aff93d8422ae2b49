//! Shared application state.

use std::sync::Arc;

use crate::config::AppConfig;
use crate::db::DbPool;
use crate::nats::Notifier;
use crate::services::{
    CatalogService, EventService, ExecutionService, JobQueueService, WorkerRegistryService,
};

/// Shared state handed to every handler via Axum.
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool
    pub db: DbPool,

    /// Application configuration
    pub config: Arc<AppConfig>,

    /// Wake-up notifier (NATS-backed when configured)
    pub notifier: Notifier,

    /// Event log service
    pub events: EventService,

    /// Catalog service
    pub catalog: CatalogService,

    /// Job queue service
    pub queue: JobQueueService,

    /// Execution lifecycle service
    pub executions: ExecutionService,

    /// Worker registry service
    pub registry: WorkerRegistryService,

    /// Server start time for uptime reporting
    pub start_time: std::time::Instant,
}

impl AppState {
    /// Assemble the full service graph over one pool and notifier.
    pub fn new(db: DbPool, config: AppConfig, nats: Option<async_nats::Client>) -> Self {
        let config = Arc::new(config);
        let notifier = Notifier::new(nats);

        let events = EventService::new(db.clone(), notifier.clone());
        let catalog = CatalogService::new(db.clone());
        let queue = JobQueueService::new(db.clone(), notifier.clone());
        let executions = ExecutionService::new(
            db.clone(),
            events.clone(),
            catalog.clone(),
            queue.clone(),
        );
        let registry = WorkerRegistryService::new(db.clone());

        Self {
            db,
            config,
            notifier,
            events,
            catalog,
            queue,
            executions,
            registry,
            start_time: std::time::Instant::now(),
        }
    }

    /// Server uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
