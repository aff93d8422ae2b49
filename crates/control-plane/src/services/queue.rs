//! Job queue service.
//!
//! Wraps the durable queue table with wake notifications. Enqueue is
//! idempotent by job key; lease/extend/ack/nack verify worker ownership.

use chrono::Duration;

use crate::db::models::job::{Job, JobKey};
use crate::db::queries::job as queries;
use crate::db::DbPool;
use crate::error::AppResult;
use crate::nats::Notifier;

pub use crate::db::queries::job::EnqueueJob;

/// Service for queue operations.
#[derive(Clone)]
pub struct JobQueueService {
    pool: DbPool,
    notifier: Notifier,
}

impl JobQueueService {
    pub fn new(pool: DbPool, notifier: Notifier) -> Self {
        Self { pool, notifier }
    }

    /// Enqueue a job and wake workers on its tag. Duplicate keys no-op.
    pub async fn enqueue(&self, job: EnqueueJob) -> AppResult<bool> {
        let inserted = queries::enqueue(&self.pool, &job).await?;
        if inserted {
            tracing::debug!(
                key = %job.key,
                capability_tag = %job.capability_tag,
                tool = %job.tool_kind,
                "Job enqueued"
            );
            self.notifier
                .job_enqueued(&job.capability_tag, job.key.execution_id)
                .await;
        }
        Ok(inserted)
    }

    /// Lease the next job for a capability tag.
    pub async fn lease(
        &self,
        capability_tag: &str,
        worker: &str,
        seconds: u64,
    ) -> AppResult<Option<Job>> {
        queries::lease(
            &self.pool,
            capability_tag,
            worker,
            Duration::seconds(seconds as i64),
        )
        .await
    }

    /// Extend a held lease.
    pub async fn extend(&self, key: &JobKey, worker: &str, seconds: u64) -> AppResult<bool> {
        queries::extend(&self.pool, key, worker, Duration::seconds(seconds as i64)).await
    }

    /// Acknowledge and remove a job.
    pub async fn ack(&self, key: &JobKey, worker: &str) -> AppResult<bool> {
        queries::ack(&self.pool, key, worker).await
    }

    /// Return a job to the queue. Redelivery rides the workers' poll
    /// interval; no wake is published.
    pub async fn nack(&self, key: &JobKey, worker: &str) -> AppResult<bool> {
        queries::nack(&self.pool, key, worker).await
    }

    /// Jobs whose leases lapsed without an ack.
    pub async fn expired_leases(&self) -> AppResult<Vec<Job>> {
        queries::expired_leases(&self.pool).await
    }

    /// Remove a job regardless of lease state.
    pub async fn remove(&self, key: &JobKey) -> AppResult<bool> {
        queries::remove(&self.pool, key).await
    }

    /// Queued depth for a tag.
    pub async fn depth(&self, capability_tag: &str) -> AppResult<i64> {
        queries::depth(&self.pool, capability_tag).await
    }

    /// Drop all queued jobs of a cancelled execution.
    pub async fn revoke_queued(&self, execution_id: i64) -> AppResult<u64> {
        queries::revoke_queued(&self.pool, execution_id).await
    }
}
