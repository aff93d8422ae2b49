//! Change-notification publisher.
//!
//! Durability lives in Postgres; NATS subjects are wake-up channels only.
//! Every event append publishes on the executions subject so brokers react
//! immediately instead of waiting for the next tick, and every job enqueue
//! publishes on the tag subject so idle workers stop polling. Both sides
//! fall back to their poll intervals when NATS is absent.

use std::sync::Arc;
use tokio::sync::Notify;

/// Subject brokers subscribe to for execution changes.
pub const EXECUTIONS_SUBJECT: &str = "noetl.executions";

/// Subject prefix workers subscribe to per capability tag.
pub const JOBS_SUBJECT_PREFIX: &str = "noetl.jobs";

/// Wake-up notifier shared by handlers and the broker.
#[derive(Clone)]
pub struct Notifier {
    nats: Option<Arc<async_nats::Client>>,
    local: Arc<Notify>,
}

impl Notifier {
    /// Create a notifier over an optional NATS connection.
    pub fn new(nats: Option<async_nats::Client>) -> Self {
        Self {
            nats: nats.map(Arc::new),
            local: Arc::new(Notify::new()),
        }
    }

    /// Handle used by the in-process broker to wait for wake-ups.
    pub fn local_wake(&self) -> Arc<Notify> {
        self.local.clone()
    }

    /// Announce that an execution's log changed.
    pub async fn execution_changed(&self, execution_id: i64) {
        self.local.notify_one();

        if let Some(nats) = &self.nats {
            let payload = execution_id.to_string();
            if let Err(e) = nats.publish(EXECUTIONS_SUBJECT, payload.into()).await {
                tracing::warn!(execution_id, error = %e, "Execution wake publish failed");
            }
        }
    }

    /// Announce a new job for a capability tag.
    pub async fn job_enqueued(&self, capability_tag: &str, execution_id: i64) {
        if let Some(nats) = &self.nats {
            let subject = format!("{}.{}", JOBS_SUBJECT_PREFIX, capability_tag);
            let payload = execution_id.to_string();
            if let Err(e) = nats.publish(subject, payload.into()).await {
                tracing::warn!(
                    capability_tag,
                    execution_id,
                    error = %e,
                    "Job wake publish failed"
                );
            }
        }
    }

    /// Whether a NATS connection is attached.
    pub fn has_nats(&self) -> bool {
        self.nats.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_notifier_without_nats() {
        let notifier = Notifier::new(None);
        assert!(!notifier.has_nats());

        // Publishing without NATS still wakes the local broker.
        let wake = notifier.local_wake();
        notifier.execution_changed(42).await;
        tokio::time::timeout(std::time::Duration::from_millis(50), wake.notified())
            .await
            .expect("local wake should fire");
    }
}
