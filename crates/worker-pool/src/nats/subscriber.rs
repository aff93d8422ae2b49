//! Job wake-up subscriber.
//!
//! The control plane publishes on `noetl.jobs.<tag>` whenever a job is
//! enqueued. These are wake-ups only; the durable queue is leased over
//! HTTP, so a worker without NATS simply polls on its interval.

use anyhow::Result;
use futures::stream::{SelectAll, StreamExt};
use std::time::Duration;

/// Merged subscription over this worker's capability tags.
pub struct JobWakeSubscriber {
    streams: Option<SelectAll<async_nats::Subscriber>>,
}

impl JobWakeSubscriber {
    /// Subscribe to the wake subjects for each tag. `None` NATS URL yields
    /// a subscriber that always times out into the poll path.
    pub async fn connect(nats_url: Option<&str>, tags: &[String]) -> Result<Self> {
        let Some(url) = nats_url else {
            return Ok(Self { streams: None });
        };

        let client = async_nats::connect(url).await?;
        let mut streams = SelectAll::new();
        for tag in tags {
            let subject = format!("noetl.jobs.{}", tag);
            streams.push(client.subscribe(subject.clone()).await?);
            tracing::debug!(subject = %subject, "Subscribed to job wake subject");
        }

        tracing::info!(url = %url, tags = ?tags, "Connected to NATS for job wake-ups");
        Ok(Self {
            streams: Some(streams),
        })
    }

    /// Wait for a wake-up or the poll timeout, whichever comes first.
    pub async fn wait(&mut self, timeout: Duration) {
        match &mut self.streams {
            Some(streams) => {
                match tokio::time::timeout(timeout, streams.next()).await {
                    // Subscriptions ended (connection lost): degrade to the
                    // poll interval instead of spinning.
                    Ok(None) => tokio::time::sleep(timeout).await,
                    _ => {}
                }
            }
            None => tokio::time::sleep(timeout).await,
        }
    }
}
