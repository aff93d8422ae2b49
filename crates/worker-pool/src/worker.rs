//! Worker lifecycle management.

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Semaphore;

use noetl_tools::tools::create_default_registry;

use crate::client::ControlPlaneClient;
use crate::config::WorkerConfig;
use crate::nats::JobWakeSubscriber;
use crate::runner::JobRunner;
use crate::secrets::SecretStore;

/// Worker pool: a fixed set of lease slots over the configured tags.
pub struct Worker {
    config: WorkerConfig,
    client: ControlPlaneClient,
    runner: Arc<JobRunner>,
    semaphore: Arc<Semaphore>,
}

impl Worker {
    /// Create a new worker.
    pub fn new(config: WorkerConfig) -> Self {
        let client = ControlPlaneClient::new(&config.server_url);
        let runner = Arc::new(JobRunner::new(
            client.clone(),
            Arc::new(create_default_registry()),
            SecretStore::from_env(),
            config.name.clone(),
            config.lease_seconds,
        ));
        let semaphore = Arc::new(Semaphore::new(config.max_concurrency));

        Self {
            config,
            client,
            runner,
            semaphore,
        }
    }

    /// Run the worker until shutdown.
    pub async fn run(&self) -> Result<()> {
        self.register().await?;
        let heartbeat_handle = self.start_heartbeat();

        let result = self.lease_loop().await;

        heartbeat_handle.abort();
        self.deregister().await?;

        result
    }

    /// Register with the control plane.
    async fn register(&self) -> Result<()> {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        self.client
            .register_worker(
                &self.config.name,
                &self.config.capability_tags,
                self.config.max_concurrency,
                &hostname,
            )
            .await?;

        tracing::info!(
            worker = %self.config.name,
            tags = ?self.config.capability_tags,
            hostname = %hostname,
            "Worker registered"
        );

        Ok(())
    }

    async fn deregister(&self) -> Result<()> {
        self.client.deregister_worker(&self.config.name).await?;
        tracing::info!(worker = %self.config.name, "Worker deregistered");
        Ok(())
    }

    /// Heartbeat background task.
    fn start_heartbeat(&self) -> tokio::task::JoinHandle<()> {
        let client = self.client.clone();
        let name = self.config.name.clone();
        let interval = self.config.heartbeat_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // Skip first immediate tick

            loop {
                ticker.tick().await;

                if let Err(e) = client.heartbeat(&name).await {
                    tracing::warn!(error = %e, "Heartbeat failed");
                }
            }
        })
    }

    /// The lease loop: wait for a slot, try every tag round-robin, and run
    /// leased jobs on their own tasks. Sleeps on the wake subscription (or
    /// the poll interval) when the queue is dry.
    async fn lease_loop(&self) -> Result<()> {
        let mut wake = JobWakeSubscriber::connect(
            self.config.nats_url.as_deref(),
            &self.config.capability_tags,
        )
        .await?;

        loop {
            let permit = self.semaphore.clone().acquire_owned().await?;

            match self.lease_any().await? {
                Some(job) => {
                    tracing::debug!(
                        key = %job.key(),
                        tool = %job.tool_kind,
                        "Job leased"
                    );

                    let runner = self.runner.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        let key = job.key();
                        if let Err(e) = runner.run(job).await {
                            tracing::error!(key = %key, error = %e, "Job execution failed");
                        }
                    });
                }
                None => {
                    drop(permit);
                    wake.wait(self.config.poll_interval).await;
                }
            }
        }
    }

    /// Try each capability tag in order.
    async fn lease_any(&self) -> Result<Option<crate::client::LeasedJob>> {
        for tag in &self.config.capability_tags {
            if let Some(job) = self
                .client
                .lease(tag, &self.config.name, self.config.lease_seconds)
                .await?
            {
                return Ok(Some(job));
            }
        }
        Ok(None)
    }
}
