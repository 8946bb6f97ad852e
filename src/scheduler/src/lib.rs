//! Periodically republishes every probable-delete record as a deletion job.

use std::sync::Arc;
use std::time::Duration;

use common::Shutdown;
use common::config::Configuration;
use common::store::{MetadataStore, StoreError, list_all};
use messaging::{DeletionJob, Dispatcher, Message, MessagingBackend};

#[derive(Debug, thiserror::Error)]
pub enum TickError {
    #[error("failed to list probable-delete index: {0}")]
    Listing(#[from] StoreError),
}

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub listed: usize,
    pub published: usize,
    pub failed: usize,
}

pub struct DeferredDeletionScheduler {
    store: Arc<dyn MetadataStore>,
    dispatcher: Dispatcher,
    index_id: String,
    max_keys: usize,
    interval: Duration,
    run_on_startup: bool,
}

impl DeferredDeletionScheduler {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        dispatcher: Dispatcher,
        index_id: impl Into<String>,
        max_keys: usize,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            dispatcher,
            index_id: index_id.into(),
            max_keys,
            interval,
            run_on_startup: false,
        }
    }

    pub fn from_config(
        config: &Configuration,
        store: Arc<dyn MetadataStore>,
        backend: Arc<dyn MessagingBackend>,
    ) -> Self {
        Self::new(
            store,
            Dispatcher::new(backend, config.queue.topic.clone()),
            config.indexes.probable_delete_index_id.clone(),
            config.metadata_store.max_keys,
            config.scheduler.interval,
        )
        .with_run_on_startup(config.scheduler.run_on_startup)
    }

    pub fn with_run_on_startup(mut self, run_on_startup: bool) -> Self {
        self.run_on_startup = run_on_startup;
        self
    }

    /// List the whole probable-delete index, then publish one job per entry.
    ///
    /// Nothing is published unless the listing completed. A failed publish is
    /// counted and the remaining entries are still published; the next tick
    /// retries everything still in the index.
    pub async fn tick(&self) -> Result<TickSummary, TickError> {
        let entries = list_all(self.store.as_ref(), &self.index_id, self.max_keys).await?;

        let mut summary = TickSummary {
            listed: entries.len(),
            ..Default::default()
        };

        for entry in entries {
            let job = Message::DeletionJob(DeletionJob::new(entry.key.clone()));
            match self.dispatcher.send(job).await {
                Ok(()) => {
                    tracing::debug!(object_id = %entry.key, "Published deletion job");
                    summary.published += 1;
                }
                Err(e) => {
                    tracing::warn!(object_id = %entry.key, error = %e, "Failed to publish deletion job");
                    summary.failed += 1;
                }
            }
        }

        Ok(summary)
    }

    async fn run_tick(&self, shutdown: &mut Shutdown) -> bool {
        tokio::select! {
            result = self.tick() => {
                match result {
                    Ok(summary) => tracing::info!(
                        index_id = %self.index_id,
                        listed = summary.listed,
                        published = summary.published,
                        failed = summary.failed,
                        "Scheduler tick complete"
                    ),
                    Err(e) => tracing::error!(
                        index_id = %self.index_id,
                        error = %e,
                        retry_in = ?self.interval,
                        "Scheduler tick failed"
                    ),
                }
                true
            }
            _ = shutdown.triggered() => {
                tracing::info!("Shutdown requested, abandoning scheduler tick");
                false
            }
        }
    }

    /// Tick every `interval` until shutdown.
    ///
    /// The interval is measured from the end of the previous tick, so ticks
    /// never overlap.
    pub async fn run(&self, mut shutdown: Shutdown) {
        tracing::info!(
            index_id = %self.index_id,
            topic = %self.dispatcher.topic(),
            interval = ?self.interval,
            "Deferred deletion scheduler started"
        );

        if self.run_on_startup && !self.run_tick(&mut shutdown).await {
            return;
        }

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown.triggered() => break,
            }

            if shutdown.is_triggered() || !self.run_tick(&mut shutdown).await {
                break;
            }
        }

        tracing::info!("Deferred deletion scheduler stopped");
    }
}
