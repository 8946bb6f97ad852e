//! Deferred deletion worker.
//!
//! Consumes deletion jobs, revalidates each candidate against the live
//! metadata indexes and deletes the object data only when the candidate is
//! still orphaned.

pub mod consumer;
pub mod processor;
pub mod validator;

use std::sync::Arc;

use common::Shutdown;
use common::config::Configuration;
use common::store::MetadataStore;
use messaging::Connector;
use object_store::ObjectStore;

pub use consumer::{DeletionConsumer, WorkerStats};
pub use processor::{JobProcessor, ProcessOutcome};
pub use validator::{DeletionValidator, Verdict};

pub struct DeferredDeletionWorker {
    consumer: DeletionConsumer,
    daemon_mode: bool,
}

impl DeferredDeletionWorker {
    pub fn new(consumer: DeletionConsumer, daemon_mode: bool) -> Self {
        Self {
            consumer,
            daemon_mode,
        }
    }

    pub fn from_config(
        config: &Configuration,
        store: Arc<dyn MetadataStore>,
        object_store: Arc<dyn ObjectStore>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let indexes = &config.indexes;
        let validator = DeletionValidator::new(
            Arc::clone(&store),
            indexes.probable_delete_index_id.clone(),
            indexes.object_metadata_index_id.clone(),
            config.metadata_store.max_keys,
        )
        .with_instance_index(indexes.global_instance_index_id.clone());

        let processor = JobProcessor::new(
            validator,
            store,
            object_store,
            indexes.probable_delete_index_id.clone(),
            config.storage.object_prefix.clone(),
        );

        // one broker fetch may come back empty before a queued job arrives
        let idle_timeout = config.worker.fetch_timeout * 2;

        Self::new(
            DeletionConsumer::new(
                processor,
                connector,
                config.queue.topic.clone(),
                config.worker.reconnect_delay,
                idle_timeout,
            ),
            config.worker.daemon_mode,
        )
    }

    /// Consume until shutdown in daemon mode, otherwise drain the queue and return.
    pub async fn run(&self, shutdown: Shutdown) -> WorkerStats {
        if self.daemon_mode {
            tracing::info!("Deferred deletion worker started in daemon mode");
            self.consumer.run(shutdown).await
        } else {
            tracing::info!("Deferred deletion worker started in drain mode");
            self.consumer.drain(shutdown).await
        }
    }
}
