use std::sync::Arc;
use std::time::Duration;

use common::Shutdown;
use futures::StreamExt;
use messaging::{Connector, Delivery, Dispatcher, Message, connect_with_retry};

use crate::processor::{JobProcessor, ProcessOutcome};

/// Counters for one worker run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Jobs decoded and processed, whatever the outcome.
    pub processed: usize,
    pub deleted: usize,
    /// Records retired without deleting data (stale or data already gone).
    pub retired: usize,
    /// Records left in place for a later tick.
    pub kept: usize,
    pub undecodable: usize,
}

impl WorkerStats {
    fn record(&mut self, outcome: &ProcessOutcome) {
        self.processed += 1;
        match outcome {
            ProcessOutcome::Deleted => self.deleted += 1,
            ProcessOutcome::AlreadyDeleted | ProcessOutcome::Stale => self.retired += 1,
            ProcessOutcome::InstanceActive | ProcessOutcome::Skipped(_) => self.kept += 1,
            ProcessOutcome::AlreadyHandled => {}
        }
    }
}

enum SessionEnd {
    Shutdown,
    Drained,
    Disconnected(String),
}

/// Consumes deletion jobs one at a time and acknowledges each after processing.
pub struct DeletionConsumer {
    processor: JobProcessor,
    connector: Arc<dyn Connector>,
    topic: String,
    reconnect_delay: Duration,
    idle_timeout: Duration,
}

impl DeletionConsumer {
    pub fn new(
        processor: JobProcessor,
        connector: Arc<dyn Connector>,
        topic: impl Into<String>,
        reconnect_delay: Duration,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            processor,
            connector,
            topic: topic.into(),
            reconnect_delay,
            idle_timeout,
        }
    }

    /// Consume until shutdown, reconnecting whenever the broker connection is lost.
    pub async fn run(&self, shutdown: Shutdown) -> WorkerStats {
        self.consume(shutdown, false).await
    }

    /// Process the jobs queued when the connection was made, then return.
    ///
    /// Also returns when no delivery arrives within the idle timeout, which
    /// happens when another consumer took some of the counted jobs.
    pub async fn drain(&self, shutdown: Shutdown) -> WorkerStats {
        self.consume(shutdown, true).await
    }

    async fn consume(&self, mut shutdown: Shutdown, drain: bool) -> WorkerStats {
        let mut stats = WorkerStats::default();

        loop {
            let Some(backend) =
                connect_with_retry(self.connector.as_ref(), self.reconnect_delay, &mut shutdown)
                    .await
            else {
                break;
            };
            let dispatcher = Dispatcher::new(backend, self.topic.clone());

            let limit = if drain {
                match dispatcher.pending().await {
                    Ok(pending) => {
                        tracing::info!(topic = %self.topic, pending, "Draining deletion queue");
                        Some(pending)
                    }
                    Err(e) => {
                        tracing::warn!(topic = %self.topic, error = %e, "Failed to read queue depth");
                        if !self.pause(&mut shutdown).await {
                            break;
                        }
                        continue;
                    }
                }
            } else {
                None
            };

            match self
                .session(&dispatcher, limit, &mut shutdown, &mut stats)
                .await
            {
                SessionEnd::Shutdown | SessionEnd::Drained => break,
                SessionEnd::Disconnected(reason) => {
                    tracing::warn!(
                        topic = %self.topic,
                        reason = %reason,
                        retry_in = ?self.reconnect_delay,
                        "Lost queue connection"
                    );
                    if !self.pause(&mut shutdown).await {
                        break;
                    }
                }
            }
        }

        tracing::info!(
            topic = %self.topic,
            processed = stats.processed,
            deleted = stats.deleted,
            retired = stats.retired,
            kept = stats.kept,
            undecodable = stats.undecodable,
            "Deletion consumer stopped"
        );
        stats
    }

    /// Returns false when shutdown fired during the pause.
    async fn pause(&self, shutdown: &mut Shutdown) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.reconnect_delay) => true,
            _ = shutdown.triggered() => false,
        }
    }

    async fn session(
        &self,
        dispatcher: &Dispatcher,
        limit: Option<usize>,
        shutdown: &mut Shutdown,
        stats: &mut WorkerStats,
    ) -> SessionEnd {
        let mut stream = match dispatcher.stream().await {
            Ok(stream) => stream,
            Err(e) => return SessionEnd::Disconnected(e.to_string()),
        };

        let mut handled = 0;
        loop {
            if limit.is_some_and(|limit| handled >= limit) {
                return SessionEnd::Drained;
            }

            // Shutdown is only observed between jobs; a job in progress runs to its ack.
            let next = tokio::select! {
                biased;
                _ = shutdown.triggered() => return SessionEnd::Shutdown,
                next = stream.next() => next,
                _ = tokio::time::sleep(self.idle_timeout), if limit.is_some() => {
                    tracing::info!(topic = %self.topic, handled, "Deletion queue idle, drain complete");
                    return SessionEnd::Drained;
                }
            };

            match next {
                Some(Ok(delivery)) => {
                    self.handle(dispatcher, delivery, stats).await;
                    handled += 1;
                }
                Some(Err(e)) => return SessionEnd::Disconnected(e.to_string()),
                None => return SessionEnd::Disconnected("delivery stream ended".to_string()),
            }
        }
    }

    async fn handle(
        &self,
        dispatcher: &Dispatcher,
        delivery: Delivery,
        stats: &mut WorkerStats,
    ) {
        match delivery.message() {
            Ok(Message::DeletionJob(job)) => {
                let outcome = self.processor.process(&job).await;
                tracing::debug!(
                    object_id = %job.object_id,
                    redelivered = delivery.redelivered,
                    outcome = %outcome,
                    "Processed deletion job"
                );
                stats.record(&outcome);
            }
            Err(e) => {
                tracing::warn!(tag = delivery.tag, error = %e, "Discarding undecodable delivery");
                stats.undecodable += 1;
            }
        }

        if let Err(e) = dispatcher.ack(&delivery).await {
            tracing::warn!(tag = delivery.tag, error = %e, "Failed to acknowledge delivery, broker will redeliver");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validator::DeletionValidator;
    use async_trait::async_trait;
    use common::storage::object_path;
    use common::store::{InMemoryMetadataStore, ListPage, MetadataStore, StoreResult};
    use messaging::backend::InMemoryStreamingBackend;
    use messaging::{DeletionJob, DeliveryStream, MessagingBackend, MessagingError};
    use object_store::memory::InMemory;
    use object_store::{ObjectStore, PutPayload};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const PD: &str = "probable-delete";
    const META: &str = "object-metadata";
    const TOPIC: &str = "jobs";

    struct Fixture {
        store: Arc<InMemoryMetadataStore>,
        objects: Arc<InMemory>,
        backend: InMemoryStreamingBackend,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: Arc::new(InMemoryMetadataStore::new()),
                objects: Arc::new(InMemory::new()),
                backend: InMemoryStreamingBackend::new(16),
            }
        }

        async fn candidate(&self, object_id: &str, live_name: Option<&str>) {
            self.store.insert(
                PD,
                object_id,
                r#"{"probable_object_name":"bucket/obj"}"#,
            );
            if let Some(name) = live_name {
                self.store.insert(
                    META,
                    object_id,
                    &format!(r#"{{"object_id":"{object_id}","object_name":"{name}"}}"#),
                );
            }
            self.objects
                .put(&object_path("objects", object_id), PutPayload::from_static(b"data"))
                .await
                .unwrap();
        }

        async fn publish(&self, object_id: &str) {
            self.backend
                .send_message(TOPIC, Message::DeletionJob(DeletionJob::new(object_id)))
                .await
                .unwrap();
        }

        async fn exists(&self, object_id: &str) -> bool {
            self.objects
                .head(&object_path("objects", object_id))
                .await
                .is_ok()
        }

        fn consumer(&self, connector: Arc<dyn Connector>) -> DeletionConsumer {
            self.consumer_over(Arc::clone(&self.store) as Arc<dyn MetadataStore>, connector)
        }

        fn consumer_over(
            &self,
            shared: Arc<dyn MetadataStore>,
            connector: Arc<dyn Connector>,
        ) -> DeletionConsumer {
            let processor = JobProcessor::new(
                DeletionValidator::new(Arc::clone(&shared), PD, META, 100),
                shared,
                Arc::clone(&self.objects) as Arc<dyn ObjectStore>,
                PD,
                "objects",
            );
            DeletionConsumer::new(
                processor,
                connector,
                TOPIC,
                Duration::from_secs(5),
                Duration::from_secs(10),
            )
        }

        fn shared_consumer(&self) -> DeletionConsumer {
            let backend: Arc<dyn MessagingBackend> = Arc::new(self.backend.clone());
            self.consumer(Arc::new(backend))
        }
    }

    #[tokio::test]
    async fn test_drain_processes_queued_jobs_and_exits() {
        let f = Fixture::new();
        f.candidate("oid-1", Some("bucket/obj")).await;
        f.candidate("oid-2", Some("bucket/obj-v2")).await;
        f.candidate("oid-3", None).await;
        for id in ["oid-1", "oid-2", "oid-3"] {
            f.publish(id).await;
        }

        let stats = f.shared_consumer().drain(Shutdown::never()).await;

        assert_eq!(
            stats,
            WorkerStats {
                processed: 3,
                deleted: 2,
                retired: 1,
                kept: 0,
                undecodable: 0
            }
        );
        assert!(!f.exists("oid-1").await);
        assert!(f.exists("oid-2").await);
        assert!(!f.exists("oid-3").await);
        assert!(f.store.snapshot(PD).is_empty());
        assert_eq!(f.backend.pending(TOPIC).await.unwrap(), 0);
        assert_eq!(f.backend.in_flight(TOPIC).await, 0);
    }

    #[tokio::test]
    async fn test_undecodable_delivery_is_acknowledged() {
        let f = Fixture::new();
        f.candidate("oid-1", Some("bucket/obj")).await;
        f.backend
            .publish_raw(TOPIC, b"not a job".to_vec())
            .await
            .unwrap();
        f.publish("oid-1").await;

        let stats = f.shared_consumer().drain(Shutdown::never()).await;

        assert_eq!(stats.undecodable, 1);
        assert_eq!(stats.deleted, 1);
        assert_eq!(f.backend.in_flight(TOPIC).await, 0);
    }

    #[tokio::test]
    async fn test_redelivery_after_crash_is_harmless() {
        let f = Fixture::new();
        f.candidate("oid-1", Some("bucket/obj")).await;
        f.publish("oid-1").await;

        // A consumer takes the job, completes the work and dies before acking.
        {
            let mut stream = f.backend.stream(TOPIC).await.unwrap();
            let delivery = stream.next().await.unwrap().unwrap();
            let Message::DeletionJob(job) = delivery.message().unwrap();
            f.shared_consumer().processor.process(&job).await;
        }
        assert_eq!(f.backend.redeliver_unacked(TOPIC).await, 1);

        let mutations = f.store.mutation_count();
        let stats = f.shared_consumer().drain(Shutdown::never()).await;

        assert_eq!(stats.processed, 1);
        assert_eq!(stats.deleted, 0);
        assert_eq!(f.store.mutation_count(), mutations);
        assert_eq!(f.backend.in_flight(TOPIC).await, 0);
    }

    #[tokio::test]
    async fn test_active_instance_keeps_record() {
        let f = Fixture::new();
        f.store.insert(
            PD,
            "oid-1",
            r#"{"probable_object_name":"bucket/obj","global_instance_id":"inst-1"}"#,
        );
        f.store.insert("instances", "node-a", "inst-1");
        f.objects
            .put(&object_path("objects", "oid-1"), PutPayload::from_static(b"data"))
            .await
            .unwrap();
        f.publish("oid-1").await;

        let shared = Arc::clone(&f.store) as Arc<dyn MetadataStore>;
        let validator = DeletionValidator::new(Arc::clone(&shared), PD, META, 100)
            .with_instance_index(Some("instances".to_string()));
        let backend: Arc<dyn MessagingBackend> = Arc::new(f.backend.clone());
        let consumer = DeletionConsumer::new(
            JobProcessor::new(
                validator,
                shared,
                Arc::clone(&f.objects) as Arc<dyn ObjectStore>,
                PD,
                "objects",
            ),
            Arc::new(backend),
            TOPIC,
            Duration::from_secs(5),
            Duration::from_secs(10),
        );

        let stats = consumer.drain(Shutdown::never()).await;

        assert_eq!(stats.kept, 1);
        assert!(f.exists("oid-1").await);
        assert_eq!(f.store.snapshot(PD).len(), 1);
        assert_eq!(f.backend.pending(TOPIC).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_daemon_processes_until_shutdown() {
        let f = Fixture::new();
        let consumer = f.shared_consumer();
        let (trigger, shutdown) = common::shutdown::channel();

        let handle = tokio::spawn(async move { consumer.run(shutdown).await });

        f.candidate("oid-1", Some("bucket/obj")).await;
        f.publish("oid-1").await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!f.exists("oid-1").await);

        trigger.trigger();
        let stats = handle.await.unwrap();
        assert_eq!(stats.deleted, 1);
    }

    /// Answers lookups only after a long delay.
    struct SlowStore {
        inner: Arc<InMemoryMetadataStore>,
        delay: Duration,
    }

    #[async_trait]
    impl MetadataStore for SlowStore {
        async fn get(&self, index_id: &str, key: &str) -> StoreResult<Option<String>> {
            tokio::time::sleep(self.delay).await;
            self.inner.get(index_id, key).await
        }

        async fn put(&self, index_id: &str, key: &str, value: &str) -> StoreResult<()> {
            self.inner.put(index_id, key, value).await
        }

        async fn delete(&self, index_id: &str, key: &str) -> StoreResult<bool> {
            self.inner.delete(index_id, key).await
        }

        async fn list(
            &self,
            index_id: &str,
            marker: Option<&str>,
            max_keys: usize,
        ) -> StoreResult<ListPage> {
            self.inner.list(index_id, marker, max_keys).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_in_flight_job() {
        let f = Fixture::new();
        f.candidate("oid-1", Some("bucket/obj")).await;
        f.publish("oid-1").await;

        let slow = Arc::new(SlowStore {
            inner: Arc::clone(&f.store),
            delay: Duration::from_secs(30),
        });
        let backend: Arc<dyn MessagingBackend> = Arc::new(f.backend.clone());
        let consumer = f.consumer_over(slow, Arc::new(backend));
        let (trigger, shutdown) = common::shutdown::channel();
        let handle = tokio::spawn(async move { consumer.run(shutdown).await });

        // the job is mid-validation when shutdown fires
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(f.backend.in_flight(TOPIC).await, 1);
        trigger.trigger();

        let stats = handle.await.unwrap();
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.deleted, 1);
        assert!(!f.exists("oid-1").await);
        assert_eq!(f.backend.in_flight(TOPIC).await, 0);
        assert_eq!(f.backend.pending(TOPIC).await.unwrap(), 0);
    }

    /// A backend whose delivery stream always fails to open.
    struct BrokenBackend;

    #[async_trait]
    impl MessagingBackend for BrokenBackend {
        async fn send_message(
            &self,
            _topic: &str,
            _message: Message,
        ) -> Result<(), MessagingError> {
            Err(MessagingError::Publish("broken".to_string()))
        }

        async fn stream(&self, _topic: &str) -> Result<DeliveryStream, MessagingError> {
            Err(MessagingError::Subscribe("connection reset".to_string()))
        }

        async fn ack(&self, _delivery: &Delivery) -> Result<(), MessagingError> {
            Err(MessagingError::Ack("broken".to_string()))
        }

        async fn nack(&self, _delivery: &Delivery) -> Result<(), MessagingError> {
            Err(MessagingError::Ack("broken".to_string()))
        }

        async fn pending(&self, _topic: &str) -> Result<usize, MessagingError> {
            Ok(0)
        }
    }

    /// Hands out a broken backend first, then the working one.
    struct ReconnectingConnector {
        backend: InMemoryStreamingBackend,
        connects: AtomicUsize,
    }

    #[async_trait]
    impl Connector for ReconnectingConnector {
        async fn connect(&self) -> Result<Arc<dyn MessagingBackend>, MessagingError> {
            if self.connects.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(Arc::new(BrokenBackend))
            } else {
                Ok(Arc::new(self.backend.clone()))
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_connection_reconnects_after_delay() {
        let f = Fixture::new();
        f.candidate("oid-1", Some("bucket/obj")).await;
        f.publish("oid-1").await;

        let connector = Arc::new(ReconnectingConnector {
            backend: f.backend.clone(),
            connects: AtomicUsize::new(0),
        });
        let consumer = f.consumer(Arc::clone(&connector) as Arc<dyn Connector>);
        let (trigger, shutdown) = common::shutdown::channel();
        let handle = tokio::spawn(async move { consumer.run(shutdown).await });

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(f.exists("oid-1").await);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!f.exists("oid-1").await);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);

        trigger.trigger();
        handle.await.unwrap();
    }
}
