use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::Shutdown;
use futures::Stream;
use serde::{Deserialize, Serialize};

pub mod backend;
pub mod config;

pub use config::BackendConfig;

/// Request to re-validate and possibly delete one probable-delete candidate.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DeletionJob {
    pub object_id: String,
}

impl DeletionJob {
    pub fn new(object_id: impl Into<String>) -> Self {
        Self {
            object_id: object_id.into(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "message_type", content = "data")]
pub enum Message {
    DeletionJob(DeletionJob),
}

impl Message {
    pub fn encode(&self) -> Result<Vec<u8>, MessagingError> {
        serde_json::to_vec(self).map_err(|e| MessagingError::Serialization(e.to_string()))
    }

    pub fn decode(payload: &[u8]) -> Result<Self, MessagingError> {
        serde_json::from_slice(payload).map_err(|e| MessagingError::Serialization(e.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("subscribe failed: {0}")]
    Subscribe(String),

    #[error("acknowledgment failed: {0}")]
    Ack(String),

    #[error("queue {topic} is full ({capacity} jobs)")]
    QueueFull { topic: String, capacity: usize },

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// A message handed to a consumer, to be settled with `ack` or `nack`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    /// Backend-assigned handle, unique per delivery
    pub tag: u64,
    /// Set when the broker delivered this message before
    pub redelivered: bool,
    pub payload: Vec<u8>,
}

impl Delivery {
    pub fn message(&self) -> Result<Message, MessagingError> {
        Message::decode(&self.payload)
    }
}

pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, MessagingError>> + Send>>;

/// At-least-once work queue.
///
/// Consumers see at most one unsettled delivery per topic at a time. A delivery
/// that is never settled is handed out again.
#[async_trait]
pub trait MessagingBackend: Send + Sync {
    async fn send_message(&self, topic: &str, message: Message) -> Result<(), MessagingError>;

    /// Stream deliveries for a topic. The stream ends or yields an error when
    /// the connection is lost.
    async fn stream(&self, topic: &str) -> Result<DeliveryStream, MessagingError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), MessagingError>;

    /// Return the delivery to the queue for another attempt.
    async fn nack(&self, delivery: &Delivery) -> Result<(), MessagingError>;

    /// Messages waiting for delivery, excluding the one in flight.
    async fn pending(&self, topic: &str) -> Result<usize, MessagingError>;
}

/// A backend bound to one topic.
#[derive(Clone)]
pub struct Dispatcher {
    backend: Arc<dyn MessagingBackend>,
    topic: String,
}

impl Dispatcher {
    pub fn new(backend: Arc<dyn MessagingBackend>, topic: impl Into<String>) -> Self {
        Self {
            backend,
            topic: topic.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn send(&self, message: Message) -> Result<(), MessagingError> {
        self.backend.send_message(&self.topic, message).await
    }

    pub async fn stream(&self) -> Result<DeliveryStream, MessagingError> {
        self.backend.stream(&self.topic).await
    }

    pub async fn ack(&self, delivery: &Delivery) -> Result<(), MessagingError> {
        self.backend.ack(delivery).await
    }

    pub async fn nack(&self, delivery: &Delivery) -> Result<(), MessagingError> {
        self.backend.nack(delivery).await
    }

    pub async fn pending(&self) -> Result<usize, MessagingError> {
        self.backend.pending(&self.topic).await
    }
}

/// Something that can (re)establish a backend connection.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn MessagingBackend>, MessagingError>;
}

/// An already connected backend, shared between services of one process.
#[async_trait]
impl Connector for Arc<dyn MessagingBackend> {
    async fn connect(&self) -> Result<Arc<dyn MessagingBackend>, MessagingError> {
        Ok(Arc::clone(self))
    }
}

/// Connect, retrying after a fixed `delay` until it succeeds.
///
/// Returns `None` only when shutdown is requested before a connection is made.
pub async fn connect_with_retry(
    connector: &dyn Connector,
    delay: Duration,
    shutdown: &mut Shutdown,
) -> Option<Arc<dyn MessagingBackend>> {
    let mut attempt: u64 = 0;
    loop {
        if shutdown.is_triggered() {
            return None;
        }

        attempt += 1;
        match connector.connect().await {
            Ok(backend) => {
                if attempt > 1 {
                    tracing::info!(attempt, "Connected to queue broker");
                }
                return Some(backend);
            }
            Err(e) => {
                tracing::warn!(
                    attempt,
                    error = %e,
                    retry_in = ?delay,
                    "Queue broker connection failed"
                );
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.triggered() => return None,
        }
    }
}
