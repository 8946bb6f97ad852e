use crate::{
    Connector, MessagingBackend, MessagingError,
    backend::{Credentials, InMemoryStreamingBackend, JetStreamBackend},
};
use async_trait::async_trait;
use common::config::{QueueBackendKind, QueueConfig};
use std::sync::Arc;
use std::time::Duration;

/// Configuration for the messaging system.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendConfig {
    /// In-memory backend configuration.
    Memory {
        /// Upper bound on queued messages per topic.
        capacity: usize,
    },
    /// NATS JetStream backend configuration.
    JetStream {
        /// The URL of the NATS server.
        server_url: String,
        credentials: Option<Credentials>,
        /// File storage for the stream when true, memory storage otherwise.
        durable: bool,
        /// How long a single pull waits for a message.
        fetch_timeout: Duration,
    },
}

impl BackendConfig {
    /// Create a new in-memory backend configuration.
    pub fn memory(capacity: usize) -> Self {
        Self::Memory { capacity }
    }

    /// Create a new NATS JetStream backend configuration.
    pub fn jetstream(server_url: impl Into<String>) -> Self {
        Self::JetStream {
            server_url: server_url.into(),
            credentials: None,
            durable: true,
            fetch_timeout: Duration::from_secs(5),
        }
    }

    /// Build from the `[queue]` section.
    pub fn from_queue_config(queue: &QueueConfig, fetch_timeout: Duration) -> Self {
        match queue.backend {
            QueueBackendKind::Memory => Self::memory(queue.capacity),
            QueueBackendKind::JetStream => Self::JetStream {
                server_url: queue.url.clone(),
                credentials: match (&queue.username, &queue.password) {
                    (Some(username), password) => Some(Credentials {
                        username: username.clone(),
                        password: password.clone().unwrap_or_default(),
                    }),
                    (None, _) => None,
                },
                durable: queue.durable,
                fetch_timeout,
            },
        }
    }

    /// Create a backend from the configuration.
    pub async fn create_backend(&self) -> Result<Arc<dyn MessagingBackend>, MessagingError> {
        match self {
            BackendConfig::Memory { capacity } => {
                Ok(Arc::new(InMemoryStreamingBackend::new(*capacity)))
            }
            BackendConfig::JetStream {
                server_url,
                credentials,
                durable,
                fetch_timeout,
            } => {
                let backend = JetStreamBackend::new(
                    server_url,
                    credentials.as_ref(),
                    *durable,
                    *fetch_timeout,
                )
                .await?;
                Ok(Arc::new(backend))
            }
        }
    }
}

#[async_trait]
impl Connector for BackendConfig {
    async fn connect(&self) -> Result<Arc<dyn MessagingBackend>, MessagingError> {
        self.create_backend().await
    }
}
