use async_nats::jetstream::{
    self,
    consumer::{self, AckPolicy, PullConsumer},
    context::Context,
    stream::{Config, RetentionPolicy, StorageType},
    AckKind,
};
use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::{Delivery, DeliveryStream, Message, MessagingBackend, MessagingError};

/// Username and password for the NATS server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// NATS JetStream work queue.
///
/// One work-queue stream per topic, consumed through a durable pull consumer
/// shared by all workers. Acked jobs leave the stream. Each delivery stream
/// fetches one message at a time, so every worker holds at most one job.
#[derive(Clone)]
pub struct JetStreamBackend {
    context: Context,
    durable: bool,
    fetch_timeout: Duration,
    unsettled: Arc<Mutex<HashMap<u64, jetstream::Message>>>,
    next_tag: Arc<AtomicU64>,
}

fn consumer_name(topic: &str) -> String {
    format!("{topic}_worker")
}

impl JetStreamBackend {
    pub async fn new(
        server_url: &str,
        credentials: Option<&Credentials>,
        durable: bool,
        fetch_timeout: Duration,
    ) -> Result<Self, MessagingError> {
        let options = match credentials {
            Some(c) => async_nats::ConnectOptions::with_user_and_password(
                c.username.clone(),
                c.password.clone(),
            ),
            None => async_nats::ConnectOptions::new(),
        };
        let client = options
            .connect(server_url)
            .await
            .map_err(|e| MessagingError::Connection(format!("Failed to connect to NATS: {e}")))?;

        tracing::info!(server_url = %server_url, durable, "Connected to NATS JetStream");

        Ok(Self {
            context: jetstream::new(client),
            durable,
            fetch_timeout,
            unsettled: Arc::new(Mutex::new(HashMap::new())),
            next_tag: Arc::new(AtomicU64::new(1)),
        })
    }

    /// Ensures the stream and the durable consumer for a topic exist
    pub async fn ensure_stream(&self, topic: &str) -> Result<PullConsumer, MessagingError> {
        let storage = if self.durable {
            StorageType::File
        } else {
            StorageType::Memory
        };

        let stream = self
            .context
            .get_or_create_stream(Config {
                name: topic.to_string(),
                subjects: vec![topic.to_string()],
                retention: RetentionPolicy::WorkQueue,
                storage,
                ..Default::default()
            })
            .await
            .map_err(|e| MessagingError::Subscribe(format!("Failed to create stream: {e}")))?;

        let name = consumer_name(topic);
        stream
            .get_or_create_consumer(
                &name,
                consumer::pull::Config {
                    durable_name: Some(name.clone()),
                    ack_policy: AckPolicy::Explicit,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| MessagingError::Subscribe(format!("Failed to create consumer: {e}")))
    }

    fn take_unsettled(&self, delivery: &Delivery) -> Result<jetstream::Message, MessagingError> {
        let mut unsettled = self.unsettled.lock().unwrap_or_else(|e| e.into_inner());
        unsettled.remove(&delivery.tag).ok_or_else(|| {
            MessagingError::Ack(format!(
                "unknown delivery tag {} on {}",
                delivery.tag, delivery.topic
            ))
        })
    }
}

#[async_trait]
impl MessagingBackend for JetStreamBackend {
    async fn send_message(&self, topic: &str, message: Message) -> Result<(), MessagingError> {
        let payload = message.encode()?;
        let ack = self
            .context
            .publish(topic.to_string(), payload.into())
            .await
            .map_err(|e| MessagingError::Publish(e.to_string()))?;

        // Wait for the server to persist the message
        ack.await
            .map_err(|e| MessagingError::Publish(e.to_string()))?;
        Ok(())
    }

    async fn stream(&self, topic: &str) -> Result<DeliveryStream, MessagingError> {
        let consumer = self.ensure_stream(topic).await?;
        let topic = topic.to_string();
        let fetch_timeout = self.fetch_timeout;
        let unsettled = Arc::clone(&self.unsettled);
        let next_tag = Arc::clone(&self.next_tag);

        let s = stream! {
            loop {
                let mut batch = match consumer
                    .fetch()
                    .max_messages(1)
                    .expires(fetch_timeout)
                    .messages()
                    .await
                {
                    Ok(batch) => batch,
                    Err(e) => {
                        yield Err(MessagingError::Subscribe(format!("Fetch failed: {e}")));
                        break;
                    }
                };

                while let Some(next) = batch.next().await {
                    match next {
                        Ok(js_msg) => {
                            let redelivered =
                                js_msg.info().map(|info| info.delivered > 1).unwrap_or(false);
                            let tag = next_tag.fetch_add(1, Ordering::SeqCst);
                            let delivery = Delivery {
                                topic: topic.clone(),
                                tag,
                                redelivered,
                                payload: js_msg.payload.to_vec(),
                            };
                            unsettled
                                .lock()
                                .unwrap_or_else(|e| e.into_inner())
                                .insert(tag, js_msg);
                            yield Ok(delivery);
                        }
                        Err(e) => {
                            yield Err(MessagingError::Subscribe(format!("Receive failed: {e}")));
                        }
                    }
                }
            }
        };

        Ok(Box::pin(s))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), MessagingError> {
        let js_msg = self.take_unsettled(delivery)?;
        js_msg
            .ack()
            .await
            .map_err(|e| MessagingError::Ack(e.to_string()))
    }

    async fn nack(&self, delivery: &Delivery) -> Result<(), MessagingError> {
        let js_msg = self.take_unsettled(delivery)?;
        js_msg
            .ack_with(AckKind::Nak(None))
            .await
            .map_err(|e| MessagingError::Ack(e.to_string()))
    }

    async fn pending(&self, topic: &str) -> Result<usize, MessagingError> {
        let mut consumer = self.ensure_stream(topic).await?;
        let info = consumer
            .info()
            .await
            .map_err(|e| MessagingError::Subscribe(format!("Failed to read consumer info: {e}")))?;
        Ok(info.num_pending as usize)
    }
}
