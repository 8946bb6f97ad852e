use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, Notify};

use crate::{Delivery, DeliveryStream, Message, MessagingBackend, MessagingError};

#[derive(Debug, Clone)]
struct Queued {
    tag: u64,
    payload: Vec<u8>,
    deliveries: u32,
}

#[derive(Debug, Default)]
struct TopicQueue {
    ready: VecDeque<Queued>,
    in_flight: HashMap<u64, Queued>,
}

#[derive(Debug)]
struct Inner {
    topics: Mutex<HashMap<String, TopicQueue>>,
    notify: Notify,
    next_tag: AtomicU64,
}

/// Process-local queue with broker-like delivery semantics.
///
/// Each topic holds a bounded ready queue and hands out one delivery at a time;
/// the next one is released once the previous delivery is settled.
#[derive(Debug, Clone)]
pub struct InMemoryStreamingBackend {
    inner: Arc<Inner>,
    capacity: usize,
}

impl InMemoryStreamingBackend {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                topics: Mutex::new(HashMap::new()),
                notify: Notify::new(),
                next_tag: AtomicU64::new(1),
            }),
            capacity,
        }
    }

    /// Enqueue an undecoded payload as-is.
    pub async fn publish_raw(&self, topic: &str, payload: Vec<u8>) -> Result<(), MessagingError> {
        let mut topics = self.inner.topics.lock().await;
        let queue = topics.entry(topic.to_string()).or_default();

        if queue.ready.len() >= self.capacity {
            return Err(MessagingError::QueueFull {
                topic: topic.to_string(),
                capacity: self.capacity,
            });
        }

        queue.ready.push_back(Queued {
            tag: self.inner.next_tag.fetch_add(1, Ordering::SeqCst),
            payload,
            deliveries: 0,
        });
        drop(topics);

        self.inner.notify.notify_waiters();
        Ok(())
    }

    /// Requeue every unsettled delivery, as a broker does when a consumer dies.
    pub async fn redeliver_unacked(&self, topic: &str) -> usize {
        let mut topics = self.inner.topics.lock().await;
        let Some(queue) = topics.get_mut(topic) else {
            return 0;
        };

        let mut returned: Vec<Queued> = queue.in_flight.drain().map(|(_, q)| q).collect();
        returned.sort_by_key(|q| q.tag);
        let count = returned.len();
        for queued in returned.into_iter().rev() {
            queue.ready.push_front(queued);
        }
        drop(topics);

        self.inner.notify.notify_waiters();
        count
    }

    /// Unsettled deliveries of a topic.
    pub async fn in_flight(&self, topic: &str) -> usize {
        let topics = self.inner.topics.lock().await;
        topics.get(topic).map_or(0, |q| q.in_flight.len())
    }

    async fn settle(&self, delivery: &Delivery, requeue: bool) -> Result<(), MessagingError> {
        let mut topics = self.inner.topics.lock().await;
        let Some(queue) = topics.get_mut(&delivery.topic) else {
            return Err(unknown_delivery(delivery));
        };
        let Some(queued) = queue.in_flight.remove(&delivery.tag) else {
            return Err(unknown_delivery(delivery));
        };
        if requeue {
            queue.ready.push_front(queued);
        }
        drop(topics);

        self.inner.notify.notify_waiters();
        Ok(())
    }
}

fn unknown_delivery(delivery: &Delivery) -> MessagingError {
    MessagingError::Ack(format!(
        "unknown delivery tag {} on {}",
        delivery.tag, delivery.topic
    ))
}

impl Inner {
    /// Move the head of the ready queue in flight, unless a delivery is already outstanding.
    async fn take_next(&self, topic: &str) -> Option<Delivery> {
        let mut topics = self.topics.lock().await;
        let queue = topics.entry(topic.to_string()).or_default();
        if !queue.in_flight.is_empty() {
            return None;
        }

        let mut queued = queue.ready.pop_front()?;
        queued.deliveries += 1;
        let delivery = Delivery {
            topic: topic.to_string(),
            tag: queued.tag,
            redelivered: queued.deliveries > 1,
            payload: queued.payload.clone(),
        };
        queue.in_flight.insert(queued.tag, queued);
        Some(delivery)
    }
}

#[async_trait]
impl MessagingBackend for InMemoryStreamingBackend {
    async fn send_message(&self, topic: &str, message: Message) -> Result<(), MessagingError> {
        self.publish_raw(topic, message.encode()?).await
    }

    async fn stream(&self, topic: &str) -> Result<DeliveryStream, MessagingError> {
        let inner = Arc::clone(&self.inner);
        let topic = topic.to_string();

        Ok(Box::pin(async_stream::stream! {
            loop {
                // Register interest before checking so a concurrent publish is not missed
                let notified = inner.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                match inner.take_next(&topic).await {
                    Some(delivery) => yield Ok(delivery),
                    None => notified.await,
                }
            }
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), MessagingError> {
        self.settle(delivery, false).await
    }

    async fn nack(&self, delivery: &Delivery) -> Result<(), MessagingError> {
        self.settle(delivery, true).await
    }

    async fn pending(&self, topic: &str) -> Result<usize, MessagingError> {
        let topics = self.inner.topics.lock().await;
        Ok(topics.get(topic).map_or(0, |q| q.ready.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DeletionJob;
    use futures::StreamExt;
    use std::time::Duration;

    fn job(id: &str) -> Message {
        Message::DeletionJob(DeletionJob::new(id))
    }

    #[tokio::test]
    async fn test_send_and_receive_single_message() {
        let backend = InMemoryStreamingBackend::new(10);
        backend.send_message("topic_a", job("1")).await.unwrap();

        let mut stream = backend.stream("topic_a").await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        assert_eq!(delivery.message().unwrap(), job("1"));
        assert!(!delivery.redelivered);

        backend.ack(&delivery).await.unwrap();
        assert_eq!(backend.in_flight("topic_a").await, 0);
        assert_eq!(backend.pending("topic_a").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_one_delivery_in_flight_at_a_time() {
        let backend = InMemoryStreamingBackend::new(10);
        backend.send_message("topic_a", job("1")).await.unwrap();
        backend.send_message("topic_a", job("2")).await.unwrap();

        let mut stream = backend.stream("topic_a").await.unwrap();
        let first = stream.next().await.unwrap().unwrap();

        // nothing else is released until the first delivery is settled
        let blocked = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
        assert!(blocked.is_err());
        assert_eq!(backend.pending("topic_a").await.unwrap(), 1);

        backend.ack(&first).await.unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.message().unwrap(), job("2"));
    }

    #[tokio::test]
    async fn test_messages_across_multiple_topics() {
        let backend = InMemoryStreamingBackend::new(10);
        backend.send_message("topic_a", job("a")).await.unwrap();
        backend.send_message("topic_b", job("b")).await.unwrap();

        let mut stream_b = backend.stream("topic_b").await.unwrap();
        let delivery = stream_b.next().await.unwrap().unwrap();
        assert_eq!(delivery.message().unwrap(), job("b"));
        assert_eq!(backend.pending("topic_a").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stream_waits_for_later_publish() {
        let backend = InMemoryStreamingBackend::new(10);
        let mut stream = backend.stream("topic_a").await.unwrap();

        let publisher = backend.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.send_message("topic_a", job("late")).await.unwrap();
        });

        let delivery = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(delivery.message().unwrap(), job("late"));
    }

    #[tokio::test]
    async fn test_capacity_is_enforced() {
        let backend = InMemoryStreamingBackend::new(2);
        backend.send_message("topic_a", job("1")).await.unwrap();
        backend.send_message("topic_a", job("2")).await.unwrap();

        let err = backend.send_message("topic_a", job("3")).await.unwrap_err();
        assert!(matches!(err, MessagingError::QueueFull { capacity: 2, .. }));
    }

    #[tokio::test]
    async fn test_redeliver_unacked_after_consumer_loss() {
        let backend = InMemoryStreamingBackend::new(10);
        backend.send_message("topic_a", job("1")).await.unwrap();

        {
            let mut stream = backend.stream("topic_a").await.unwrap();
            let delivery = stream.next().await.unwrap().unwrap();
            assert!(!delivery.redelivered);
            // consumer goes away without settling
        }

        assert_eq!(backend.redeliver_unacked("topic_a").await, 1);
        let mut stream = backend.stream("topic_a").await.unwrap();
        let again = stream.next().await.unwrap().unwrap();
        assert_eq!(again.message().unwrap(), job("1"));
        assert!(again.redelivered);
    }

    #[tokio::test]
    async fn test_nack_requeues_at_front() {
        let backend = InMemoryStreamingBackend::new(10);
        backend.send_message("topic_a", job("1")).await.unwrap();
        backend.send_message("topic_a", job("2")).await.unwrap();

        let mut stream = backend.stream("topic_a").await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        backend.nack(&first).await.unwrap();

        let again = stream.next().await.unwrap().unwrap();
        assert_eq!(again.tag, first.tag);
        assert!(again.redelivered);
    }

    #[tokio::test]
    async fn test_settling_unknown_delivery_fails() {
        let backend = InMemoryStreamingBackend::new(10);
        let bogus = Delivery {
            topic: "topic_a".to_string(),
            tag: 42,
            redelivered: false,
            payload: Vec::new(),
        };
        assert!(matches!(
            backend.ack(&bogus).await,
            Err(MessagingError::Ack(_))
        ));
    }
}
