//! Broker implementation over tokio primitives

use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

use super::{DEAD_LETTER, QUEUES};

/// Maximum delivery attempts before a message is dead-lettered
const MAX_DELIVERY_ATTEMPTS: u32 = 2;

/// A message travelling through the broker
#[derive(Debug, Clone)]
pub struct BrokerMessage {
    pub id: String,
    /// Priority 1-10, higher first
    pub priority: u8,
    pub body: Value,
    /// Delivery attempts so far
    pub attempts: u32,
}

impl BrokerMessage {
    pub fn new(body: Value, priority: u8) -> Self {
        Self {
            id: crate::domain::generate_id("msg"),
            priority: priority.clamp(1, 10),
            body,
            attempts: 0,
        }
    }
}

/// Heap entry ordering: priority desc, then insertion order asc
struct QueuedMessage {
    seq: u64,
    message: BrokerMessage,
}

impl Eq for QueuedMessage {}

impl PartialEq for QueuedMessage {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Ord for QueuedMessage {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.message
            .priority
            .cmp(&other.message.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedMessage {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct QueueInner {
    heap: BinaryHeap<QueuedMessage>,
    next_seq: u64,
}

struct Queue {
    inner: Mutex<QueueInner>,
    notify: Notify,
}

/// Per-queue depth snapshot
#[derive(Debug, Clone)]
pub struct QueueDepths {
    pub depths: HashMap<String, usize>,
}

/// The in-process broker
pub struct Broker {
    queues: HashMap<&'static str, Queue>,
}

impl Broker {
    /// Create a broker with the standard queues
    pub fn new() -> Arc<Self> {
        let queues = QUEUES
            .iter()
            .map(|name| {
                (
                    *name,
                    Queue {
                        inner: Mutex::new(QueueInner {
                            heap: BinaryHeap::new(),
                            next_seq: 0,
                        }),
                        notify: Notify::new(),
                    },
                )
            })
            .collect();
        Arc::new(Self { queues })
    }

    fn queue(&self, name: &str) -> &Queue {
        self.queues
            .get(name)
            .unwrap_or_else(|| panic!("Unknown broker queue: {}", name))
    }

    /// Publish a message to a queue
    pub async fn publish(&self, queue_name: &str, message: BrokerMessage) {
        let queue = self.queue(queue_name);
        {
            let mut inner = queue.inner.lock().await;
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.heap.push(QueuedMessage { seq, message });
        }
        debug!(queue = queue_name, "Published message");
        queue.notify.notify_one();
    }

    /// Pop the highest-priority message, waiting if the queue is empty
    pub async fn consume(&self, queue_name: &str) -> BrokerMessage {
        let queue = self.queue(queue_name);
        loop {
            {
                let mut inner = queue.inner.lock().await;
                if let Some(entry) = inner.heap.pop() {
                    let mut message = entry.message;
                    message.attempts += 1;
                    return message;
                }
            }
            queue.notify.notified().await;
        }
    }

    /// Pop without waiting; None when the queue is empty
    pub async fn try_consume(&self, queue_name: &str) -> Option<BrokerMessage> {
        let queue = self.queue(queue_name);
        let mut inner = queue.inner.lock().await;
        inner.heap.pop().map(|entry| {
            let mut message = entry.message;
            message.attempts += 1;
            message
        })
    }

    /// Return a message after a failed consumption
    ///
    /// Redelivered once at its original priority; beyond the attempt cap
    /// it is parked on the dead-letter queue.
    pub async fn nack(&self, queue_name: &str, message: BrokerMessage) {
        if message.attempts >= MAX_DELIVERY_ATTEMPTS {
            warn!(queue = queue_name, message_id = %message.id, "Dead-lettering message");
            self.publish(DEAD_LETTER, message).await;
        } else {
            self.publish(queue_name, message).await;
        }
    }

    /// Current depth of every queue
    pub async fn depths(&self) -> QueueDepths {
        let mut depths = HashMap::new();
        for (name, queue) in &self.queues {
            let inner = queue.inner.lock().await;
            depths.insert(name.to_string(), inner.heap.len());
        }
        QueueDepths { depths }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{DEAD_LETTER, WORKFLOWS};
    use serde_json::json;

    #[tokio::test]
    async fn test_publish_consume_priority_order() {
        let broker = Broker::new();

        broker.publish(WORKFLOWS, BrokerMessage::new(json!({"n": "low"}), 3)).await;
        broker.publish(WORKFLOWS, BrokerMessage::new(json!({"n": "high"}), 9)).await;
        broker.publish(WORKFLOWS, BrokerMessage::new(json!({"n": "mid"}), 5)).await;

        assert_eq!(broker.consume(WORKFLOWS).await.body["n"], "high");
        assert_eq!(broker.consume(WORKFLOWS).await.body["n"], "mid");
        assert_eq!(broker.consume(WORKFLOWS).await.body["n"], "low");
    }

    #[tokio::test]
    async fn test_fifo_within_priority() {
        let broker = Broker::new();

        broker.publish(WORKFLOWS, BrokerMessage::new(json!({"n": 1}), 5)).await;
        broker.publish(WORKFLOWS, BrokerMessage::new(json!({"n": 2}), 5)).await;

        assert_eq!(broker.consume(WORKFLOWS).await.body["n"], 1);
        assert_eq!(broker.consume(WORKFLOWS).await.body["n"], 2);
    }

    #[tokio::test]
    async fn test_consume_waits_for_publish() {
        let broker = Broker::new();
        let consumer = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.consume(WORKFLOWS).await })
        };

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        broker.publish(WORKFLOWS, BrokerMessage::new(json!({"n": 1}), 5)).await;

        let message = consumer.await.unwrap();
        assert_eq!(message.body["n"], 1);
        assert_eq!(message.attempts, 1);
    }

    #[tokio::test]
    async fn test_nack_redelivers_then_dead_letters() {
        let broker = Broker::new();
        broker.publish(WORKFLOWS, BrokerMessage::new(json!({"n": 1}), 5)).await;

        // First consumption fails; message is redelivered
        let message = broker.consume(WORKFLOWS).await;
        broker.nack(WORKFLOWS, message).await;

        // Second consumption fails; message is dead-lettered
        let message = broker.consume(WORKFLOWS).await;
        assert_eq!(message.attempts, 2);
        broker.nack(WORKFLOWS, message).await;

        assert!(broker.try_consume(WORKFLOWS).await.is_none());
        let dead = broker.try_consume(DEAD_LETTER).await.unwrap();
        assert_eq!(dead.body["n"], 1);
    }

    #[tokio::test]
    async fn test_depths() {
        let broker = Broker::new();
        broker.publish(WORKFLOWS, BrokerMessage::new(json!({}), 5)).await;
        broker.publish(WORKFLOWS, BrokerMessage::new(json!({}), 5)).await;

        let depths = broker.depths().await;
        assert_eq!(depths.depths["workflows"], 2);
        assert_eq!(depths.depths["webhooks"], 0);
    }

    #[test]
    fn test_message_priority_clamped() {
        assert_eq!(BrokerMessage::new(json!({}), 0).priority, 1);
        assert_eq!(BrokerMessage::new(json!({}), 99).priority, 10);
    }
}
