/*!
 * # Message Queue
 *
 * Hand-off between request handling and background work. Webhook
 * reconciliation publishes a message once an order becomes paid; the
 * notification worker consumes it.
 */

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Topic carrying `PaymentCompleted` payloads
pub const PAYMENT_COMPLETED_TOPIC: &str = "orders.payment_completed";

/// Message queue errors
#[derive(Error, Debug)]
pub enum MessageQueueError {
    #[error("Queue is full")]
    QueueFull,
    #[error("Unknown message: {0}")]
    UnknownMessage(Uuid),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Backend error: {0}")]
    Backend(#[from] redis::RedisError),
    #[error("Unknown message queue backend '{0}'")]
    UnknownBackend(String),
}

/// Message envelope for queue items
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub topic: String,
    pub payload: serde_json::Value,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            payload,
            timestamp: chrono::Utc::now(),
            retry_count: 0,
            max_retries: 3,
        }
    }

    /// Wraps a typed payload
    pub fn from_payload<T: Serialize>(
        topic: impl Into<String>,
        payload: &T,
    ) -> Result<Self, MessageQueueError> {
        Ok(Self::new(topic, serde_json::to_value(payload)?))
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, MessageQueueError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Payload published when an order transitions to paid
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentCompleted {
    pub order_id: Uuid,
}

/// Message queue trait for different implementations
#[async_trait]
pub trait MessageQueue: Send + Sync {
    async fn publish(&self, message: Message) -> Result<(), MessageQueueError>;
    /// Takes the next message of `topic`; it stays in flight until acked or nacked.
    async fn subscribe(&self, topic: &str) -> Result<Option<Message>, MessageQueueError>;
    async fn ack(&self, message_id: &Uuid) -> Result<(), MessageQueueError>;
    /// Returns an in-flight message to its topic unless it ran out of retries.
    async fn nack(&self, message_id: &Uuid) -> Result<(), MessageQueueError>;
}

#[derive(Debug, Default)]
struct QueueState {
    topics: HashMap<String, VecDeque<Message>>,
    in_flight: HashMap<Uuid, Message>,
}

/// In-memory message queue implementation
#[derive(Debug, Clone)]
pub struct InMemoryMessageQueue {
    state: Arc<Mutex<QueueState>>,
    max_size: usize,
}

impl Default for InMemoryMessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryMessageQueue {
    pub fn new() -> Self {
        Self::with_max_size(1000)
    }

    pub fn with_max_size(max_size: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::default())),
            max_size,
        }
    }

    /// Number of messages waiting on `topic`
    pub async fn len(&self, topic: &str) -> usize {
        self.state
            .lock()
            .await
            .topics
            .get(topic)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    pub async fn is_empty(&self, topic: &str) -> bool {
        self.len(topic).await == 0
    }
}

#[async_trait]
impl MessageQueue for InMemoryMessageQueue {
    async fn publish(&self, message: Message) -> Result<(), MessageQueueError> {
        let mut state = self.state.lock().await;
        let queue = state.topics.entry(message.topic.clone()).or_default();

        if queue.len() >= self.max_size {
            return Err(MessageQueueError::QueueFull);
        }

        debug!(topic = %message.topic, message_id = %message.id, "message published");
        queue.push_back(message);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Option<Message>, MessageQueueError> {
        let mut state = self.state.lock().await;
        let next = state.topics.get_mut(topic).and_then(VecDeque::pop_front);
        if let Some(message) = &next {
            state.in_flight.insert(message.id, message.clone());
        }
        Ok(next)
    }

    async fn ack(&self, message_id: &Uuid) -> Result<(), MessageQueueError> {
        self.state
            .lock()
            .await
            .in_flight
            .remove(message_id)
            .map(|_| ())
            .ok_or(MessageQueueError::UnknownMessage(*message_id))
    }

    async fn nack(&self, message_id: &Uuid) -> Result<(), MessageQueueError> {
        let mut state = self.state.lock().await;
        let mut message = state
            .in_flight
            .remove(message_id)
            .ok_or(MessageQueueError::UnknownMessage(*message_id))?;

        message.retry_count += 1;
        if message.retry_count > message.max_retries {
            warn!(message_id = %message.id, topic = %message.topic, "message dropped after retries");
            return Ok(());
        }
        state
            .topics
            .entry(message.topic.clone())
            .or_default()
            .push_back(message);
        Ok(())
    }
}

/// Redis lists per topic, with taken messages parked in a hash until acked.
///
/// Keys live under `namespace`: `{ns}:topic:{topic}` holds waiting messages
/// (pushed left, popped right) and `{ns}:in_flight` maps message id to the
/// message. Messages left in flight by a previous process are requeued on
/// connect, so consumers must tolerate duplicates.
#[derive(Clone)]
pub struct RedisMessageQueue {
    conn: ConnectionManager,
    namespace: String,
}

impl RedisMessageQueue {
    pub async fn connect(
        redis_url: &str,
        namespace: impl Into<String>,
    ) -> Result<Self, MessageQueueError> {
        let client = redis::Client::open(redis_url)?;
        let queue = Self {
            conn: ConnectionManager::new(client).await?,
            namespace: namespace.into(),
        };
        let requeued = queue.requeue_in_flight().await?;
        info!(namespace = %queue.namespace, requeued, "Redis message queue connected");
        Ok(queue)
    }

    fn topic_key(&self, topic: &str) -> String {
        format!("{}:topic:{}", self.namespace, topic)
    }

    fn in_flight_key(&self) -> String {
        format!("{}:in_flight", self.namespace)
    }

    async fn push(&self, message: &Message) -> Result<(), MessageQueueError> {
        let raw = serde_json::to_string(message)?;
        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(self.topic_key(&message.topic), raw)
            .await?;
        Ok(())
    }

    /// Removes the message from the in-flight hash, returning it if it was there.
    async fn take_in_flight(&self, message_id: &Uuid) -> Result<Option<Message>, MessageQueueError> {
        let mut conn = self.conn.clone();
        let field = message_id.to_string();
        let raw: Option<String> = conn.hget(self.in_flight_key(), &field).await?;
        let removed: i64 = conn.hdel(self.in_flight_key(), &field).await?;
        match raw {
            Some(raw) if removed == 1 => Ok(Some(serde_json::from_str(&raw)?)),
            _ => Ok(None),
        }
    }

    async fn requeue_in_flight(&self) -> Result<usize, MessageQueueError> {
        let mut conn = self.conn.clone();
        let parked: HashMap<String, String> = conn.hgetall(self.in_flight_key()).await?;
        let mut requeued = 0;
        for (id, raw) in parked {
            let _: i64 = conn.hdel(self.in_flight_key(), &id).await?;
            match serde_json::from_str::<Message>(&raw) {
                Ok(message) => {
                    self.push(&message).await?;
                    requeued += 1;
                }
                Err(e) => warn!(message_id = %id, error = %e, "dropping unreadable in-flight message"),
            }
        }
        Ok(requeued)
    }
}

#[async_trait]
impl MessageQueue for RedisMessageQueue {
    async fn publish(&self, message: Message) -> Result<(), MessageQueueError> {
        self.push(&message).await?;
        debug!(topic = %message.topic, message_id = %message.id, "message published");
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Option<Message>, MessageQueueError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("RPOP")
            .arg(self.topic_key(topic))
            .query_async(&mut conn)
            .await?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let message: Message = serde_json::from_str(&raw)?;
        conn.hset::<_, _, _, ()>(self.in_flight_key(), message.id.to_string(), raw)
            .await?;
        Ok(Some(message))
    }

    async fn ack(&self, message_id: &Uuid) -> Result<(), MessageQueueError> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn
            .hdel(self.in_flight_key(), message_id.to_string())
            .await?;
        match removed {
            0 => Err(MessageQueueError::UnknownMessage(*message_id)),
            _ => Ok(()),
        }
    }

    async fn nack(&self, message_id: &Uuid) -> Result<(), MessageQueueError> {
        let mut message = self
            .take_in_flight(message_id)
            .await?
            .ok_or(MessageQueueError::UnknownMessage(*message_id))?;

        message.retry_count += 1;
        if message.retry_count > message.max_retries {
            warn!(message_id = %message.id, topic = %message.topic, "message dropped after retries");
            return Ok(());
        }
        self.push(&message).await
    }
}

/// Builds the queue selected in configuration.
pub async fn create_message_queue(
    backend: &str,
    redis_url: &str,
    namespace: &str,
) -> Result<Arc<dyn MessageQueue>, MessageQueueError> {
    match backend.to_ascii_lowercase().as_str() {
        "redis" => Ok(Arc::new(
            RedisMessageQueue::connect(redis_url, namespace).await?,
        )),
        "in-memory" => Ok(Arc::new(InMemoryMessageQueue::new())),
        other => Err(MessageQueueError::UnknownBackend(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_then_subscribe_in_order() {
        let queue = InMemoryMessageQueue::new();
        let first = Message::from_payload(
            PAYMENT_COMPLETED_TOPIC,
            &PaymentCompleted {
                order_id: Uuid::new_v4(),
            },
        )
        .unwrap();
        let second = Message::new(PAYMENT_COMPLETED_TOPIC, serde_json::json!({"n": 2}));

        queue.publish(first.clone()).await.unwrap();
        queue.publish(second).await.unwrap();
        assert_eq!(queue.len(PAYMENT_COMPLETED_TOPIC).await, 2);

        let received = queue.subscribe(PAYMENT_COMPLETED_TOPIC).await.unwrap().unwrap();
        assert_eq!(received.id, first.id);
        let payload: PaymentCompleted = received.decode().unwrap();
        assert_eq!(payload, first.decode::<PaymentCompleted>().unwrap());
        queue.ack(&received.id).await.unwrap();

        assert_eq!(queue.len(PAYMENT_COMPLETED_TOPIC).await, 1);
        assert!(queue.subscribe("other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn nack_requeues_until_retries_exhausted() {
        let queue = InMemoryMessageQueue::new();
        let mut message = Message::new("t", serde_json::json!({}));
        message.max_retries = 1;
        queue.publish(message).await.unwrap();

        let m = queue.subscribe("t").await.unwrap().unwrap();
        queue.nack(&m.id).await.unwrap();
        let m = queue.subscribe("t").await.unwrap().unwrap();
        assert_eq!(m.retry_count, 1);
        queue.nack(&m.id).await.unwrap();

        assert!(queue.is_empty("t").await);
    }

    #[tokio::test]
    async fn full_queue_rejects_publish() {
        let queue = InMemoryMessageQueue::with_max_size(1);
        queue.publish(Message::new("t", serde_json::json!(1))).await.unwrap();
        let err = queue
            .publish(Message::new("t", serde_json::json!(2)))
            .await
            .unwrap_err();
        assert!(matches!(err, MessageQueueError::QueueFull));
    }

    #[tokio::test]
    async fn unknown_backend_is_rejected() {
        let result = create_message_queue("kafka", "redis://127.0.0.1:6379", "ns").await;
        assert!(matches!(result, Err(MessageQueueError::UnknownBackend(name)) if name == "kafka"));
    }

    #[tokio::test]
    async fn in_memory_backend_is_selectable() {
        let queue = create_message_queue("In-Memory", "redis://127.0.0.1:6379", "ns")
            .await
            .unwrap();
        queue.publish(Message::new("t", serde_json::json!(1))).await.unwrap();
        assert!(queue.subscribe("t").await.unwrap().is_some());
    }
}
