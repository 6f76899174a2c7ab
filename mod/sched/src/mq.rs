use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use opsflow_core::ServiceError;

use crate::model::TaskEvent;

/// An outbound producer bound to one topic.
#[async_trait]
pub trait Producer: Send + Sync {
    async fn send(&self, event: &TaskEvent) -> Result<(), ServiceError>;
}

/// The message-queue broker, consumed as an external collaborator.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Create the topic if absent. Idempotent: "already exists" is success.
    async fn ensure_topic(&self, topic: &str) -> Result<(), ServiceError>;

    /// Instantiate a producer for a topic.
    async fn create_producer(&self, topic: &str) -> Result<Arc<dyn Producer>, ServiceError>;
}

/// In-memory broker (tests and local development). Records every delivery
/// per topic.
#[derive(Default)]
pub struct MemQueue {
    inner: Arc<Mutex<QueueState>>,
}

#[derive(Default)]
struct QueueState {
    topics: HashSet<String>,
    sent: HashMap<String, Vec<TaskEvent>>,
}

impl MemQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Everything delivered to a topic so far (test hook).
    pub fn sent_on(&self, topic: &str) -> Vec<TaskEvent> {
        self.inner
            .lock()
            .unwrap()
            .sent
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    /// Whether a topic has been created (test hook).
    pub fn has_topic(&self, topic: &str) -> bool {
        self.inner.lock().unwrap().topics.contains(topic)
    }
}

#[async_trait]
impl MessageQueue for MemQueue {
    async fn ensure_topic(&self, topic: &str) -> Result<(), ServiceError> {
        self.inner.lock().unwrap().topics.insert(topic.to_string());
        Ok(())
    }

    async fn create_producer(&self, topic: &str) -> Result<Arc<dyn Producer>, ServiceError> {
        if !self.inner.lock().unwrap().topics.contains(topic) {
            return Err(ServiceError::NotFound(format!("topic {topic}")));
        }
        Ok(Arc::new(MemProducer {
            topic: topic.to_string(),
            inner: Arc::clone(&self.inner),
        }))
    }
}

struct MemProducer {
    topic: String,
    inner: Arc<Mutex<QueueState>>,
}

#[async_trait]
impl Producer for MemProducer {
    async fn send(&self, event: &TaskEvent) -> Result<(), ServiceError> {
        self.inner
            .lock()
            .unwrap()
            .sent
            .entry(self.topic.clone())
            .or_default()
            .push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: i64) -> TaskEvent {
        TaskEvent {
            task_id: id,
            language: "shell".into(),
            code: "true".into(),
            args: serde_json::Value::Null,
            variables: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn ensure_topic_is_idempotent() {
        let queue = MemQueue::new();
        queue.ensure_topic("t1").await.unwrap();
        queue.ensure_topic("t1").await.unwrap();
        assert!(queue.has_topic("t1"));
    }

    #[tokio::test]
    async fn producer_requires_topic() {
        let queue = MemQueue::new();
        assert!(queue.create_producer("missing").await.is_err());

        queue.ensure_topic("t1").await.unwrap();
        let producer = queue.create_producer("t1").await.unwrap();
        producer.send(&event(1)).await.unwrap();
        producer.send(&event(2)).await.unwrap();

        let sent = queue.sent_on("t1");
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].task_id, 1);
    }
}
