use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use opsflow_core::ServiceError;
use tracing::info;

use crate::model::TaskEvent;
use crate::mq::{MessageQueue, Producer};

/// Owns one outbound producer per topic.
///
/// The map is shared between the dispatcher (produce) and the agent
/// discovery controller (add/del); a single read/write lock keeps
/// concurrent calls from corrupting it. Producers are cloned out of the
/// map before any await so sends never hold the lock.
pub struct ProducerManager {
    queue: Arc<dyn MessageQueue>,
    producers: RwLock<HashMap<String, Arc<dyn Producer>>>,
}

impl ProducerManager {
    pub fn new(queue: Arc<dyn MessageQueue>) -> Self {
        Self {
            queue,
            producers: RwLock::new(HashMap::new()),
        }
    }

    /// Instantiate and register a producer for a topic. Fails with
    /// `Conflict` if one already exists.
    pub async fn add_producer(&self, topic: &str) -> Result<(), ServiceError> {
        if self.producers.read().unwrap().contains_key(topic) {
            return Err(ServiceError::Conflict(format!(
                "producer for topic {topic} exists"
            )));
        }
        let producer = self.queue.create_producer(topic).await?;
        let mut producers = self.producers.write().unwrap();
        if producers.contains_key(topic) {
            return Err(ServiceError::Conflict(format!(
                "producer for topic {topic} exists"
            )));
        }
        producers.insert(topic.to_string(), producer);
        info!("producer added for topic {topic}");
        Ok(())
    }

    /// Drop a topic's producer. Fails with `NotFound` if none exists.
    pub fn del_producer(&self, topic: &str) -> Result<(), ServiceError> {
        match self.producers.write().unwrap().remove(topic) {
            Some(_) => {
                info!("producer removed for topic {topic}");
                Ok(())
            }
            None => Err(ServiceError::NotFound(format!(
                "no producer for topic {topic}"
            ))),
        }
    }

    /// Send an event onto a topic. Fails with `NotFound` if the topic has
    /// no registered producer (an unroutable task).
    pub async fn produce(&self, topic: &str, event: &TaskEvent) -> Result<(), ServiceError> {
        let producer = self
            .producers
            .read()
            .unwrap()
            .get(topic)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(format!("no producer for topic {topic}")))?;
        producer.send(event).await
    }

    pub fn has_producer(&self, topic: &str) -> bool {
        self.producers.read().unwrap().contains_key(topic)
    }

    pub fn topics(&self) -> Vec<String> {
        self.producers.read().unwrap().keys().cloned().collect()
    }
}
