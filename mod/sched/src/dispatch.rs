use std::collections::HashMap;
use std::sync::Arc;

use opsflow_core::{ServiceError, now_ms};
use tracing::{debug, warn};

use crate::executor::{RemoteExecutor, RemoteTaskSpec};
use crate::model::{RunMode, Task, TaskEvent, TaskStatus, TaskVariable};
use crate::producer::ProducerManager;
use crate::store::TaskStore;
use crate::timer::{FireFn, TimerEntry, TimerQueue};
use crate::workflow::Crypto;

/// Grace period given to the remote platform to ingest a one-shot job
/// before its fire time arrives.
const EXECUTE_GRACE_MS: i64 = 2_000;

/// Routes a task to its dispatch path based on `RunMode`. Pure routing —
/// no retry; any failure is returned to the caller unchanged.
///
/// EXECUTE-mode dispatch is the only path that mutates persisted state
/// (writing `ExternalId`). WORKER-mode dispatch is fire-and-forget from
/// the dispatcher's point of view; status transitions are owned by the
/// service layer.
pub struct Dispatcher {
    store: Arc<dyn TaskStore>,
    producers: Arc<ProducerManager>,
    executor: Arc<dyn RemoteExecutor>,
    crypto: Arc<dyn Crypto>,
    timers: TimerQueue,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn TaskStore>,
        producers: Arc<ProducerManager>,
        executor: Arc<dyn RemoteExecutor>,
        crypto: Arc<dyn Crypto>,
    ) -> Self {
        // Deferred WORKER dispatches fire by producing onto their topic and
        // then marking the task RUNNING, same as the immediate path.
        let fire_producers = Arc::clone(&producers);
        let fire_store = Arc::clone(&store);
        let fire: FireFn = Arc::new(move |entry: TimerEntry| {
            let producers = Arc::clone(&fire_producers);
            let store = Arc::clone(&fire_store);
            tokio::spawn(async move {
                let task_id = entry.event.task_id;
                match producers.produce(&entry.topic, &entry.event).await {
                    Ok(()) => {
                        if let Err(e) = store.update_status(task_id, TaskStatus::Running).await {
                            warn!("timed dispatch: task {task_id} status update failed: {e}");
                        }
                    }
                    Err(e) => {
                        warn!(
                            "timed dispatch of task {task_id} to {} failed: {e}",
                            entry.topic
                        );
                    }
                }
            });
        });

        Self {
            store,
            producers,
            executor,
            crypto,
            timers: TimerQueue::start(fire),
        }
    }

    /// Dispatch a task along the path its run mode selects.
    pub async fn dispatch(&self, task: &Task) -> Result<(), ServiceError> {
        match &task.run_mode {
            RunMode::Execute { service, handler } => {
                self.dispatch_execute(task, service, handler).await
            }
            RunMode::Worker { topic } => self.dispatch_worker(task, topic).await,
        }
    }

    /// Stop the deferred-dispatch timer queue.
    pub fn shutdown(&self) {
        self.timers.shutdown();
    }

    async fn dispatch_execute(
        &self,
        task: &Task,
        service: &str,
        handler: &str,
    ) -> Result<(), ServiceError> {
        // One-shot fire expression: future ScheduledTime is honored, past
        // or absent means "immediate" with a short ingestion grace.
        let now = now_ms();
        let fire_time = match task.scheduled_time {
            Some(at) if at > now => at,
            _ => now + EXECUTE_GRACE_MS,
        };

        let spec = RemoteTaskSpec {
            task_id: task.id,
            service: service.to_string(),
            handler: handler.to_string(),
            fire_time,
            language: task.language.clone(),
            code: task.code.clone(),
            args: task.args.clone(),
            variables: resolve_variables(self.crypto.as_ref(), &task.variables).await,
        };

        let external_id = self.executor.create_task(&spec).await?;
        debug!("task {} submitted to executor as {external_id}", task.id);
        self.store.set_external_id(task.id, &external_id).await
    }

    async fn dispatch_worker(&self, task: &Task, topic: &str) -> Result<(), ServiceError> {
        let event = TaskEvent {
            task_id: task.id,
            language: task.language.clone(),
            code: task.code.clone(),
            args: task.args.clone(),
            variables: resolve_variables(self.crypto.as_ref(), &task.variables).await,
        };

        match task.scheduled_time {
            Some(at) if at > now_ms() => {
                debug!("task {} deferred on topic {topic} until {at}", task.id);
                self.timers.schedule(TimerEntry {
                    fire_at: at,
                    topic: topic.to_string(),
                    event,
                })
            }
            _ => self.producers.produce(topic, &event).await,
        }
    }
}

/// Decrypt secret variables just before they go onto the wire. A decrypt
/// failure degrades that single variable to an empty value; it never
/// aborts the dispatch.
pub(crate) async fn resolve_variables(
    crypto: &dyn Crypto,
    variables: &[TaskVariable],
) -> HashMap<String, String> {
    let mut out = HashMap::with_capacity(variables.len());
    for var in variables {
        let value = if var.secret {
            match crypto.decrypt(&var.value).await {
                Ok(plain) => plain,
                Err(e) => {
                    warn!("decrypt of variable {} failed: {e}", var.key);
                    String::new()
                }
            }
        } else {
            var.value.clone()
        };
        out.insert(var.key.clone(), value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::MemExecutor;
    use crate::mq::{MemQueue, MessageQueue};
    use crate::store::MemTaskStore;
    use crate::workflow::PlainCrypto;
    use async_trait::async_trait;
    use std::time::Duration;

    fn worker_task(id: i64, topic: &str) -> Task {
        Task {
            id,
            process_instance_id: 1,
            node_id: format!("node-{id}"),
            run_mode: RunMode::Worker {
                topic: topic.into(),
            },
            external_id: None,
            scheduled_time: None,
            status: TaskStatus::Scheduled,
            start_time: None,
            end_time: None,
            retry_count: 0,
            mark_passed: false,
            utime: now_ms(),
            language: "shell".into(),
            code: "echo hi".into(),
            args: serde_json::Value::Null,
            variables: vec![],
        }
    }

    fn execute_task(id: i64) -> Task {
        Task {
            run_mode: RunMode::Execute {
                service: "job".into(),
                handler: "run_script".into(),
            },
            ..worker_task(id, "unused")
        }
    }

    struct Fixture {
        store: Arc<MemTaskStore>,
        queue: Arc<MemQueue>,
        executor: Arc<MemExecutor>,
        dispatcher: Dispatcher,
    }

    async fn fixture() -> Fixture {
        let store = MemTaskStore::new();
        let queue = MemQueue::new();
        let executor = MemExecutor::new();
        let producers = Arc::new(ProducerManager::new(queue.clone()));
        queue.ensure_topic("t1").await.unwrap();
        producers.add_producer("t1").await.unwrap();
        let dispatcher = Dispatcher::new(
            store.clone(),
            producers,
            executor.clone(),
            Arc::new(PlainCrypto),
        );
        Fixture {
            store,
            queue,
            executor,
            dispatcher,
        }
    }

    #[tokio::test]
    async fn worker_immediate_produces_and_keeps_external_id_empty() {
        let fx = fixture().await;
        let task = worker_task(1, "t1");
        fx.store.insert(task.clone()).await.unwrap();

        fx.dispatcher.dispatch(&task).await.unwrap();

        assert_eq!(fx.queue.sent_on("t1").len(), 1);
        // A WORKER task must never acquire an ExternalId.
        assert!(fx.store.get(1).await.unwrap().external_id.is_none());
    }

    #[tokio::test]
    async fn worker_unroutable_topic_is_not_found() {
        let fx = fixture().await;
        let task = worker_task(1, "no-such-topic");
        let err = fx.dispatcher.dispatch(&task).await.unwrap_err();
        assert_eq!(err.error_code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn worker_timed_fires_later_and_marks_running() {
        let fx = fixture().await;
        let mut task = worker_task(1, "t1");
        task.scheduled_time = Some(now_ms() + 50);
        fx.store.insert(task.clone()).await.unwrap();

        fx.dispatcher.dispatch(&task).await.unwrap();
        assert!(fx.queue.sent_on("t1").is_empty());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fx.queue.sent_on("t1").len(), 1);
        assert_eq!(fx.store.get(1).await.unwrap().status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn worker_past_scheduled_time_is_immediate() {
        let fx = fixture().await;
        let mut task = worker_task(1, "t1");
        task.scheduled_time = Some(now_ms() - 5_000);
        fx.store.insert(task.clone()).await.unwrap();

        fx.dispatcher.dispatch(&task).await.unwrap();
        assert_eq!(fx.queue.sent_on("t1").len(), 1);
    }

    #[tokio::test]
    async fn execute_persists_external_id_and_skips_queue() {
        let fx = fixture().await;
        let task = execute_task(1);
        fx.store.insert(task.clone()).await.unwrap();

        fx.dispatcher.dispatch(&task).await.unwrap();

        let stored = fx.store.get(1).await.unwrap();
        let external_id = stored.external_id.expect("external id persisted");
        // An EXECUTE task must never reach a message-queue producer.
        assert!(fx.queue.sent_on("t1").is_empty());

        let spec = fx.executor.submitted(&external_id).unwrap();
        assert_eq!(spec.task_id, 1);
        // Immediate: submitted roughly two seconds out.
        assert!(spec.fire_time > now_ms());
        assert!(spec.fire_time <= now_ms() + EXECUTE_GRACE_MS + 500);
    }

    #[tokio::test]
    async fn execute_honors_future_scheduled_time() {
        let fx = fixture().await;
        let mut task = execute_task(1);
        let at = now_ms() + 60_000;
        task.scheduled_time = Some(at);
        fx.store.insert(task.clone()).await.unwrap();

        fx.dispatcher.dispatch(&task).await.unwrap();
        let external_id = fx.store.get(1).await.unwrap().external_id.unwrap();
        assert_eq!(fx.executor.submitted(&external_id).unwrap().fire_time, at);
    }

    #[tokio::test]
    async fn execute_submission_failure_is_returned_unchanged() {
        let fx = fixture().await;
        fx.executor.reject_submissions(true);
        let task = execute_task(1);
        fx.store.insert(task.clone()).await.unwrap();

        let err = fx.dispatcher.dispatch(&task).await.unwrap_err();
        assert!(err.is_transient());
        assert!(fx.store.get(1).await.unwrap().external_id.is_none());
    }

    struct FailingCrypto;

    #[async_trait]
    impl Crypto for FailingCrypto {
        async fn decrypt(&self, _ciphertext: &str) -> Result<String, ServiceError> {
            Err(ServiceError::Unavailable("kms down".into()))
        }
    }

    #[tokio::test]
    async fn secret_variables_are_decrypted_or_degraded() {
        let vars = vec![
            TaskVariable {
                key: "PLAIN".into(),
                value: "v1".into(),
                secret: false,
            },
            TaskVariable {
                key: "SECRET".into(),
                value: "ciphertext".into(),
                secret: true,
            },
        ];

        let resolved = resolve_variables(&PlainCrypto, &vars).await;
        assert_eq!(resolved["PLAIN"], "v1");
        assert_eq!(resolved["SECRET"], "ciphertext");

        // Decrypt failure degrades to empty, never aborts.
        let resolved = resolve_variables(&FailingCrypto, &vars).await;
        assert_eq!(resolved["PLAIN"], "v1");
        assert_eq!(resolved["SECRET"], "");
    }
}
