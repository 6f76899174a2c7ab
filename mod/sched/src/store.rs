use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use opsflow_core::{ServiceError, now_ms};
use tokio::sync::Mutex;

use crate::model::{Task, TaskStatus};

/// Repository-shaped access to persisted task records.
///
/// The actual store is owned by an external collaborator (the platform's
/// task collection); this subsystem only relies on the indexed lookups and
/// the atomicity notes below:
///
/// - `update_status` advances `utime` (the recovery staleness clock).
/// - `claim_redispatch` is a compare-and-swap: it succeeds only while the
///   task is still SCHEDULED, bumping `retry_count` and `utime` in the same
///   atomic step. This is the at-most-once re-dispatch guard, and the only
///   path that raises `retry_count`.
/// - `reset_retry` is the explicit reopen signal (manual retry); the only
///   path that ever lowers `retry_count`.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn get(&self, id: i64) -> Result<Task, ServiceError>;

    /// The task currently attached to (process instance, node), if any.
    async fn find_by_node(
        &self,
        process_instance_id: i64,
        node_id: &str,
    ) -> Result<Option<Task>, ServiceError>;

    /// One page of tasks in a status, ordered by id.
    async fn page_by_status(
        &self,
        status: TaskStatus,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Task>, ServiceError>;

    /// One page of SUCCESS tasks not yet marked passed with
    /// `utime <= utime_before` (the auto-pass settle window).
    async fn page_pass_candidates(
        &self,
        utime_before: i64,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Task>, ServiceError>;

    async fn update_status(&self, id: i64, status: TaskStatus) -> Result<(), ServiceError>;

    async fn set_external_id(&self, id: i64, external_id: &str) -> Result<(), ServiceError>;

    /// Clear the retry counter when a task is reopened for another run.
    async fn reset_retry(&self, id: i64) -> Result<(), ServiceError>;

    async fn set_mark_passed(&self, id: i64) -> Result<(), ServiceError>;

    /// At-most-once re-dispatch guard: returns `true` and bumps
    /// `retry_count`/`utime` only if the task is still SCHEDULED.
    async fn claim_redispatch(&self, id: i64) -> Result<bool, ServiceError>;

    async fn insert(&self, task: Task) -> Result<(), ServiceError>;
}

/// In-memory task store (tests and local development).
#[derive(Default)]
pub struct MemTaskStore {
    tasks: Mutex<HashMap<i64, Task>>,
}

impl MemTaskStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn page<'a>(mut matching: Vec<&'a Task>, offset: usize, limit: usize) -> Vec<Task> {
        matching.sort_by_key(|t| t.id);
        matching
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl TaskStore for MemTaskStore {
    async fn get(&self, id: i64) -> Result<Task, ServiceError> {
        self.tasks
            .lock()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(format!("task {id}")))
    }

    async fn find_by_node(
        &self,
        process_instance_id: i64,
        node_id: &str,
    ) -> Result<Option<Task>, ServiceError> {
        Ok(self
            .tasks
            .lock()
            .await
            .values()
            .find(|t| t.process_instance_id == process_instance_id && t.node_id == node_id)
            .cloned())
    }

    async fn page_by_status(
        &self,
        status: TaskStatus,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Task>, ServiceError> {
        let tasks = self.tasks.lock().await;
        Ok(Self::page(
            tasks.values().filter(|t| t.status == status).collect(),
            offset,
            limit,
        ))
    }

    async fn page_pass_candidates(
        &self,
        utime_before: i64,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Task>, ServiceError> {
        let tasks = self.tasks.lock().await;
        Ok(Self::page(
            tasks
                .values()
                .filter(|t| {
                    t.status == TaskStatus::Success && !t.mark_passed && t.utime <= utime_before
                })
                .collect(),
            offset,
            limit,
        ))
    }

    async fn update_status(&self, id: i64, status: TaskStatus) -> Result<(), ServiceError> {
        let mut tasks = self.tasks.lock().await;
        let task = tasks
            .get_mut(&id)
            .ok_or_else(|| ServiceError::NotFound(format!("task {id}")))?;
        let now = now_ms();
        task.status = status;
        task.utime = now;
        if status == TaskStatus::Running && task.start_time.is_none() {
            task.start_time = Some(now);
        }
        if status.is_terminal() {
            task.end_time = Some(now);
        }
        Ok(())
    }

    async fn set_external_id(&self, id: i64, external_id: &str) -> Result<(), ServiceError> {
        let mut tasks = self.tasks.lock().await;
        let task = tasks
            .get_mut(&id)
            .ok_or_else(|| ServiceError::NotFound(format!("task {id}")))?;
        task.external_id = Some(external_id.to_string());
        task.utime = now_ms();
        Ok(())
    }

    async fn reset_retry(&self, id: i64) -> Result<(), ServiceError> {
        let mut tasks = self.tasks.lock().await;
        let task = tasks
            .get_mut(&id)
            .ok_or_else(|| ServiceError::NotFound(format!("task {id}")))?;
        task.retry_count = 0;
        Ok(())
    }

    async fn set_mark_passed(&self, id: i64) -> Result<(), ServiceError> {
        let mut tasks = self.tasks.lock().await;
        let task = tasks
            .get_mut(&id)
            .ok_or_else(|| ServiceError::NotFound(format!("task {id}")))?;
        task.mark_passed = true;
        Ok(())
    }

    async fn claim_redispatch(&self, id: i64) -> Result<bool, ServiceError> {
        let mut tasks = self.tasks.lock().await;
        let task = tasks
            .get_mut(&id)
            .ok_or_else(|| ServiceError::NotFound(format!("task {id}")))?;
        if task.status != TaskStatus::Scheduled {
            return Ok(false);
        }
        task.retry_count += 1;
        task.utime = now_ms();
        Ok(true)
    }

    async fn insert(&self, task: Task) -> Result<(), ServiceError> {
        let mut tasks = self.tasks.lock().await;
        if tasks.contains_key(&task.id) {
            return Err(ServiceError::Conflict(format!("task {} exists", task.id)));
        }
        tasks.insert(task.id, task);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RunMode;

    pub(crate) fn make_task(id: i64, status: TaskStatus) -> Task {
        Task {
            id,
            process_instance_id: 100,
            node_id: format!("node-{id}"),
            run_mode: RunMode::Worker { topic: "t1".into() },
            external_id: None,
            scheduled_time: None,
            status,
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

    #[tokio::test]
    async fn insert_get_find() {
        let store = MemTaskStore::new();
        store.insert(make_task(1, TaskStatus::Waiting)).await.unwrap();
        assert!(store.insert(make_task(1, TaskStatus::Waiting)).await.is_err());

        let got = store.get(1).await.unwrap();
        assert_eq!(got.status, TaskStatus::Waiting);

        let found = store.find_by_node(100, "node-1").await.unwrap();
        assert_eq!(found.unwrap().id, 1);
        assert!(store.find_by_node(100, "nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn paging_is_ordered_and_bounded() {
        let store = MemTaskStore::new();
        for id in 1..=5 {
            store.insert(make_task(id, TaskStatus::Waiting)).await.unwrap();
        }
        store.insert(make_task(6, TaskStatus::Running)).await.unwrap();

        let page = store
            .page_by_status(TaskStatus::Waiting, 0, 3)
            .await
            .unwrap();
        assert_eq!(page.iter().map(|t| t.id).collect::<Vec<_>>(), vec![1, 2, 3]);
        let page = store
            .page_by_status(TaskStatus::Waiting, 3, 3)
            .await
            .unwrap();
        assert_eq!(page.iter().map(|t| t.id).collect::<Vec<_>>(), vec![4, 5]);
    }

    #[tokio::test]
    async fn update_status_advances_utime_and_times() {
        let store = MemTaskStore::new();
        store.insert(make_task(1, TaskStatus::Waiting)).await.unwrap();
        let before = store.get(1).await.unwrap().utime;

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.update_status(1, TaskStatus::Running).await.unwrap();
        let task = store.get(1).await.unwrap();
        assert!(task.utime >= before);
        assert!(task.start_time.is_some());
        assert!(task.end_time.is_none());

        store.update_status(1, TaskStatus::Success).await.unwrap();
        assert!(store.get(1).await.unwrap().end_time.is_some());
    }

    #[tokio::test]
    async fn claim_redispatch_only_while_scheduled() {
        let store = MemTaskStore::new();
        store
            .insert(make_task(1, TaskStatus::Scheduled))
            .await
            .unwrap();

        assert!(store.claim_redispatch(1).await.unwrap());
        assert_eq!(store.get(1).await.unwrap().retry_count, 1);

        store.update_status(1, TaskStatus::Running).await.unwrap();
        assert!(!store.claim_redispatch(1).await.unwrap());
        assert_eq!(store.get(1).await.unwrap().retry_count, 1);
    }

    #[tokio::test]
    async fn reset_retry_clears_counter() {
        let store = MemTaskStore::new();
        store
            .insert(make_task(1, TaskStatus::Scheduled))
            .await
            .unwrap();
        store.claim_redispatch(1).await.unwrap();
        assert_eq!(store.get(1).await.unwrap().retry_count, 1);
        store.reset_retry(1).await.unwrap();
        assert_eq!(store.get(1).await.unwrap().retry_count, 0);
    }

    #[tokio::test]
    async fn pass_candidates_filtering() {
        let store = MemTaskStore::new();
        let mut old = make_task(1, TaskStatus::Success);
        old.utime = 1000;
        let mut fresh = make_task(2, TaskStatus::Success);
        fresh.utime = 9000;
        let mut passed = make_task(3, TaskStatus::Success);
        passed.utime = 1000;
        passed.mark_passed = true;
        store.insert(old).await.unwrap();
        store.insert(fresh).await.unwrap();
        store.insert(passed).await.unwrap();

        let page = store.page_pass_candidates(5000, 0, 10).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, 1);
    }
}
