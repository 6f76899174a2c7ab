use std::sync::Arc;
use std::time::Duration;

use opsflow_core::ServiceError;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::executor::{ExecStatus, RemoteExecutor};
use crate::model::{RunMode, Task, TaskStatus};
use crate::store::TaskStore;

/// Sync-job configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Poll interval.
    pub interval: Duration,
    /// Page size for RUNNING scans.
    pub page_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            page_size: 200,
        }
    }
}

/// Polls the remote execution platform and settles RUNNING EXECUTE tasks.
///
/// WORKER tasks report their own completion over the queue and are never
/// touched here. Only the latest execution attempt counts; a job still
/// running (or with no attempts yet) is left alone for the next pass.
pub struct SyncJob {
    store: Arc<dyn TaskStore>,
    executor: Arc<dyn RemoteExecutor>,
    config: SyncConfig,
}

impl SyncJob {
    pub fn new(
        store: Arc<dyn TaskStore>,
        executor: Arc<dyn RemoteExecutor>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            executor,
            config,
        }
    }

    /// Map a remote execution status to the local terminal status, if the
    /// execution has in fact finished.
    fn map_status(status: ExecStatus) -> Option<TaskStatus> {
        match status {
            ExecStatus::Success => Some(TaskStatus::Success),
            // The platform's own retry/reschedule variants have run out of
            // road by the time they surface on the latest attempt.
            ExecStatus::Failed | ExecStatus::FailedRetryable | ExecStatus::FailedReschedulable => {
                Some(TaskStatus::Failed)
            }
            ExecStatus::Running | ExecStatus::Unknown => None,
        }
    }

    /// One full pass. Returns the number of tasks settled.
    pub async fn run_once(&self) -> Result<usize, ServiceError> {
        let running =
            super::collect_by_status(&self.store, TaskStatus::Running, self.config.page_size)
                .await?;
        let mut settled = 0;

        for page in running.chunks(self.config.page_size) {
            let mut set = JoinSet::new();
            for task in page.iter().cloned() {
                if !matches!(task.run_mode, RunMode::Execute { .. }) {
                    continue;
                }
                let store = Arc::clone(&self.store);
                let executor = Arc::clone(&self.executor);
                set.spawn(async move { Self::sync_task(&*store, &*executor, &task).await });
            }
            while let Some(result) = set.join_next().await {
                if matches!(result, Ok(true)) {
                    settled += 1;
                }
            }
        }
        Ok(settled)
    }

    /// Settle one task from its remote executions. Returns whether a
    /// terminal status was written.
    async fn sync_task(store: &dyn TaskStore, executor: &dyn RemoteExecutor, task: &Task) -> bool {
        let Some(external_id) = task.external_id.as_deref() else {
            // RUNNING EXECUTE task without an ExternalId should not exist;
            // leave it for an operator rather than guessing.
            warn!("task {} is RUNNING with no external id", task.id);
            return false;
        };

        let executions = match executor.list_executions(external_id).await {
            Ok(executions) => executions,
            Err(e) => {
                warn!("listing executions of {external_id} failed: {e}");
                return false;
            }
        };

        let latest = executions.into_iter().max_by_key(|e| e.attempt);
        let Some(latest) = latest else {
            debug!("task {} has no executions yet", task.id);
            return false;
        };

        let Some(status) = Self::map_status(latest.status) else {
            return false;
        };

        match store.update_status(task.id, status).await {
            Ok(()) => {
                info!("task {} settled as {status} from {external_id}", task.id);
                true
            }
            Err(e) => {
                warn!("settling task {} as {status} failed: {e}", task.id);
                false
            }
        }
    }

    /// Run the periodic loop until the token is cancelled.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) {
        tokio::spawn(async move {
            info!("sync job started (interval={:?})", self.config.interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("sync job stopped");
                        break;
                    }
                    _ = tokio::time::sleep(self.config.interval) => {
                        match self.run_once().await {
                            Ok(0) => {}
                            Ok(n) => info!("sync job: settled {n} tasks"),
                            Err(e) => error!("sync job pass failed: {e}"),
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::MemExecutor;
    use crate::store::MemTaskStore;
    use opsflow_core::now_ms;

    fn running_execute_task(id: i64, external_id: &str) -> Task {
        Task {
            id,
            process_instance_id: id,
            node_id: format!("node-{id}"),
            run_mode: RunMode::Execute {
                service: "job".into(),
                handler: "run_script".into(),
            },
            external_id: Some(external_id.into()),
            scheduled_time: None,
            status: TaskStatus::Running,
            start_time: Some(now_ms()),
            end_time: None,
            retry_count: 0,
            mark_passed: false,
            utime: now_ms(),
            language: "shell".into(),
            code: "true".into(),
            args: serde_json::Value::Null,
            variables: vec![],
        }
    }

    async fn submit(executor: &MemExecutor, task: &Task) -> String {
        let spec = crate::executor::RemoteTaskSpec {
            task_id: task.id,
            service: "job".into(),
            handler: "run_script".into(),
            fire_time: now_ms(),
            language: task.language.clone(),
            code: task.code.clone(),
            args: task.args.clone(),
            variables: Default::default(),
        };
        executor.create_task(&spec).await.unwrap()
    }

    #[test]
    fn status_mapping() {
        assert_eq!(
            SyncJob::map_status(ExecStatus::Success),
            Some(TaskStatus::Success)
        );
        assert_eq!(
            SyncJob::map_status(ExecStatus::Failed),
            Some(TaskStatus::Failed)
        );
        assert_eq!(
            SyncJob::map_status(ExecStatus::FailedRetryable),
            Some(TaskStatus::Failed)
        );
        assert_eq!(
            SyncJob::map_status(ExecStatus::FailedReschedulable),
            Some(TaskStatus::Failed)
        );
        assert_eq!(SyncJob::map_status(ExecStatus::Running), None);
        assert_eq!(SyncJob::map_status(ExecStatus::Unknown), None);
    }

    #[tokio::test]
    async fn settles_from_latest_execution() {
        let store = MemTaskStore::new();
        let executor = MemExecutor::new();
        let mut task = running_execute_task(1, "placeholder");
        let external_id = submit(&executor, &task).await;
        task.external_id = Some(external_id.clone());
        store.insert(task).await.unwrap();

        // First attempt failed, platform retried and the latest succeeded.
        executor.push_execution(&external_id, 1, ExecStatus::Failed);
        executor.push_execution(&external_id, 2, ExecStatus::Success);

        let job = SyncJob::new(store.clone(), executor, SyncConfig::default());
        assert_eq!(job.run_once().await.unwrap(), 1);

        let stored = store.get(1).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Success);
        assert!(stored.end_time.is_some());
    }

    #[tokio::test]
    async fn running_execution_is_left_alone() {
        let store = MemTaskStore::new();
        let executor = MemExecutor::new();
        let mut task = running_execute_task(1, "placeholder");
        let external_id = submit(&executor, &task).await;
        task.external_id = Some(external_id.clone());
        store.insert(task).await.unwrap();

        executor.push_execution(&external_id, 1, ExecStatus::Running);

        let job = SyncJob::new(store.clone(), executor, SyncConfig::default());
        assert_eq!(job.run_once().await.unwrap(), 0);
        assert_eq!(store.get(1).await.unwrap().status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn no_executions_yet_is_left_alone() {
        let store = MemTaskStore::new();
        let executor = MemExecutor::new();
        let mut task = running_execute_task(1, "placeholder");
        let external_id = submit(&executor, &task).await;
        task.external_id = Some(external_id);
        store.insert(task).await.unwrap();

        let job = SyncJob::new(store.clone(), executor, SyncConfig::default());
        assert_eq!(job.run_once().await.unwrap(), 0);
        assert_eq!(store.get(1).await.unwrap().status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn worker_tasks_are_never_polled() {
        let store = MemTaskStore::new();
        let executor = MemExecutor::new();
        let mut task = running_execute_task(1, "unused");
        task.run_mode = RunMode::Worker { topic: "t1".into() };
        task.external_id = None;
        store.insert(task).await.unwrap();

        let job = SyncJob::new(store.clone(), executor, SyncConfig::default());
        assert_eq!(job.run_once().await.unwrap(), 0);
        assert_eq!(store.get(1).await.unwrap().status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn executor_failure_skips_task_without_failing_pass() {
        let store = MemTaskStore::new();
        let executor = MemExecutor::new();
        // ExternalId pointing at a job the platform no longer knows.
        store
            .insert(running_execute_task(1, "job-404"))
            .await
            .unwrap();

        let job = SyncJob::new(store.clone(), executor, SyncConfig::default());
        assert_eq!(job.run_once().await.unwrap(), 0);
        assert_eq!(store.get(1).await.unwrap().status, TaskStatus::Running);
    }
}
