use std::sync::Arc;

use opsflow_core::ServiceError;
use tracing::{debug, info, warn};

use crate::dispatch::Dispatcher;
use crate::jobs::{Backoff, retry_with_backoff};
use crate::model::{Task, TaskStatus};
use crate::store::TaskStore;

/// Owns the status transitions around dispatch.
///
/// The dispatcher is pure routing; this layer decides what a dispatch
/// outcome means for the task record:
///
/// - success → RUNNING (immediate paths) or SCHEDULED until the timer
///   fires (deferred WORKER tasks);
/// - unroutable (`NotFound`) → BLOCKED, operator action required;
/// - transient failure → the task stays SCHEDULED and the recovery job
///   rescues it after the grace window.
pub struct TaskService {
    store: Arc<dyn TaskStore>,
    dispatcher: Arc<Dispatcher>,
}

impl TaskService {
    pub fn new(store: Arc<dyn TaskStore>, dispatcher: Arc<Dispatcher>) -> Self {
        Self { store, dispatcher }
    }

    /// Start the WAITING task at (process instance, node): mark it
    /// SCHEDULED, then dispatch with bounded exponential backoff on
    /// transient failures. A task that is no longer WAITING is a no-op.
    pub async fn start(
        &self,
        process_instance_id: i64,
        node_id: &str,
        backoff: &Backoff,
    ) -> Result<(), ServiceError> {
        let task = self
            .store
            .find_by_node(process_instance_id, node_id)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("no task at ({process_instance_id}, {node_id})"))
            })?;

        if task.status != TaskStatus::Waiting {
            debug!("task {} is {}, start skipped", task.id, task.status);
            return Ok(());
        }

        self.store
            .update_status(task.id, TaskStatus::Scheduled)
            .await?;

        let this = self;
        let task_ref = &task;
        retry_with_backoff(backoff, move || async move {
            this.dispatch_and_settle(task_ref).await
        })
        .await
    }

    /// Re-dispatch a task stuck in SCHEDULED. Guarded by the store's
    /// compare-and-swap so at most one re-dispatch per task proceeds even
    /// when scheduler passes overlap; returns `false` when the guard finds
    /// the task already moved on.
    pub async fn redispatch(&self, task: &Task) -> Result<bool, ServiceError> {
        if !self.store.claim_redispatch(task.id).await? {
            debug!("task {} left SCHEDULED, redispatch skipped", task.id);
            return Ok(false);
        }
        self.dispatch_and_settle(task).await?;
        Ok(true)
    }

    /// Reopen a FAILED or BLOCKED task: clear its retry counter and put it
    /// back in WAITING for the next start pass to pick up.
    pub async fn retry(&self, task_id: i64) -> Result<(), ServiceError> {
        let task = self.store.get(task_id).await?;
        if !matches!(task.status, TaskStatus::Failed | TaskStatus::Blocked) {
            return Err(ServiceError::Validation(format!(
                "task {task_id} is {}, only FAILED or BLOCKED tasks can be retried",
                task.status
            )));
        }
        self.store.reset_retry(task_id).await?;
        self.store.update_status(task_id, TaskStatus::Waiting).await?;
        info!("task {task_id} reopened for retry");
        Ok(())
    }

    /// One dispatch attempt plus the resulting status transition.
    async fn dispatch_and_settle(&self, task: &Task) -> Result<(), ServiceError> {
        match self.dispatcher.dispatch(task).await {
            Ok(()) => {
                // Deferred WORKER tasks stay SCHEDULED; the timer marks
                // them RUNNING when it fires.
                let deferred_worker = matches!(task.run_mode, crate::model::RunMode::Worker { .. })
                    && task.scheduled_time.is_some_and(|at| at > opsflow_core::now_ms());
                if !deferred_worker {
                    self.store
                        .update_status(task.id, TaskStatus::Running)
                        .await?;
                }
                Ok(())
            }
            Err(e @ ServiceError::NotFound(_)) => {
                warn!("task {} is unroutable, marking BLOCKED: {e}", task.id);
                self.store
                    .update_status(task.id, TaskStatus::Blocked)
                    .await?;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }
}
