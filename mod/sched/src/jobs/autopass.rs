use std::sync::Arc;
use std::time::Duration;

use opsflow_core::{ServiceError, now_ms};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::model::Task;
use crate::store::TaskStore;
use crate::workflow::WorkflowEngine;

/// Auto-pass configuration.
#[derive(Debug, Clone)]
pub struct AutoPassConfig {
    /// Scan interval.
    pub interval: Duration,
    /// Page size for candidate scans.
    pub page_size: usize,
    /// Settle window: a SUCCESS task must be this old (by `utime`) before
    /// its workflow step is passed. Minutes and seconds are kept separate
    /// because operators tune them separately.
    pub delay_minutes: i64,
    pub delay_seconds: i64,
}

impl Default for AutoPassConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            page_size: 200,
            delay_minutes: 5,
            delay_seconds: 0,
        }
    }
}

impl AutoPassConfig {
    fn delay_ms(&self) -> i64 {
        (self.delay_minutes * 60 + self.delay_seconds) * 1000
    }
}

/// Advances the workflow past steps whose task has settled in SUCCESS.
///
/// The settle window gives late status writes (a racing sync pass, a
/// worker's completion report) time to land before the step is passed.
/// `MarkPassed` makes each pass one-shot: once set, the candidate query
/// never returns the task again.
pub struct AutoPassJob {
    store: Arc<dyn TaskStore>,
    workflow: Arc<dyn WorkflowEngine>,
    config: AutoPassConfig,
}

impl AutoPassJob {
    pub fn new(
        store: Arc<dyn TaskStore>,
        workflow: Arc<dyn WorkflowEngine>,
        config: AutoPassConfig,
    ) -> Self {
        Self {
            store,
            workflow,
            config,
        }
    }

    /// One full pass. Returns the number of steps passed.
    pub async fn run_once(&self) -> Result<usize, ServiceError> {
        let threshold = now_ms() - self.config.delay_ms();
        let candidates =
            super::collect_pass_candidates(&self.store, threshold, self.config.page_size).await?;
        let mut passed = 0;

        for page in candidates.chunks(self.config.page_size) {
            let mut set = JoinSet::new();
            for task in page.iter().cloned() {
                let store = Arc::clone(&self.store);
                let workflow = Arc::clone(&self.workflow);
                set.spawn(async move { Self::pass_task(&*store, &*workflow, &task).await });
            }
            while let Some(result) = set.join_next().await {
                if matches!(result, Ok(true)) {
                    passed += 1;
                }
            }
        }
        Ok(passed)
    }

    /// Pass one task's workflow step. Returns whether the step was passed.
    async fn pass_task(store: &dyn TaskStore, workflow: &dyn WorkflowEngine, task: &Task) -> bool {
        let step = match workflow.get_step(task.process_instance_id, &task.node_id).await {
            Ok(Some(step)) => step,
            Ok(None) => {
                // The step was resolved by hand or the process moved on.
                // Mark the task so it leaves the candidate set for good.
                debug!("task {} has no workflow step, marking passed", task.id);
                if let Err(e) = store.set_mark_passed(task.id).await {
                    warn!("marking task {} passed failed: {e}", task.id);
                }
                return false;
            }
            Err(e) => {
                warn!("step lookup for task {} failed: {e}", task.id);
                return false;
            }
        };

        if let Err(e) = workflow.pass_step(&step, "task completed").await {
            warn!("passing step {} for task {} failed: {e}", step.id, task.id);
            return false;
        }

        // Pass first, mark second: if the mark write is lost the worst case
        // is one redundant pass_step, which the engine tolerates.
        if let Err(e) = store.set_mark_passed(task.id).await {
            warn!("marking task {} passed failed: {e}", task.id);
        }
        info!("passed step {} for task {}", step.id, task.id);
        true
    }

    /// Run the periodic loop until the token is cancelled.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) {
        tokio::spawn(async move {
            info!(
                "auto-pass job started (interval={:?})",
                self.config.interval
            );
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("auto-pass job stopped");
                        break;
                    }
                    _ = tokio::time::sleep(self.config.interval) => {
                        match self.run_once().await {
                            Ok(0) => {}
                            Ok(n) => info!("auto-pass job: passed {n} steps"),
                            Err(e) => error!("auto-pass job pass failed: {e}"),
                        }
                    }
                }
            }
        });
    }
}
