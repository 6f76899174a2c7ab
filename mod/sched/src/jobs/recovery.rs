use std::sync::Arc;
use std::time::Duration;

use opsflow_core::{ServiceError, now_ms};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::model::{Task, TaskStatus};
use crate::service::TaskService;
use crate::store::TaskStore;

/// Recovery-job configuration.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Scan interval.
    pub interval: Duration,
    /// Page size for SCHEDULED scans.
    pub page_size: usize,
    /// Grace window after the last mutation of an immediate task before it
    /// counts as stuck.
    pub grace: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            page_size: 200,
            grace: Duration::from_secs(60),
        }
    }
}

/// Rescues tasks stuck in SCHEDULED.
///
/// Two staleness filters keep it from racing a dispatch still in flight:
/// timed tasks are skipped until their fire time arrives (the timer queue
/// owns them), and immediate tasks are skipped while inside the `utime`
/// grace window. Survivors are re-dispatched concurrently through the
/// service's at-most-once guard.
pub struct RecoveryJob {
    store: Arc<dyn TaskStore>,
    service: Arc<TaskService>,
    config: RecoveryConfig,
}

impl RecoveryJob {
    pub fn new(
        store: Arc<dyn TaskStore>,
        service: Arc<TaskService>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            store,
            service,
            config,
        }
    }

    /// Whether a SCHEDULED task is stuck as of `now`.
    fn is_stuck(task: &Task, now: i64, grace_ms: i64) -> bool {
        match task.scheduled_time {
            // Timed: normal until the fire time arrives.
            Some(at) => at <= now,
            // Immediate: give the in-flight dispatch the grace window.
            None => now > task.utime + grace_ms,
        }
    }

    /// One full pass. Returns the number of re-dispatches performed.
    pub async fn run_once(&self) -> Result<usize, ServiceError> {
        let grace_ms = self.config.grace.as_millis() as i64;
        let scheduled =
            super::collect_by_status(&self.store, TaskStatus::Scheduled, self.config.page_size)
                .await?;
        let mut rescued = 0;

        for page in scheduled.chunks(self.config.page_size) {
            let now = now_ms();
            let mut set = JoinSet::new();
            for task in page.iter().cloned() {
                if !Self::is_stuck(&task, now, grace_ms) {
                    continue;
                }
                let service = Arc::clone(&self.service);
                set.spawn(async move {
                    match service.redispatch(&task).await {
                        Ok(true) => {
                            info!("recovered stuck task {}", task.id);
                            true
                        }
                        Ok(false) => false,
                        Err(e) => {
                            warn!("recovery of task {} failed: {e}", task.id);
                            false
                        }
                    }
                });
            }
            while let Some(result) = set.join_next().await {
                if matches!(result, Ok(true)) {
                    rescued += 1;
                }
            }
        }
        Ok(rescued)
    }

    /// Run the periodic loop until the token is cancelled.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) {
        tokio::spawn(async move {
            info!("recovery job started (interval={:?})", self.config.interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("recovery job stopped");
                        break;
                    }
                    _ = tokio::time::sleep(self.config.interval) => {
                        match self.run_once().await {
                            Ok(0) => {}
                            Ok(n) => info!("recovery job: rescued {n} tasks"),
                            Err(e) => error!("recovery job pass failed: {e}"),
                        }
                    }
                }
            }
        });
    }
}
