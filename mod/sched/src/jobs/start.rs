use std::sync::Arc;
use std::time::Duration;

use opsflow_core::ServiceError;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::jobs::Backoff;
use crate::model::TaskStatus;
use crate::service::TaskService;
use crate::store::TaskStore;

/// Start-job configuration.
#[derive(Debug, Clone)]
pub struct StartConfig {
    /// Scan interval.
    pub interval: Duration,
    /// Page size for WAITING scans.
    pub page_size: usize,
    /// Per-task start backoff.
    pub backoff: Backoff,
}

impl Default for StartConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            page_size: 200,
            backoff: Backoff::default(),
        }
    }
}

/// Drains WAITING tasks and attempts to start them.
///
/// Tasks within a page start concurrently; the pass waits for the page to
/// finish before fetching the next one. A task whose backoff budget is
/// exhausted is logged and abandoned for this cycle — its record stays in
/// SCHEDULED (or WAITING if the handoff itself failed) and the recovery
/// job picks it up later.
pub struct StartJob {
    store: Arc<dyn TaskStore>,
    service: Arc<TaskService>,
    config: StartConfig,
}

impl StartJob {
    pub fn new(store: Arc<dyn TaskStore>, service: Arc<TaskService>, config: StartConfig) -> Self {
        Self {
            store,
            service,
            config,
        }
    }

    /// One full pass over the WAITING tasks. Returns the number of start
    /// attempts made.
    pub async fn run_once(&self) -> Result<usize, ServiceError> {
        let waiting =
            super::collect_by_status(&self.store, TaskStatus::Waiting, self.config.page_size)
                .await?;
        let mut attempts = 0;

        for page in waiting.chunks(self.config.page_size) {
            let mut set = JoinSet::new();
            for task in page.iter().cloned() {
                let service = Arc::clone(&self.service);
                let backoff = self.config.backoff;
                set.spawn(async move {
                    if let Err(e) = service
                        .start(task.process_instance_id, &task.node_id, &backoff)
                        .await
                    {
                        warn!("start of task {} abandoned for this cycle: {e}", task.id);
                    }
                });
                attempts += 1;
            }
            while set.join_next().await.is_some() {}
        }
        if attempts > 0 {
            debug!("start job: {attempts} start attempts");
        }
        Ok(attempts)
    }

    /// Run the periodic loop until the token is cancelled.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) {
        tokio::spawn(async move {
            info!("start job started (interval={:?})", self.config.interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("start job stopped");
                        break;
                    }
                    _ = tokio::time::sleep(self.config.interval) => {
                        if let Err(e) = self.run_once().await {
                            error!("start job pass failed: {e}");
                        }
                    }
                }
            }
        });
    }
}
