//! Task scheduling and dispatch.
//!
//! The platform's workflow engine creates task records; this module owns
//! everything between "task exists" and "workflow step passed": routing by
//! run mode (push onto a message-queue topic, or pull via the remote
//! execution platform), the periodic jobs that start, rescue, reconcile
//! and auto-pass tasks, and the registry-driven discovery that keeps
//! producer infrastructure matched to the live agent population.
//!
//! External systems (task storage, the broker, the remote executor, the
//! workflow engine, crypto, the coordination store) are consumed through
//! traits; each has an embedded in-memory implementation for tests and
//! local development.

pub mod discovery;
pub mod dispatch;
pub mod executor;
pub mod jobs;
pub mod model;
pub mod mq;
pub mod producer;
pub mod service;
pub mod store;
pub mod timer;
pub mod workflow;

use std::sync::Arc;

use opsflow_registry::Registry;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::discovery::{AgentController, WorkerReconciler, WorkerStore, spawn_discovery};
use crate::dispatch::Dispatcher;
use crate::executor::RemoteExecutor;
use crate::jobs::{AutoPassJob, RecoveryJob, StartJob, SyncJob};
use crate::jobs::autopass::AutoPassConfig;
use crate::jobs::recovery::RecoveryConfig;
use crate::jobs::start::StartConfig;
use crate::jobs::sync::SyncConfig;
use crate::mq::MessageQueue;
use crate::producer::ProducerManager;
use crate::service::TaskService;
use crate::store::TaskStore;
use crate::workflow::{Crypto, WorkflowEngine};

/// Per-job tuning knobs, all defaulted for production use.
#[derive(Debug, Clone, Default)]
pub struct SchedConfig {
    pub start: StartConfig,
    pub recovery: RecoveryConfig,
    pub sync: SyncConfig,
    pub autopass: AutoPassConfig,
}

/// External collaborators the module is wired against.
pub struct SchedDeps {
    pub task_store: Arc<dyn TaskStore>,
    pub worker_store: Arc<dyn WorkerStore>,
    pub queue: Arc<dyn MessageQueue>,
    pub executor: Arc<dyn RemoteExecutor>,
    pub workflow: Arc<dyn WorkflowEngine>,
    pub crypto: Arc<dyn Crypto>,
    pub registry: Arc<Registry>,
}

/// The assembled scheduling module.
///
/// Construction wires the dispatcher and service, starts the four periodic
/// jobs and both discovery loops under one root cancellation token.
/// `shutdown` stops everything; in-flight passes finish their current task
/// and exit.
pub struct SchedModule {
    service: Arc<TaskService>,
    producers: Arc<ProducerManager>,
    dispatcher: Arc<Dispatcher>,
    cancel: CancellationToken,
}

impl SchedModule {
    pub fn start(deps: SchedDeps, config: SchedConfig) -> Self {
        let cancel = CancellationToken::new();

        let producers = Arc::new(ProducerManager::new(Arc::clone(&deps.queue)));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&deps.task_store),
            Arc::clone(&producers),
            Arc::clone(&deps.executor),
            Arc::clone(&deps.crypto),
        ));
        let service = Arc::new(TaskService::new(
            Arc::clone(&deps.task_store),
            Arc::clone(&dispatcher),
        ));

        Arc::new(StartJob::new(
            Arc::clone(&deps.task_store),
            Arc::clone(&service),
            config.start,
        ))
        .spawn(cancel.clone());
        Arc::new(RecoveryJob::new(
            Arc::clone(&deps.task_store),
            Arc::clone(&service),
            config.recovery,
        ))
        .spawn(cancel.clone());
        Arc::new(SyncJob::new(
            Arc::clone(&deps.task_store),
            Arc::clone(&deps.executor),
            config.sync,
        ))
        .spawn(cancel.clone());
        Arc::new(AutoPassJob::new(
            Arc::clone(&deps.task_store),
            Arc::clone(&deps.workflow),
            config.autopass,
        ))
        .spawn(cancel.clone());

        spawn_discovery(
            Arc::clone(&deps.registry),
            Arc::new(AgentController::new(
                Arc::clone(&deps.queue),
                Arc::clone(&producers),
            )),
            cancel.clone(),
        );
        spawn_discovery(
            Arc::clone(&deps.registry),
            Arc::new(WorkerReconciler::new(Arc::clone(&deps.worker_store))),
            cancel.clone(),
        );

        info!("scheduling module started");
        Self {
            service,
            producers,
            dispatcher,
            cancel,
        }
    }

    /// The task service, for callers that start or re-dispatch tasks on
    /// demand (manual retry, API triggers).
    pub fn service(&self) -> Arc<TaskService> {
        Arc::clone(&self.service)
    }

    /// The producer map, shared with the agent discovery loop.
    pub fn producers(&self) -> Arc<ProducerManager> {
        Arc::clone(&self.producers)
    }

    /// Stop all jobs, discovery loops and the deferred-dispatch timer.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.dispatcher.shutdown();
        info!("scheduling module stopped");
    }
}

impl Drop for SchedModule {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
