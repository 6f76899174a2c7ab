use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use opsflow_core::ServiceError;
use opsflow_registry::{Instance, Registry, RegistryEvent};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::mq::MessageQueue;
use crate::producer::ProducerManager;

/// Registry service prefix for EXECUTE-side agents.
pub const AGENT_SERVICE: &str = "agent";
/// Registry service prefix for WORKER-mode consumers.
pub const WORKER_SERVICE: &str = "worker";

/// A consumer of registry changes for one service prefix.
///
/// `snapshot` replays the startup listing through the same path live
/// updates take, so `apply` must tolerate seeing an instance twice (the
/// listing and the watch overlap by design).
#[async_trait]
pub trait DiscoveryHandler: Send + Sync {
    /// Service prefix this handler watches.
    fn service(&self) -> &'static str;

    async fn apply(&self, event: RegistryEvent);

    async fn snapshot(&self, instances: Vec<Instance>) {
        for instance in instances {
            let id = instance.id().to_string();
            self.apply(RegistryEvent::Put { id, instance }).await;
        }
    }
}

/// Pause between subscription attempts when the initial watch fails.
const SUBSCRIBE_RETRY: Duration = Duration::from_secs(1);

/// Watch a service prefix and feed its changes to a handler.
///
/// The watch is fully established (`subscribe` awaits it) before the
/// listing is taken, so a registration landing in between is never lost;
/// the overlap shows up as a duplicate Put, which handlers absorb.
pub fn spawn_discovery(
    registry: Arc<Registry>,
    handler: Arc<dyn DiscoveryHandler>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let service = handler.service();
        let mut events = loop {
            match registry.subscribe(service).await {
                Ok(events) => break events,
                Err(e) => warn!("discovery: subscribing to {service} failed: {e}"),
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(SUBSCRIBE_RETRY) => {}
            }
        };
        match registry.list(service).await {
            Ok(instances) => handler.snapshot(instances).await,
            Err(e) => warn!("discovery: initial {service} listing failed: {e}"),
        }
        info!("discovery loop for {service} started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => handler.apply(event).await,
                    None => break,
                }
            }
        }
        info!("discovery loop for {service} stopped");
    });
}

// ── agents ──────────────────────────────────────────────────────────────

#[derive(Default)]
struct AgentState {
    /// Live agents per topic.
    counts: HashMap<String, usize>,
    /// Topic last seen for each agent address. Removal events carry no
    /// metadata, so the topic must be resolved here.
    topic_by_addr: HashMap<String, String>,
}

enum TopicAction {
    Provision(String),
    Release(String),
}

/// Keeps per-topic producer infrastructure in lock-step with the set of
/// live agents advertising that topic.
///
/// Counts are purely local, rebuilt from the snapshot on every start. Map
/// mutations happen under one lock; the provisioning and releasing calls
/// run after it is dropped so a slow broker never blocks event handling.
pub struct AgentController {
    queue: Arc<dyn MessageQueue>,
    producers: Arc<ProducerManager>,
    state: Mutex<AgentState>,
}

impl AgentController {
    pub fn new(queue: Arc<dyn MessageQueue>, producers: Arc<ProducerManager>) -> Self {
        Self {
            queue,
            producers,
            state: Mutex::new(AgentState::default()),
        }
    }

    fn on_put(&self, id: String, topic: String) -> Vec<TopicAction> {
        let mut state = self.state.lock().unwrap();
        let mut actions = Vec::new();

        match state.topic_by_addr.get(&id) {
            // Same mapping again: the snapshot/watch overlap, or a lease
            // refresh. Nothing moves.
            Some(known) if *known == topic => return actions,
            Some(known) => {
                // Topic change: drop the old count first so the agent is
                // never counted twice.
                let old = known.clone();
                if let Some(count) = state.counts.get_mut(&old) {
                    *count -= 1;
                    if *count == 0 {
                        state.counts.remove(&old);
                        actions.push(TopicAction::Release(old));
                    }
                }
            }
            None => {}
        }

        state.topic_by_addr.insert(id, topic.clone());
        let count = state.counts.entry(topic.clone()).or_insert(0);
        *count += 1;
        if *count == 1 {
            actions.push(TopicAction::Provision(topic));
        }
        actions
    }

    fn on_delete(&self, id: &str) -> Option<TopicAction> {
        let mut state = self.state.lock().unwrap();
        let topic = state.topic_by_addr.remove(id)?;
        let count = state.counts.get_mut(&topic)?;
        *count -= 1;
        if *count == 0 {
            state.counts.remove(&topic);
            return Some(TopicAction::Release(topic));
        }
        None
    }

    async fn execute(&self, action: TopicAction) {
        match action {
            TopicAction::Provision(topic) => {
                if let Err(e) = self.provision(&topic).await {
                    warn!("provisioning topic {topic} failed: {e}");
                }
            }
            TopicAction::Release(topic) => match self.producers.del_producer(&topic) {
                Ok(()) => info!("topic {topic} has no agents left, producer released"),
                Err(e) => warn!("releasing producer for topic {topic} failed: {e}"),
            },
        }
    }

    async fn provision(&self, topic: &str) -> Result<(), ServiceError> {
        self.queue.ensure_topic(topic).await?;
        self.producers.add_producer(topic).await?;
        info!("topic {topic} provisioned for its first agent");
        Ok(())
    }
}

#[async_trait]
impl DiscoveryHandler for AgentController {
    fn service(&self) -> &'static str {
        AGENT_SERVICE
    }

    async fn apply(&self, event: RegistryEvent) {
        match event {
            RegistryEvent::Put { id, instance } => {
                let Some(topic) = instance.advertised_topic() else {
                    warn!("agent {id} advertises no topic, ignored");
                    return;
                };
                let actions = self.on_put(id, topic.to_string());
                for action in actions {
                    self.execute(action).await;
                }
            }
            RegistryEvent::Delete { id } => {
                let Some(action) = self.on_delete(&id) else {
                    debug!("removal of unknown agent {id} ignored");
                    return;
                };
                self.execute(action).await;
            }
        }
    }
}

// ── workers ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Running,
    Offline,
}

/// Persisted record of a worker registration.
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    pub name: String,
    pub topic: Option<String>,
    pub state: WorkerState,
}

/// The platform's worker collection, consumed as an external collaborator.
#[async_trait]
pub trait WorkerStore: Send + Sync {
    async fn list_workers(&self) -> Result<Vec<WorkerRecord>, ServiceError>;

    /// Insert or refresh a worker as running.
    async fn upsert_running(&self, instance: &Instance) -> Result<(), ServiceError>;

    async fn mark_offline(&self, name: &str) -> Result<(), ServiceError>;
}

/// In-memory worker collection (tests and local development).
#[derive(Default)]
pub struct MemWorkerStore {
    workers: Mutex<HashMap<String, WorkerRecord>>,
}

impl MemWorkerStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get(&self, name: &str) -> Option<WorkerRecord> {
        self.workers.lock().unwrap().get(name).cloned()
    }
}

#[async_trait]
impl WorkerStore for MemWorkerStore {
    async fn list_workers(&self) -> Result<Vec<WorkerRecord>, ServiceError> {
        Ok(self.workers.lock().unwrap().values().cloned().collect())
    }

    async fn upsert_running(&self, instance: &Instance) -> Result<(), ServiceError> {
        self.workers.lock().unwrap().insert(
            instance.name.clone(),
            WorkerRecord {
                name: instance.name.clone(),
                topic: instance.advertised_topic().map(str::to_string),
                state: WorkerState::Running,
            },
        );
        Ok(())
    }

    async fn mark_offline(&self, name: &str) -> Result<(), ServiceError> {
        if let Some(record) = self.workers.lock().unwrap().get_mut(name) {
            record.state = WorkerState::Offline;
        }
        Ok(())
    }
}

/// Mirrors worker registrations into the worker collection.
///
/// The startup snapshot diffs both directions: live workers missing from
/// the collection are inserted, stored "running" workers missing from the
/// registry are marked offline. After that, watch events drive the
/// collection incrementally.
pub struct WorkerReconciler {
    store: Arc<dyn WorkerStore>,
}

impl WorkerReconciler {
    pub fn new(store: Arc<dyn WorkerStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl DiscoveryHandler for WorkerReconciler {
    fn service(&self) -> &'static str {
        WORKER_SERVICE
    }

    async fn apply(&self, event: RegistryEvent) {
        let result = match &event {
            RegistryEvent::Put { instance, .. } => self.store.upsert_running(instance).await,
            RegistryEvent::Delete { id } => {
                info!("worker {id} went away, marking offline");
                self.store.mark_offline(id).await
            }
        };
        if let Err(e) = result {
            warn!("worker reconciliation write failed: {e}");
        }
    }

    async fn snapshot(&self, instances: Vec<Instance>) {
        let live: HashSet<&str> = instances.iter().map(|i| i.name.as_str()).collect();

        match self.store.list_workers().await {
            Ok(stored) => {
                for record in stored {
                    if record.state == WorkerState::Running && !live.contains(record.name.as_str())
                    {
                        info!("worker {} gone since last run, marking offline", record.name);
                        if let Err(e) = self.store.mark_offline(&record.name).await {
                            warn!("marking worker {} offline failed: {e}", record.name);
                        }
                    }
                }
            }
            Err(e) => warn!("listing stored workers failed: {e}"),
        }

        for instance in instances {
            if let Err(e) = self.store.upsert_running(&instance).await {
                warn!("registering worker {} failed: {e}", instance.name);
            }
        }
    }
}
