use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use opsflow_core::ServiceError;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::instance::Instance;
use crate::store::{CoordSession, CoordStore, WatchEvent};

/// Registry client configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Root namespace for all keys (`/<namespace>/<service>/<instance>`).
    pub namespace: String,
    /// Lease TTL requested for each session.
    pub session_ttl: Duration,
    /// Fixed retry interval while rebuilding a lost session.
    pub rebuild_interval: Duration,
    /// Pause between watch resubscription attempts.
    pub resubscribe_pause: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            namespace: "opsflow".into(),
            session_ttl: Duration::from_secs(10),
            rebuild_interval: Duration::from_secs(3),
            resubscribe_pause: Duration::from_secs(1),
        }
    }
}

/// One change under a service prefix, decoded for consumers.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    /// An instance was registered or updated.
    Put { id: String, instance: Instance },
    /// An instance disappeared. Only the instance id (last key segment) is
    /// known — lease-expiry deletes carry no value.
    Delete { id: String },
}

struct State {
    session: Arc<dyn CoordSession>,
    /// Everything we have registered, replayed onto a fresh session after
    /// session loss: key → instance.
    registered: HashMap<String, Instance>,
}

/// Lease-bound service-discovery client.
///
/// See the crate docs for the recovery contract. All methods are safe to
/// call concurrently; the session pointer is swapped wholesale (never
/// patched) by the background monitor when the lease is lost.
pub struct Registry {
    store: Arc<dyn CoordStore>,
    config: RegistryConfig,
    state: Arc<Mutex<State>>,
    cancel: CancellationToken,
}

impl Registry {
    /// Connect: grant the initial session and start the session monitor.
    pub async fn connect(
        store: Arc<dyn CoordStore>,
        config: RegistryConfig,
    ) -> Result<Self, ServiceError> {
        let session = store.grant_session(config.session_ttl).await?;
        let state = Arc::new(Mutex::new(State {
            session,
            registered: HashMap::new(),
        }));
        let cancel = CancellationToken::new();

        let registry = Self {
            store,
            config,
            state,
            cancel,
        };
        registry.spawn_session_monitor();
        Ok(registry)
    }

    fn key(&self, service: &str, id: &str) -> String {
        format!("/{}/{}/{}", self.config.namespace, service, id)
    }

    fn prefix(&self, service: &str) -> String {
        format!("/{}/{}/", self.config.namespace, service)
    }

    /// Register an instance under a service. The registration is remembered
    /// locally and survives session loss.
    pub async fn register(&self, service: &str, instance: Instance) -> Result<(), ServiceError> {
        let key = self.key(service, instance.id());
        let value = serde_json::to_vec(&instance)
            .map_err(|e| ServiceError::Internal(format!("encode instance: {e}")))?;

        let mut state = self.state.lock().await;
        state.session.put(&key, &value).await?;
        state.registered.insert(key, instance);
        Ok(())
    }

    /// Remove an instance registration.
    pub async fn unregister(&self, service: &str, id: &str) -> Result<(), ServiceError> {
        let key = self.key(service, id);
        let mut state = self.state.lock().await;
        state.session.delete(&key).await?;
        state.registered.remove(&key);
        Ok(())
    }

    /// List all live instances under a service. Malformed descriptors are
    /// logged and skipped.
    pub async fn list(&self, service: &str) -> Result<Vec<Instance>, ServiceError> {
        let entries = self.store.get_prefix(&self.prefix(service)).await?;
        let mut out = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            match serde_json::from_slice::<Instance>(&value) {
                Ok(inst) => out.push(inst),
                Err(e) => warn!("registry: bad instance descriptor at {key}: {e}"),
            }
        }
        Ok(out)
    }

    /// Subscribe to changes under a service prefix.
    ///
    /// The first watch is established before this returns. A caller that
    /// subscribes and then lists therefore sees every instance at least
    /// once: in the listing, on the stream, or both. The stream stays open
    /// across watch loss — the internal loop resubscribes after a short
    /// pause whenever the underlying watch ends, and only stops when the
    /// registry is closed or the receiver is dropped.
    pub async fn subscribe(
        &self,
        service: &str,
    ) -> Result<mpsc::UnboundedReceiver<RegistryEvent>, ServiceError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let store = Arc::clone(&self.store);
        let prefix = self.prefix(service);
        let pause = self.config.resubscribe_pause;
        let cancel = self.cancel.clone();

        let mut stream = self.store.watch_prefix(&prefix).await?;

        tokio::spawn(async move {
            loop {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        event = stream.recv() => match event {
                            Some(event) => {
                                if forward(&prefix, event, &tx).is_err() {
                                    return; // receiver dropped
                                }
                            }
                            None => {
                                debug!("registry: watch on {prefix} ended, resubscribing");
                                break;
                            }
                        }
                    }
                }
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(pause) => {}
                    }
                    match store.watch_prefix(&prefix).await {
                        Ok(next) => {
                            stream = next;
                            break;
                        }
                        Err(e) => warn!("registry: watch on {prefix} failed: {e}"),
                    }
                }
            }
        });
        Ok(rx)
    }

    /// Stop the session monitor and all subscription loops.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Session monitor: waits for lease loss, then rebuilds a fresh session
    /// at a fixed interval and replays every known registration onto it.
    fn spawn_session_monitor(&self) {
        let store = Arc::clone(&self.store);
        let state = Arc::clone(&self.state);
        let ttl = self.config.session_ttl;
        let interval = self.config.rebuild_interval;
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            loop {
                let session = { Arc::clone(&state.lock().await.session) };
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = session.expired() => {
                        warn!("registry: session lost, rebuilding");
                        rebuild_session(&store, &state, ttl, interval, &cancel).await;
                    }
                }
            }
            debug!("registry: session monitor stopped");
        });
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn forward(
    prefix: &str,
    event: WatchEvent,
    tx: &mpsc::UnboundedSender<RegistryEvent>,
) -> Result<(), ()> {
    let mapped = match event {
        WatchEvent::Put { key, value } => match serde_json::from_slice::<Instance>(&value) {
            Ok(instance) => RegistryEvent::Put {
                id: instance_id(prefix, &key),
                instance,
            },
            Err(e) => {
                warn!("registry: bad instance descriptor at {key}: {e}");
                return Ok(());
            }
        },
        WatchEvent::Delete { key } => RegistryEvent::Delete {
            id: instance_id(prefix, &key),
        },
    };
    tx.send(mapped).map_err(|_| ())
}

/// Last path segment of a watched key.
fn instance_id(prefix: &str, key: &str) -> String {
    key.strip_prefix(prefix).unwrap_or(key).to_string()
}

/// Grant a new session and replay all registrations, retrying at a fixed
/// interval until everything is back or the registry is closed.
async fn rebuild_session(
    store: &Arc<dyn CoordStore>,
    state: &Arc<Mutex<State>>,
    ttl: Duration,
    interval: Duration,
    cancel: &CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        match try_rebuild(store, state, ttl).await {
            Ok(count) => {
                info!("registry: session rebuilt, {count} registrations replayed");
                return;
            }
            Err(e) => warn!("registry: session rebuild failed: {e}"),
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

async fn try_rebuild(
    store: &Arc<dyn CoordStore>,
    state: &Arc<Mutex<State>>,
    ttl: Duration,
) -> Result<usize, ServiceError> {
    let session = store.grant_session(ttl).await?;

    let mut st = state.lock().await;
    let entries: Vec<(String, Instance)> = st
        .registered
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    // Swap the pointer first so concurrent register() calls land on the
    // fresh lease; the replay below restores the old entries.
    st.session = Arc::clone(&session);
    drop(st);

    for (key, instance) in &entries {
        let value = serde_json::to_vec(instance)
            .map_err(|e| ServiceError::Internal(format!("encode instance: {e}")))?;
        session.put(key, &value).await?;
    }
    Ok(entries.len())
}
