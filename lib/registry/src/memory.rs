use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use opsflow_core::ServiceError;
use tokio::sync::{mpsc, watch};

use crate::store::{CoordSession, CoordStore, WatchEvent, WatchStream};

/// In-memory coordination store.
///
/// The embedded reference implementation of [`CoordStore`]: lease semantics
/// are simulated rather than timed out — [`MemStore::kill_sessions`] expires
/// every live session and deletes its keys, which is what the session-loss
/// tests (and local development) drive. Watches can likewise be severed
/// with [`MemStore::drop_watchers`] to exercise resubscription.
#[derive(Default)]
pub struct MemStore {
    shared: Arc<Mutex<Shared>>,
}

#[derive(Default)]
struct Shared {
    /// key → (value, owning session id).
    data: BTreeMap<String, (Vec<u8>, u64)>,
    /// Live prefix watchers.
    watchers: Vec<Watcher>,
    /// Live sessions: id → expiry signal.
    sessions: HashMap<u64, watch::Sender<bool>>,
    next_session: u64,
}

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

fn notify(shared: &mut Shared, event: &WatchEvent) {
    let key = match event {
        WatchEvent::Put { key, .. } => key,
        WatchEvent::Delete { key } => key,
    };
    // Drop watchers whose receiver has gone away.
    shared
        .watchers
        .retain(|w| !key.starts_with(&w.prefix) || w.tx.send(event.clone()).is_ok());
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expire every live session: their keys are deleted (lease expiry) and
    /// their `expired()` futures resolve.
    pub fn kill_sessions(&self) {
        let mut shared = self.shared.lock().unwrap();
        for (_, tx) in shared.sessions.drain() {
            let _ = tx.send(true);
        }
        let dead: Vec<String> = shared.data.keys().cloned().collect();
        for key in dead {
            shared.data.remove(&key);
            notify(&mut shared, &WatchEvent::Delete { key });
        }
    }

    /// Sever every live watch stream (simulates watch cancellation).
    pub fn drop_watchers(&self) {
        self.shared.lock().unwrap().watchers.clear();
    }

    /// Number of keys currently held (test hook).
    pub fn len(&self) -> usize {
        self.shared.lock().unwrap().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CoordStore for MemStore {
    async fn grant_session(&self, _ttl: Duration) -> Result<Arc<dyn CoordSession>, ServiceError> {
        let mut shared = self.shared.lock().unwrap();
        let id = shared.next_session;
        shared.next_session += 1;
        let (tx, rx) = watch::channel(false);
        shared.sessions.insert(id, tx);
        Ok(Arc::new(MemSession {
            id,
            shared: Arc::clone(&self.shared),
            expired_rx: rx,
        }))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, ServiceError> {
        let shared = self.shared.lock().unwrap();
        Ok(shared
            .data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, (v, _))| (k.clone(), v.clone()))
            .collect())
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream, ServiceError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.lock().unwrap().watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(rx)
    }
}

struct MemSession {
    id: u64,
    shared: Arc<Mutex<Shared>>,
    expired_rx: watch::Receiver<bool>,
}

#[async_trait]
impl CoordSession for MemSession {
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), ServiceError> {
        if self.is_expired() {
            return Err(ServiceError::Unavailable("session expired".into()));
        }
        let mut shared = self.shared.lock().unwrap();
        shared
            .data
            .insert(key.to_string(), (value.to_vec(), self.id));
        notify(
            &mut shared,
            &WatchEvent::Put {
                key: key.to_string(),
                value: value.to_vec(),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), ServiceError> {
        if self.is_expired() {
            return Err(ServiceError::Unavailable("session expired".into()));
        }
        let mut shared = self.shared.lock().unwrap();
        if shared.data.remove(key).is_some() {
            notify(&mut shared, &WatchEvent::Delete { key: key.to_string() });
        }
        Ok(())
    }

    async fn expired(&self) {
        let mut rx = self.expired_rx.clone();
        while !*rx.borrow() {
            // Sender dropped means the store is gone; treat as expired.
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    fn is_expired(&self) -> bool {
        *self.expired_rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_delete() {
        let store = MemStore::new();
        let session = store.grant_session(Duration::from_secs(10)).await.unwrap();

        session.put("/ns/svc/a", b"1").await.unwrap();
        session.put("/ns/svc/b", b"2").await.unwrap();
        session.put("/ns/other/c", b"3").await.unwrap();

        let got = store.get_prefix("/ns/svc/").await.unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].0, "/ns/svc/a");

        session.delete("/ns/svc/a").await.unwrap();
        assert_eq!(store.get_prefix("/ns/svc/").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn watch_sees_changes() {
        let store = MemStore::new();
        let session = store.grant_session(Duration::from_secs(10)).await.unwrap();
        let mut stream = store.watch_prefix("/ns/svc/").await.unwrap();

        session.put("/ns/svc/a", b"1").await.unwrap();
        session.put("/ns/elsewhere/x", b"9").await.unwrap();
        session.delete("/ns/svc/a").await.unwrap();

        assert_eq!(
            stream.recv().await.unwrap(),
            WatchEvent::Put {
                key: "/ns/svc/a".into(),
                value: b"1".to_vec()
            }
        );
        // The out-of-prefix put must not be observed.
        assert_eq!(
            stream.recv().await.unwrap(),
            WatchEvent::Delete {
                key: "/ns/svc/a".into()
            }
        );
    }

    #[tokio::test]
    async fn kill_sessions_expires_and_deletes() {
        let store = MemStore::new();
        let session = store.grant_session(Duration::from_secs(10)).await.unwrap();
        session.put("/ns/svc/a", b"1").await.unwrap();

        assert!(!session.is_expired());
        store.kill_sessions();
        assert!(session.is_expired());
        session.expired().await; // resolves immediately

        assert!(store.is_empty());
        assert!(session.put("/ns/svc/a", b"1").await.is_err());
    }

    #[tokio::test]
    async fn dropped_watchers_end_streams() {
        let store = MemStore::new();
        let mut stream = store.watch_prefix("/ns/svc/").await.unwrap();
        store.drop_watchers();
        assert!(stream.recv().await.is_none());
    }
}
