use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use opsflow_core::ServiceError;

/// One change observed by a prefix watch.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    /// A key was created or updated.
    Put { key: String, value: Vec<u8> },
    /// A key was deleted (value no longer available — lease expiry deletes
    /// carry the key only).
    Delete { key: String },
}

/// Stream of watch events. The stream ends (recv returns `None`) when the
/// watch is cancelled or fails; callers are expected to resubscribe.
pub type WatchStream = tokio::sync::mpsc::UnboundedReceiver<WatchEvent>;

/// A lease-bound session on the coordination store.
///
/// Every key written through a session is owned by its lease: when the
/// lease expires, the store deletes the keys. `expired()` resolves when the
/// session is lost; after that, all writes fail and the caller must grant a
/// fresh session.
#[async_trait]
pub trait CoordSession: Send + Sync {
    /// Write a key bound to this session's lease.
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), ServiceError>;

    /// Delete a key written through this session.
    async fn delete(&self, key: &str) -> Result<(), ServiceError>;

    /// Resolves once the session's lease has been lost.
    async fn expired(&self);

    /// Whether the lease has already been lost.
    fn is_expired(&self) -> bool;
}

/// The coordination / service-discovery store.
///
/// Keys are hierarchical (`/<namespace>/<service>/<instance>`), values are
/// JSON-encoded instance descriptors. Watches are prefix-scoped and must be
/// served by a cluster leader so they never observe a stale partitioned
/// view; a watch that loses the leader ends its stream.
#[async_trait]
pub trait CoordStore: Send + Sync {
    /// Grant a new lease-bound session.
    async fn grant_session(&self, ttl: Duration) -> Result<Arc<dyn CoordSession>, ServiceError>;

    /// Read all keys under a prefix.
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, ServiceError>;

    /// Watch all keys under a prefix.
    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream, ServiceError>;
}
