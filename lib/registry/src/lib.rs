//! Lease-bound service-discovery client.
//!
//! Registrations are written to a coordination store under a session lease
//! and mirrored in a local cache. If the session is lost (lease expiry,
//! network partition) a background monitor grants a fresh session and
//! replays every previously-known registration against the new lease,
//! without caller involvement. Subscriptions establish their first watch
//! before returning, so subscribe-then-list observes every instance at
//! least once; streams auto-resubscribe when the underlying watch is
//! cancelled or fails.

pub mod client;
pub mod instance;
pub mod memory;
pub mod store;

pub use client::{Registry, RegistryConfig, RegistryEvent};
pub use instance::Instance;
pub use memory::MemStore;
pub use store::{CoordSession, CoordStore, WatchEvent, WatchStream};
