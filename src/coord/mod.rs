//! Coordination-store facade
//!
//! A thin key-value + watch + lease + distributed-lock interface over an
//! external linearizable store. The framework only depends on this trait;
//! backends are selected through [`crate::config::CoordConfig`].

mod memory;

pub use memory::MemoryCoordStore;

use crate::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Identity of a lease granted by the store.
pub type LeaseId = u64;

/// Store revision; every committed mutation increases it.
pub type Revision = u64;

/// One key/value pair inside a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub key: String,
    pub value: String,
}

/// A consistent recursive read of a key prefix.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// Store revision the read was served at.
    pub revision: Revision,
    /// All keys under the requested prefix, lexicographically ordered.
    pub entries: Vec<KvEntry>,
}

impl Snapshot {
    /// Value of an exact key within the snapshot.
    pub fn value_of(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.key == key)
            .map(|e| e.value.as_str())
    }
}

/// Coordination store interface
///
/// Any linearizable KV store that supports recursive reads with revisions,
/// watch-since-revision, leases, and a lock keyed by name can back the
/// framework. The in-process [`MemoryCoordStore`] is the development and
/// test backend.
#[async_trait]
pub trait CoordStore: Send + Sync {
    /// Recursive GET of every key under `prefix`, with the serving revision.
    async fn get_prefix(&self, prefix: &str) -> Result<Snapshot>;

    /// PUT a key, optionally bound to a lease. Lease-bound keys disappear
    /// when the lease expires or is revoked.
    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<()>;

    /// Delete a key. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Block until one mutation under `prefix` commits at a revision greater
    /// than `after`. Watchers resynchronize with a fresh [`get_prefix`]
    /// afterwards; events are never applied incrementally.
    ///
    /// [`get_prefix`]: CoordStore::get_prefix
    async fn watch_next(&self, prefix: &str, after: Revision) -> Result<()>;

    /// Create a lease with the given time-to-live.
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId>;

    /// Extend a lease back to its full TTL. Returns [`crate::Error::LeaseLost`]
    /// when the lease no longer exists.
    async fn keep_alive(&self, lease: LeaseId) -> Result<()>;

    /// Drop a lease immediately, deleting every key bound to it.
    async fn revoke_lease(&self, lease: LeaseId) -> Result<()>;

    /// Acquire the named distributed lock, blocking until it is free. The
    /// lock is tied to `lease` and is released when the lease dies.
    async fn lock(&self, name: &str, lease: LeaseId) -> Result<()>;

    /// Release the named lock if held by `lease`.
    async fn unlock(&self, name: &str, lease: LeaseId) -> Result<()>;
}
