//! Coordination-store configuration and backend factory
//!
//! Selects and constructs the store backend behind the [`CoordStore`]
//! facade. The `memory` backend is shared per endpoint set, so every
//! publisher and discovery client configured against the same endpoints
//! observes one store, the same wiring a real deployment gets from a
//! shared consensus cluster.

use crate::coord::{CoordStore, MemoryCoordStore};
use crate::{Error, Result};
use dashmap::DashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::info;

/// Store backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordBackend {
    /// In-process store (development and tests).
    Memory,
}

/// Coordination-store configuration
#[derive(Debug, Clone)]
pub struct CoordConfig {
    /// Backend kind.
    pub backend: CoordBackend,
    /// Store endpoints; for the memory backend these only name the shared
    /// instance.
    pub endpoints: Vec<String>,
    /// Root under which every key of this deployment lives.
    pub base_path: String,
    /// TTL for instance-slot leases.
    pub lease_ttl: Duration,
    /// Store heartbeat: lease expiry is detected within one beat.
    pub heartbeat: Duration,
}

impl CoordConfig {
    pub fn new(endpoints: Vec<String>, base_path: impl Into<String>) -> Self {
        Self {
            backend: CoordBackend::Memory,
            endpoints,
            base_path: base_path.into(),
            lease_ttl: Duration::from_secs(5),
            heartbeat: Duration::from_millis(100),
        }
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Construct (or attach to) the configured store backend. Must be called
    /// from within a tokio runtime.
    pub fn connect(&self) -> Result<Arc<dyn CoordStore>> {
        if self.base_path.is_empty() {
            return Err(Error::Config("coordination base path is empty".to_string()));
        }
        match self.backend {
            CoordBackend::Memory => {
                let key = self.endpoints.join(",");
                let store = shared_memory_stores()
                    .entry(key.clone())
                    .or_insert_with(|| {
                        info!(endpoints = %key, "attaching in-process coordination store");
                        MemoryCoordStore::new(self.heartbeat)
                    })
                    .clone();
                Ok(Arc::new(store))
            }
        }
    }
}

fn shared_memory_stores() -> &'static DashMap<String, MemoryCoordStore> {
    static STORES: OnceLock<DashMap<String, MemoryCoordStore>> = OnceLock::new();
    STORES.get_or_init(DashMap::new)
}
