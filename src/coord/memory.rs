//! In-process coordination store
//!
//! A revisioned key-value store with leases, watches and named locks,
//! sufficient to run a full registration/discovery round trip inside one
//! process. Development and test backend; production deployments point the
//! same trait at a real consensus store.

use super::{CoordStore, KvEntry, LeaseId, Revision, Snapshot};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::debug;

/// Retained change-log length. Watchers that fall behind the log are woken
/// unconditionally and resynchronize with a full read, mirroring the
/// compaction semantics of real coordination stores.
const EVENT_LOG_CAP: usize = 4096;

struct ValueEntry {
    value: String,
    lease: Option<LeaseId>,
}

struct LeaseState {
    ttl: Duration,
    deadline: Instant,
}

#[derive(Default)]
struct LockQueue {
    holder: Option<LeaseId>,
    waiters: VecDeque<(u64, LeaseId)>,
}

struct StoreState {
    kv: BTreeMap<String, ValueEntry>,
    leases: HashMap<LeaseId, LeaseState>,
    locks: HashMap<String, LockQueue>,
    events: VecDeque<(Revision, String)>,
    revision: Revision,
    next_lease: LeaseId,
    next_ticket: u64,
}

struct Inner {
    state: Mutex<StoreState>,
    changed: watch::Sender<Revision>,
    heartbeat: Duration,
}

/// In-process [`CoordStore`] backend.
///
/// Clones share the same underlying store. A background sweeper expires
/// leases every `heartbeat`, deleting lease-bound keys and releasing locks
/// held by the dead lease.
#[derive(Clone)]
pub struct MemoryCoordStore {
    inner: Arc<Inner>,
}

impl MemoryCoordStore {
    /// Create a store with the given sweeper heartbeat. Must be called from
    /// within a tokio runtime.
    pub fn new(heartbeat: Duration) -> Self {
        let (changed, _) = watch::channel(0);
        let inner = Arc::new(Inner {
            state: Mutex::new(StoreState {
                kv: BTreeMap::new(),
                leases: HashMap::new(),
                locks: HashMap::new(),
                events: VecDeque::new(),
                revision: 0,
                next_lease: 1,
                next_ticket: 1,
            }),
            changed,
            heartbeat,
        });
        tokio::spawn(sweeper(Arc::downgrade(&inner), heartbeat));
        Self { inner }
    }

    /// Sweeper heartbeat; lease-bound keys disappear within one beat of
    /// expiry.
    pub fn heartbeat(&self) -> Duration {
        self.inner.heartbeat
    }

    fn subscribe(&self) -> watch::Receiver<Revision> {
        self.inner.changed.subscribe()
    }
}

fn in_prefix(key: &str, prefix: &str) -> bool {
    key.strip_prefix(prefix)
        .map(|rest| rest.is_empty() || rest.starts_with('/'))
        .unwrap_or(false)
}

impl StoreState {
    fn record(&mut self, key: String) {
        self.revision += 1;
        self.events.push_back((self.revision, key));
        while self.events.len() > EVENT_LOG_CAP {
            self.events.pop_front();
        }
    }

    /// Remove a dead lease: drop its keys, free its locks, forget its
    /// queued lock waits. Returns whether anything visible changed.
    fn drop_lease(&mut self, lease: LeaseId) -> bool {
        let mut changed = false;
        let dead: Vec<String> = self
            .kv
            .iter()
            .filter(|(_, v)| v.lease == Some(lease))
            .map(|(k, _)| k.clone())
            .collect();
        for key in dead {
            self.kv.remove(&key);
            self.record(key);
            changed = true;
        }
        for queue in self.locks.values_mut() {
            if queue.holder == Some(lease) {
                queue.holder = None;
                changed = true;
            }
            let before = queue.waiters.len();
            queue.waiters.retain(|(_, l)| *l != lease);
            changed |= queue.waiters.len() != before;
        }
        changed
    }
}

async fn sweeper(inner: Weak<Inner>, heartbeat: Duration) {
    let mut tick = tokio::time::interval(heartbeat);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let mut changed = false;
        {
            let mut st = inner.state.lock();
            let now = Instant::now();
            let expired: Vec<LeaseId> = st
                .leases
                .iter()
                .filter(|(_, l)| l.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            for lease in expired {
                debug!(lease, "lease expired");
                st.leases.remove(&lease);
                changed |= st.drop_lease(lease);
            }
            if changed {
                let rev = st.revision;
                let _ = inner.changed.send(rev);
            }
        }
    }
}

#[async_trait]
impl CoordStore for MemoryCoordStore {
    async fn get_prefix(&self, prefix: &str) -> Result<Snapshot> {
        let st = self.inner.state.lock();
        let entries = st
            .kv
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(k, _)| in_prefix(k, prefix))
            .map(|(k, v)| KvEntry {
                key: k.clone(),
                value: v.value.clone(),
            })
            .collect();
        Ok(Snapshot {
            revision: st.revision,
            entries,
        })
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<()> {
        let mut st = self.inner.state.lock();
        if let Some(lease) = lease {
            if !st.leases.contains_key(&lease) {
                return Err(Error::LeaseLost(format!("lease {lease} is gone")));
            }
        }
        st.kv.insert(
            key.to_string(),
            ValueEntry {
                value: value.to_string(),
                lease,
            },
        );
        st.record(key.to_string());
        let rev = st.revision;
        let _ = self.inner.changed.send(rev);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut st = self.inner.state.lock();
        if st.kv.remove(key).is_some() {
            st.record(key.to_string());
            let rev = st.revision;
            let _ = self.inner.changed.send(rev);
        }
        Ok(())
    }

    async fn watch_next(&self, prefix: &str, after: Revision) -> Result<()> {
        let mut rx = self.subscribe();
        loop {
            {
                let st = self.inner.state.lock();
                // Log compacted past the requested revision: wake the
                // watcher so it resynchronizes with a full read.
                if let Some((front, _)) = st.events.front() {
                    if after + 1 < *front {
                        return Ok(());
                    }
                }
                if st
                    .events
                    .iter()
                    .any(|(rev, key)| *rev > after && in_prefix(key, prefix))
                {
                    return Ok(());
                }
            }
            rx.changed()
                .await
                .map_err(|_| Error::Coord("store closed".to_string()))?;
        }
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId> {
        let mut st = self.inner.state.lock();
        let id = st.next_lease;
        st.next_lease += 1;
        st.leases.insert(
            id,
            LeaseState {
                ttl,
                deadline: Instant::now() + ttl,
            },
        );
        Ok(id)
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<()> {
        let mut st = self.inner.state.lock();
        match st.leases.get_mut(&lease) {
            Some(l) => {
                l.deadline = Instant::now() + l.ttl;
                Ok(())
            }
            None => Err(Error::LeaseLost(format!("lease {lease} is gone"))),
        }
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        let mut st = self.inner.state.lock();
        if st.leases.remove(&lease).is_none() {
            return Err(Error::LeaseLost(format!("lease {lease} is gone")));
        }
        st.drop_lease(lease);
        let rev = st.revision;
        let _ = self.inner.changed.send(rev);
        Ok(())
    }

    async fn lock(&self, name: &str, lease: LeaseId) -> Result<()> {
        // Take a ticket so acquisition is first-come-first-served.
        let ticket = {
            let mut st = self.inner.state.lock();
            if !st.leases.contains_key(&lease) {
                return Err(Error::LeaseLost(format!("lease {lease} is gone")));
            }
            let ticket = st.next_ticket;
            st.next_ticket += 1;
            st.locks
                .entry(name.to_string())
                .or_default()
                .waiters
                .push_back((ticket, lease));
            ticket
        };

        let mut rx = self.subscribe();
        loop {
            {
                let mut st = self.inner.state.lock();
                if !st.leases.contains_key(&lease) {
                    if let Some(queue) = st.locks.get_mut(name) {
                        queue.waiters.retain(|(t, _)| *t != ticket);
                    }
                    return Err(Error::LeaseLost(format!("lease {lease} is gone")));
                }
                let queue = st.locks.entry(name.to_string()).or_default();
                if queue.holder.is_none() && queue.waiters.front().map(|(t, _)| *t) == Some(ticket)
                {
                    queue.waiters.pop_front();
                    queue.holder = Some(lease);
                    return Ok(());
                }
            }
            rx.changed()
                .await
                .map_err(|_| Error::Coord("store closed".to_string()))?;
        }
    }

    async fn unlock(&self, name: &str, lease: LeaseId) -> Result<()> {
        let mut st = self.inner.state.lock();
        let Some(queue) = st.locks.get_mut(name) else {
            return Ok(());
        };
        if queue.holder == Some(lease) {
            queue.holder = None;
            let rev = st.revision;
            let _ = self.inner.changed.send(rev);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn store() -> MemoryCoordStore {
        MemoryCoordStore::new(Duration::from_millis(20))
    }

    #[tokio::test]
    async fn put_get_delete_round_trip() {
        let s = store();
        s.put("a/b/reg", "x", None).await.unwrap();
        s.put("a/b/manual", "y", None).await.unwrap();
        s.put("a/bc", "z", None).await.unwrap();

        let snap = s.get_prefix("a/b").await.unwrap();
        assert_eq!(snap.entries.len(), 2, "sibling prefix must not match");
        assert_eq!(snap.value_of("a/b/reg"), Some("x"));

        s.delete("a/b/reg").await.unwrap();
        let snap = s.get_prefix("a/b").await.unwrap();
        assert_eq!(snap.entries.len(), 1);
    }

    #[tokio::test]
    async fn lease_expiry_deletes_bound_keys() {
        let s = store();
        let lease = s.grant_lease(Duration::from_millis(50)).await.unwrap();
        s.put("svc/0/reg", "v", Some(lease)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        let snap = s.get_prefix("svc").await.unwrap();
        assert!(snap.entries.is_empty(), "expired lease must drop its keys");
        assert!(s.keep_alive(lease).await.is_err());
    }

    #[tokio::test]
    async fn keep_alive_extends_lease() {
        let s = store();
        let lease = s.grant_lease(Duration::from_millis(80)).await.unwrap();
        s.put("svc/0/reg", "v", Some(lease)).await.unwrap();
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(40)).await;
            s.keep_alive(lease).await.unwrap();
        }
        let snap = s.get_prefix("svc").await.unwrap();
        assert_eq!(snap.entries.len(), 1);
    }

    #[tokio::test]
    async fn watch_wakes_on_prefix_change() {
        let s = store();
        let rev = s.get_prefix("svc").await.unwrap().revision;

        let watcher = {
            let s = s.clone();
            tokio::spawn(async move { s.watch_next("svc", rev).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        s.put("other/key", "v", None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!watcher.is_finished(), "unrelated key must not wake watcher");

        s.put("svc/0/reg", "v", None).await.unwrap();
        watcher.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn lock_is_exclusive_and_fifo() {
        let s = store();
        let l1 = s.grant_lease(Duration::from_secs(5)).await.unwrap();
        let l2 = s.grant_lease(Duration::from_secs(5)).await.unwrap();

        s.lock("m", l1).await.unwrap();
        let second = {
            let s = s.clone();
            tokio::spawn(async move { s.lock("m", l2).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished(), "second locker must block");

        s.unlock("m", l1).await.unwrap();
        second.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn lock_released_on_lease_revoke() {
        let s = store();
        let l1 = s.grant_lease(Duration::from_secs(5)).await.unwrap();
        let l2 = s.grant_lease(Duration::from_secs(5)).await.unwrap();

        s.lock("m", l1).await.unwrap();
        let second = {
            let s = s.clone();
            tokio::spawn(async move { s.lock("m", l2).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        s.revoke_lease(l1).await.unwrap();
        second.await.unwrap().unwrap();
    }
}
