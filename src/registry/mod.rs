//! Registry publisher
//!
//! [`ServBase`] owns one instance slot in the coordination store and keeps
//! the process's endpoint publication alive under a lease for the process
//! lifetime.

pub mod types;

pub use types::{ManualData, ProcessorKind, RegData, ServCtrl, ServInfo};

use crate::backoff::Backoff;
use crate::config::CoordConfig;
use crate::coord::{CoordStore, LeaseId};
use crate::{Error, Result};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Give up on slot allocation after roughly this long.
const ALLOC_DEADLINE: Duration = Duration::from_secs(30);
const ALLOC_BACKOFF_INITIAL: Duration = Duration::from_millis(10);
const ALLOC_BACKOFF_CAP: Duration = Duration::from_secs(5);

#[derive(Clone, Default)]
struct CtrlState {
    group: String,
    disable: bool,
}

/// Pieces the lease refresher needs, shared without holding the whole
/// [`ServBase`] alive from its own background task.
struct LeaseHandle {
    store: Arc<dyn CoordStore>,
    lease: AtomicU64,
    ttl: Duration,
    /// Every lease-bound key this instance has written, for re-publication
    /// after lease reacquisition.
    published: Mutex<BTreeMap<String, String>>,
    /// Global locks riding this lease. A new lease cannot restore lock
    /// ownership, so losing the lease while any are held is fatal.
    locks: Mutex<Vec<String>>,
}

impl LeaseHandle {
    fn lease(&self) -> LeaseId {
        self.lease.load(Ordering::Acquire)
    }

    async fn publish(&self, key: &str, value: &str) -> Result<()> {
        self.store.put(key, value, Some(self.lease())).await?;
        self.published
            .lock()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    /// Grant a fresh lease and re-publish everything bound to the old one.
    async fn reacquire(&self) -> Result<()> {
        if let Some(lock) = self.locks.lock().first() {
            return Err(Error::LeaseLost(format!(
                "lease died while holding lock {lock}"
            )));
        }
        let lease = self.store.grant_lease(self.ttl).await?;
        self.lease.store(lease, Ordering::Release);
        let entries: Vec<(String, String)> = self
            .published
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (key, value) in entries {
            self.store.put(&key, &value, Some(lease)).await?;
        }
        Ok(())
    }
}

/// The publisher owning one `servId` slot and its lease.
pub struct ServBase {
    store: Arc<dyn CoordStore>,
    handle: Arc<LeaseHandle>,
    base_path: String,
    serv_location: String,
    serv_group: String,
    serv_name: String,
    session_key: String,
    serv_id: i32,
    ctrl: Mutex<CtrlState>,
    current: Mutex<BTreeMap<String, ServInfo>>,
    stop_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for ServBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServBase")
            .field("base_path", &self.base_path)
            .field("serv_location", &self.serv_location)
            .field("serv_group", &self.serv_group)
            .field("serv_name", &self.serv_name)
            .field("serv_id", &self.serv_id)
            .finish()
    }
}

impl ServBase {
    /// Allocate a slot for this process and start the lease refresher.
    pub async fn new(
        cfg: &CoordConfig,
        serv_location: &str,
        session_key: &str,
        group: &str,
        sid_offset: i32,
    ) -> Result<Arc<Self>> {
        let (serv_group, serv_name) = split_location(serv_location)?;
        if session_key.is_empty() {
            return Err(Error::Config("session key is empty".to_string()));
        }
        if sid_offset < 0 {
            return Err(Error::Config(format!(
                "sid offset must be non-negative, got {sid_offset}"
            )));
        }

        let store = cfg.connect()?;
        let lease = store.grant_lease(cfg.lease_ttl).await?;
        let handle = Arc::new(LeaseHandle {
            store: store.clone(),
            lease: AtomicU64::new(lease),
            ttl: cfg.lease_ttl,
            published: Mutex::new(BTreeMap::new()),
            locks: Mutex::new(Vec::new()),
        });

        let serv_dir = types::serv_dir(&cfg.base_path, types::DIST_V2, serv_location);
        let lock_name = format!(
            "{}/{}",
            cfg.base_path,
            types::slot_alloc_lock(serv_location)
        );
        let serv_id = allocate_slot(&*store, &serv_dir, &lock_name, sid_offset, &handle).await?;
        info!(serv = serv_location, serv_id, "instance slot allocated");

        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(refresh_loop(handle.clone(), stop_rx));

        Ok(Arc::new(Self {
            store,
            handle,
            base_path: cfg.base_path.clone(),
            serv_location: serv_location.to_string(),
            serv_group,
            serv_name,
            session_key: session_key.to_string(),
            serv_id,
            ctrl: Mutex::new(CtrlState {
                group: group.to_string(),
                disable: false,
            }),
            current: Mutex::new(BTreeMap::new()),
            stop_tx,
        }))
    }

    pub fn serv_id(&self) -> i32 {
        self.serv_id
    }

    /// Full `group/service` location.
    pub fn serv_location(&self) -> &str {
        &self.serv_location
    }

    pub fn serv_group(&self) -> &str {
        &self.serv_group
    }

    pub fn serv_name(&self) -> &str {
        &self.serv_name
    }

    pub fn session_key(&self) -> &str {
        &self.session_key
    }

    /// Per-instance name used for log directories and diagnostics.
    pub fn copy_name(&self) -> String {
        format!("{}/{}", self.serv_location, self.serv_id)
    }

    fn reg_key(&self) -> String {
        let dir = types::serv_dir(&self.base_path, types::DIST_V2, &self.serv_location);
        format!(
            "{}/{}",
            types::slot_dir(&dir, self.serv_id),
            types::REG_KEY
        )
    }

    fn reg_payload(&self, servs: &BTreeMap<String, ServInfo>) -> Result<String> {
        let ctrl = {
            let c = self.ctrl.lock();
            if c.disable || !c.group.is_empty() {
                Some(ServCtrl {
                    weight: 0,
                    disable: c.disable,
                    group: c.group.clone(),
                })
            } else {
                None
            }
        };
        let reg = RegData {
            servs: servs.clone(),
            ctrl,
        };
        Ok(serde_json::to_string(&reg)?)
    }

    /// Publish the process's endpoint set under this slot's `reg` key.
    ///
    /// Idempotent: re-registering the same endpoints writes an identical
    /// payload, so callers may invoke it on every change without dedup.
    pub async fn register_service(&self, servs: BTreeMap<String, ServInfo>) -> Result<()> {
        let payload = self.reg_payload(&servs)?;
        *self.current.lock() = servs;
        self.handle.publish(&self.reg_key(), &payload).await?;
        info!(serv = %self.serv_location, serv_id = self.serv_id, "service registered");
        Ok(())
    }

    /// Best-effort mirror of the endpoint set into the cross-DC subtree.
    pub async fn register_cross_dc(&self, servs: BTreeMap<String, ServInfo>) -> Result<()> {
        let key = format!(
            "{}/{}/{}/{}/{}",
            self.base_path,
            types::CROSS_DC_LOC,
            self.serv_location,
            self.serv_id,
            types::REG_KEY
        );
        let payload = self.reg_payload(&servs)?;
        self.handle.publish(&key, &payload).await
    }

    /// Publish the backdoor endpoint under its reserved subtree so it is
    /// not discoverable as application traffic.
    pub async fn register_backdoor(&self, servs: BTreeMap<String, ServInfo>) -> Result<()> {
        self.register_reserved(types::BACKDOOR_LOC, servs).await
    }

    /// Publish the metrics endpoint under its reserved subtree.
    pub async fn register_metrics(&self, servs: BTreeMap<String, ServInfo>) -> Result<()> {
        self.register_reserved(types::METRICS_LOC, servs).await
    }

    async fn register_reserved(
        &self,
        loc: &str,
        servs: BTreeMap<String, ServInfo>,
    ) -> Result<()> {
        let key = format!(
            "{}/{}/{}/{}",
            self.base_path, loc, self.serv_location, self.serv_id
        );
        let payload = serde_json::to_string(&RegData { servs, ctrl: None })?;
        self.handle.publish(&key, &payload).await
    }

    /// Update the instance's own group/disable metadata and rewrite `reg`.
    /// The operator-owned `manual` key is never touched.
    pub async fn set_group_and_disable(&self, group: &str, disable: bool) -> Result<()> {
        {
            let mut c = self.ctrl.lock();
            c.group = group.to_string();
            c.disable = disable;
        }
        let servs = self.current.lock().clone();
        let payload = self.reg_payload(&servs)?;
        self.handle.publish(&self.reg_key(), &payload).await?;
        debug!(serv_id = self.serv_id, group, disable, "reg metadata updated");
        Ok(())
    }

    /// Raw published `reg` values of every slot in this service, for
    /// in-process address lookups.
    pub async fn reg_infos(&self) -> Result<Vec<String>> {
        let dir = types::serv_dir(&self.base_path, types::DIST_V2, &self.serv_location);
        let snap = self.store.get_prefix(&dir).await?;
        Ok(snap
            .entries
            .into_iter()
            .filter(|e| e.key.ends_with(&format!("/{}", types::REG_KEY)))
            .map(|e| e.value)
            .collect())
    }

    /// Fetch this service's configuration document from the `etc` subtree.
    /// Absent documents yield the type's defaults.
    pub async fn serv_config<T>(&self) -> Result<T>
    where
        T: Default + DeserializeOwned,
    {
        let key = format!(
            "{}/{}/{}/config",
            self.base_path,
            types::ETC_LOC,
            self.serv_location
        );
        let snap = self.store.get_prefix(&key).await?;
        match snap.value_of(&key) {
            Some(raw) if !raw.is_empty() => Ok(serde_json::from_str(raw)?),
            _ => Ok(T::default()),
        }
    }

    /// Acquire a named process-wide distributed lock, blocking until held.
    /// The lock rides this instance's lease: losing the lease releases it.
    pub async fn lock_global(&self, name: &str) -> Result<()> {
        let lock = format!("{}/{}", self.base_path, name);
        self.store.lock(&lock, self.handle.lease()).await?;
        self.handle.locks.lock().push(lock);
        Ok(())
    }

    /// Cancel the refresher and release the lease; the store deletes this
    /// slot's `reg` within one heartbeat.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.store.revoke_lease(self.handle.lease()).await {
            warn!(error = %e, "lease revoke on stop failed");
        }
        info!(serv_id = self.serv_id, "servbase stopped");
    }
}

fn split_location(serv_location: &str) -> Result<(String, String)> {
    let mut parts = serv_location.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(group), Some(service), None) if !group.is_empty() && !service.is_empty() => {
            Ok((group.to_string(), service.to_string()))
        }
        _ => Err(Error::Config(format!(
            "service location must look like group/service, got {serv_location:?}"
        ))),
    }
}

/// Pick the lowest free slot id under the service directory, holding the
/// per-service allocation lock. Retries transient store failures with
/// jittered exponential backoff for up to [`ALLOC_DEADLINE`].
async fn allocate_slot(
    store: &dyn CoordStore,
    serv_dir: &str,
    lock_name: &str,
    sid_offset: i32,
    handle: &LeaseHandle,
) -> Result<i32> {
    let deadline = Instant::now() + ALLOC_DEADLINE;
    let mut backoff = Backoff::new(ALLOC_BACKOFF_INITIAL, ALLOC_BACKOFF_CAP).with_jitter();
    loop {
        match try_allocate_slot(store, serv_dir, lock_name, sid_offset, handle).await {
            Ok(id) => return Ok(id),
            Err(e) if e.is_transient() && Instant::now() < deadline => {
                warn!(error = %e, serv_dir, "slot allocation contended, retrying");
                backoff.wait().await;
            }
            Err(e) if e.is_transient() => {
                return Err(Error::Timeout(format!(
                    "slot allocation under {serv_dir} did not settle: {e}"
                )));
            }
            Err(e) => return Err(e),
        }
    }
}

async fn try_allocate_slot(
    store: &dyn CoordStore,
    serv_dir: &str,
    lock_name: &str,
    sid_offset: i32,
    handle: &LeaseHandle,
) -> Result<i32> {
    let lease = handle.lease();
    store.lock(lock_name, lease).await?;
    let outcome = async {
        let snap = store.get_prefix(serv_dir).await?;
        let taken: HashSet<i32> = snap
            .entries
            .iter()
            .filter_map(|e| e.key.strip_prefix(serv_dir))
            .filter_map(|rest| rest.trim_start_matches('/').split('/').next())
            .filter_map(|sid| sid.parse::<i32>().ok())
            .filter(|sid| *sid >= 0)
            .collect();
        let mut candidate = sid_offset;
        while taken.contains(&candidate) {
            candidate += 1;
        }
        // Claim the slot with an empty reg so concurrent allocators see it;
        // discovery tolerates the empty value until registration.
        let reg = format!(
            "{}/{}",
            types::slot_dir(serv_dir, candidate),
            types::REG_KEY
        );
        handle.publish(&reg, "").await?;
        Ok(candidate)
    }
    .await;
    if let Err(e) = store.unlock(lock_name, lease).await {
        warn!(error = %e, lock_name, "slot allocation unlock failed");
    }
    outcome
}

/// Keep the lease alive at half-TTL cadence; on refresh failure attempt
/// reacquisition, and treat more than one TTL without a live lease as fatal.
async fn refresh_loop(handle: Arc<LeaseHandle>, mut stop_rx: watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(handle.ttl / 2);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_ok = Instant::now();
    loop {
        tokio::select! {
            res = stop_rx.changed() => {
                if res.is_err() || *stop_rx.borrow() {
                    return;
                }
            }
            _ = tick.tick() => {
                if *stop_rx.borrow() {
                    return;
                }
                match handle.store.keep_alive(handle.lease()).await {
                    Ok(()) => last_ok = Instant::now(),
                    Err(e) => {
                        if *stop_rx.borrow() {
                            return;
                        }
                        warn!(error = %e, "lease refresh failed, reacquiring");
                        match handle.reacquire().await {
                            Ok(()) => {
                                info!(lease = handle.lease(), "lease reacquired");
                                last_ok = Instant::now();
                            }
                            Err(e @ Error::LeaseLost(_)) => {
                                error!(error = %e, "leadership lock lost, terminating");
                                std::process::exit(1);
                            }
                            Err(e) if last_ok.elapsed() > handle.ttl => {
                                error!(
                                    error = %e,
                                    "lease unrecoverable for a full TTL; \
                                     another instance may own this slot"
                                );
                                std::process::exit(1);
                            }
                            Err(e) => warn!(error = %e, "lease reacquisition failed"),
                        }
                    }
                }
            }
        }
    }
}
