//! Client-side discovery and load balancing
//!
//! A [`DiscoveryClient`] watches one peer service's directory in the
//! coordination store, reassembles the full instance set on every change,
//! and rebuilds a consistent-hash ring over the weighted, non-disabled
//! instances. Watch events are never applied incrementally; only a full
//! re-read is trusted.

mod ring;

pub use ring::HashRing;

use crate::backoff::Backoff;
use crate::config::CoordConfig;
use crate::coord::{CoordStore, Revision, Snapshot};
use crate::registry::types::{self, DEFAULT_WEIGHT};
use crate::registry::{ManualData, RegData, ServInfo};
use crate::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const WATCH_BACKOFF_INITIAL: Duration = Duration::from_millis(10);
const WATCH_BACKOFF_CAP: Duration = Duration::from_secs(5);

/// One peer instance as observed by discovery.
#[derive(Debug, Clone, Default)]
pub struct ServCopy {
    pub serv_id: i32,
    pub reg: Option<RegData>,
    pub manual: Option<ManualData>,
}

impl ServCopy {
    fn manual_ctrl(&self) -> Option<&types::ServCtrl> {
        self.manual.as_ref().and_then(|m| m.ctrl.as_ref())
    }

    fn reg_ctrl(&self) -> Option<&types::ServCtrl> {
        self.reg.as_ref().and_then(|r| r.ctrl.as_ref())
    }

    /// Disabled through either the operator's manual key or the instance's
    /// own published metadata.
    pub fn disabled(&self) -> bool {
        self.manual_ctrl().map(|c| c.disable).unwrap_or(false)
            || self.reg_ctrl().map(|c| c.disable).unwrap_or(false)
    }

    /// Ring weight: first nonzero of manual, published metadata, default.
    pub fn weight(&self) -> u32 {
        [self.manual_ctrl(), self.reg_ctrl()]
            .into_iter()
            .flatten()
            .map(|c| c.weight)
            .find(|w| *w != 0)
            .unwrap_or(DEFAULT_WEIGHT)
    }

    fn has_endpoints(&self) -> bool {
        self.reg.as_ref().map(|r| !r.servs.is_empty()).unwrap_or(false)
    }
}

impl fmt::Display for ServCopy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let servs = self.reg.as_ref().map(|r| r.servs.len()).unwrap_or(0);
        write!(
            f,
            "{}[servs:{} weight:{}{}]",
            self.serv_id,
            servs,
            self.weight(),
            if self.disabled() { " disabled" } else { "" }
        )
    }
}

#[derive(Default)]
struct RouteTable {
    ring: HashRing,
    copies: HashMap<i32, ServCopy>,
}

impl RouteTable {
    fn lookup(&self, serv_id: i32, processor: &str) -> Option<ServInfo> {
        let copy = self.copies.get(&serv_id)?;
        // A concurrent manual change may not have rebuilt the ring yet.
        if copy.disabled() {
            return None;
        }
        copy.reg.as_ref()?.servs.get(processor).cloned()
    }
}

/// Long-lived discovery view over one peer service.
///
/// Lives for the process lifetime; there is no user-exposed cancellation.
pub struct DiscoveryClient {
    serv_key: String,
    serv_path: String,
    store: Arc<dyn CoordStore>,
    table: Mutex<RouteTable>,
}

impl DiscoveryClient {
    /// Probe the service's layout version, load the initial snapshot, and
    /// start the background watch loop. The chosen version is sticky.
    pub async fn new(cfg: &CoordConfig, serv_location: &str) -> Result<Arc<Self>> {
        let store = cfg.connect()?;
        let dist_loc = check_dist_version(&*store, &cfg.base_path, serv_location).await;
        let serv_path = types::serv_dir(&cfg.base_path, dist_loc, serv_location);
        info!(serv = serv_location, dist = dist_loc, path = %serv_path, "discovery client starting");

        let client = Arc::new(Self {
            serv_key: serv_location.to_string(),
            serv_path,
            store,
            table: Mutex::new(RouteTable::default()),
        });

        let snap = client.store.get_prefix(&client.serv_path).await?;
        let rev = snap.revision;
        client.apply_snapshot(dist_loc, &snap);

        let watcher = client.clone();
        tokio::spawn(watch_loop(watcher, dist_loc, rev));

        Ok(client)
    }

    /// Service location this client watches.
    pub fn serv_key(&self) -> &str {
        &self.serv_key
    }

    /// Full store prefix this client watches.
    pub fn serv_path(&self) -> &str {
        &self.serv_path
    }

    /// Route a key to one instance's endpoint for the named processor.
    pub fn get_serv_addr(&self, processor: &str, key: &str) -> Option<ServInfo> {
        let table = self.table.lock();
        let Some(label) = table.ring.get(key) else {
            warn!(serv = %self.serv_key, processor, "routing over empty instance set");
            return None;
        };
        let serv_id = match label.split('-').next().and_then(|s| s.parse::<i32>().ok()) {
            Some(id) => id,
            None => {
                error!(serv = %self.serv_key, label, "malformed ring label");
                return None;
            }
        };
        table.lookup(serv_id, processor)
    }

    /// Route directly to a known instance, bypassing the ring.
    pub fn get_serv_addr_with_servid(
        &self,
        serv_id: i32,
        processor: &str,
        _key: &str,
    ) -> Option<ServInfo> {
        self.table.lock().lookup(serv_id, processor)
    }

    fn apply_snapshot(&self, dist_loc: &str, snap: &Snapshot) {
        let copies = if dist_loc == types::DIST_V1 {
            assemble_v1(&self.serv_path, snap)
        } else {
            assemble_v2(&self.serv_path, snap)
        };
        if copies.is_empty() {
            warn!(path = %self.serv_path, "no instances under service path");
        }
        let ring = build_ring(&copies);

        let mut ids: Vec<i32> = copies.keys().copied().collect();
        ids.sort_unstable();
        let rendered: Vec<String> = ids.iter().map(|id| copies[id].to_string()).collect();
        debug!(
            path = %self.serv_path,
            revision = snap.revision,
            members = ring.len(),
            copies = %rendered.join(";"),
            "discovery view rebuilt"
        );

        // Swap ring and copies together so readers never see a mix of
        // revisions.
        *self.table.lock() = RouteTable { ring, copies };
    }
}

/// Probe v2 first; fall back to v1 when v2 shows no populated `reg`
/// children but v1 has content.
async fn check_dist_version(
    store: &dyn CoordStore,
    base_path: &str,
    serv_location: &str,
) -> &'static str {
    let v2 = types::serv_dir(base_path, types::DIST_V2, serv_location);
    match store.get_prefix(&v2).await {
        Ok(snap)
            if snap
                .entries
                .iter()
                .any(|e| e.key.ends_with(&format!("/{}", types::REG_KEY)) && !e.value.is_empty()) =>
        {
            return types::DIST_V2;
        }
        Ok(_) => {}
        Err(e) => warn!(path = %v2, error = %e, "dist v2 probe failed"),
    }

    let v1 = types::serv_dir(base_path, types::DIST_V1, serv_location);
    match store.get_prefix(&v1).await {
        Ok(snap) if !snap.entries.is_empty() => types::DIST_V1,
        Ok(_) => types::DIST_V2,
        Err(e) => {
            warn!(path = %v1, error = %e, "dist v1 probe failed, assuming v2");
            types::DIST_V2
        }
    }
}

/// Wait for a change after the known revision, then resynchronize with a
/// full read. Store errors back off exponentially; any successful event
/// resets the backoff.
async fn watch_loop(client: Arc<DiscoveryClient>, dist_loc: &'static str, mut revision: Revision) {
    let mut backoff = Backoff::new(WATCH_BACKOFF_INITIAL, WATCH_BACKOFF_CAP);
    loop {
        if let Err(e) = client.store.watch_next(&client.serv_path, revision).await {
            warn!(path = %client.serv_path, error = %e, "watch failed, backing off");
            backoff.wait().await;
            continue;
        }
        match client.store.get_prefix(&client.serv_path).await {
            Ok(snap) => {
                revision = snap.revision;
                client.apply_snapshot(dist_loc, &snap);
                backoff.reset();
            }
            Err(e) => {
                warn!(path = %client.serv_path, error = %e, "resync read failed, backing off");
                backoff.wait().await;
            }
        }
    }
}

/// v2 layout: `<path>/<servId>/{reg,manual}`. Slots with undecodable
/// payloads are logged and excluded from this revision.
fn assemble_v2(serv_path: &str, snap: &Snapshot) -> HashMap<i32, ServCopy> {
    let mut raw: HashMap<i32, (Option<String>, Option<String>)> = HashMap::new();
    for entry in &snap.entries {
        let Some(rest) = entry.key.strip_prefix(serv_path) else {
            continue;
        };
        let mut parts = rest.trim_start_matches('/').split('/');
        let (Some(sid), Some(child), None) = (parts.next(), parts.next(), parts.next()) else {
            debug!(key = %entry.key, "unexpected key shape under service path");
            continue;
        };
        let Ok(serv_id) = sid.parse::<i32>() else {
            warn!(key = %entry.key, "slot name is not an integer, skipping");
            continue;
        };
        if serv_id < 0 {
            warn!(key = %entry.key, "negative slot id, skipping");
            continue;
        }
        let slot = raw.entry(serv_id).or_default();
        match child {
            types::REG_KEY => slot.0 = Some(entry.value.clone()),
            types::MANUAL_KEY => slot.1 = Some(entry.value.clone()),
            other => debug!(key = %entry.key, child = other, "ignoring unknown slot child"),
        }
    }

    let mut ids: Vec<i32> = raw.keys().copied().collect();
    ids.sort_unstable();

    let mut copies = HashMap::with_capacity(ids.len());
    'slots: for serv_id in ids {
        let (reg_raw, manual_raw) = &raw[&serv_id];
        let mut copy = ServCopy {
            serv_id,
            ..Default::default()
        };
        if let Some(raw) = reg_raw {
            if !raw.is_empty() {
                match serde_json::from_str::<RegData>(raw) {
                    Ok(reg) => copy.reg = Some(reg),
                    Err(e) => {
                        error!(serv_id, error = %e, payload = %raw, "bad reg payload, slot excluded");
                        continue 'slots;
                    }
                }
            }
        }
        if let Some(raw) = manual_raw {
            if !raw.is_empty() {
                match serde_json::from_str::<ManualData>(raw) {
                    Ok(manual) => copy.manual = Some(manual),
                    Err(e) => {
                        error!(serv_id, error = %e, payload = %raw, "bad manual payload, slot excluded");
                        continue 'slots;
                    }
                }
            }
        }
        copies.insert(serv_id, copy);
    }
    copies
}

/// v1 layout: the slot key holds the servs mapping directly.
fn assemble_v1(serv_path: &str, snap: &Snapshot) -> HashMap<i32, ServCopy> {
    let mut copies = HashMap::new();
    for entry in &snap.entries {
        let Some(rest) = entry.key.strip_prefix(serv_path) else {
            continue;
        };
        let sid = rest.trim_start_matches('/');
        let Ok(serv_id) = sid.parse::<i32>() else {
            warn!(key = %entry.key, "slot name is not an integer, skipping");
            continue;
        };
        if serv_id < 0 {
            continue;
        }
        match serde_json::from_str(&entry.value) {
            Ok(servs) => {
                copies.insert(
                    serv_id,
                    ServCopy {
                        serv_id,
                        reg: Some(RegData { servs, ctrl: None }),
                        manual: None,
                    },
                );
            }
            Err(e) => {
                error!(serv_id, error = %e, payload = %entry.value, "bad v1 payload, slot excluded");
            }
        }
    }
    copies
}

/// Weighted virtual labels for every routable slot.
fn build_ring(copies: &HashMap<i32, ServCopy>) -> HashRing {
    let mut ids: Vec<i32> = copies.keys().copied().collect();
    ids.sort_unstable();

    let mut labels = Vec::new();
    for id in ids {
        let copy = &copies[&id];
        if !copy.has_endpoints() {
            debug!(serv_id = id, "slot has no endpoints, not routable");
            continue;
        }
        if copy.disabled() {
            debug!(serv_id = id, "slot disabled, not routable");
            continue;
        }
        for i in 0..copy.weight() {
            labels.push(format!("{id}-{i}"));
        }
    }
    HashRing::from_labels(labels)
}
