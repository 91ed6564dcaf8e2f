//! Registration wire payloads and key layout
//!
//! Payloads are UTF-8 JSON, parsed order-independently; unknown fields are
//! ignored and missing fields take their documented defaults. `servs` is a
//! `BTreeMap` so repeated registrations of the same endpoint set serialize
//! byte-identically.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Distribution layout version 1: the slot key holds the servs map directly.
pub const DIST_V1: &str = "dist";
/// Distribution layout version 2: per-slot `reg`/`manual` children.
pub const DIST_V2: &str = "dist/v2";
/// Slot child owned by the instance, lease-bound.
pub const REG_KEY: &str = "reg";
/// Slot child owned by operators, persistent.
pub const MANUAL_KEY: &str = "manual";

/// Subtree for the in-process health/control endpoint.
pub const BACKDOOR_LOC: &str = "backdoor";
/// Subtree for the metrics endpoint.
pub const METRICS_LOC: &str = "metrics";
/// Subtree mirrored to peer data centers.
pub const CROSS_DC_LOC: &str = "cross-dc";
/// Subtree for service configuration documents.
pub const ETC_LOC: &str = "etc";

/// Reserved processor names; user processors may not start with `_`.
pub const PROC_BACKDOOR: &str = "_PROC_BACKDOOR";
pub const PROC_METRICS: &str = "_PROC_METRICS";

/// Ring weight of a slot with no override.
pub const DEFAULT_WEIGHT: u32 = 100;

/// Transport kind of one processor endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessorKind {
    Http,
    Thrift,
    Grpc,
    Gin,
}

impl fmt::Display for ProcessorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessorKind::Http => "http",
            ProcessorKind::Thrift => "thrift",
            ProcessorKind::Grpc => "grpc",
            ProcessorKind::Gin => "gin",
        };
        f.write_str(s)
    }
}

/// Externally visible endpoint of one processor for one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServInfo {
    #[serde(rename = "type")]
    pub kind: ProcessorKind,
    pub addr: String,
}

impl ServInfo {
    pub fn new(kind: ProcessorKind, addr: impl Into<String>) -> Self {
        Self {
            kind,
            addr: addr.into(),
        }
    }
}

/// Weighting and routing overrides for one slot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServCtrl {
    #[serde(default)]
    pub weight: u32,
    #[serde(default)]
    pub disable: bool,
    #[serde(default)]
    pub group: String,
}

/// Full endpoint set published by one instance under its `reg` key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegData {
    #[serde(default)]
    pub servs: BTreeMap<String, ServInfo>,
    /// Instance-written group/disable metadata; omitted while in the
    /// default state so the payload stays the plain servs mapping.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ctrl: Option<ServCtrl>,
}

/// Operator-owned overrides stored under the slot's `manual` key. Never
/// written by the instance itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualData {
    #[serde(default)]
    pub ctrl: Option<ServCtrl>,
}

/// `<base>/<dist>/<group>/<service>` directory of a service.
pub fn serv_dir(base: &str, dist: &str, serv_location: &str) -> String {
    format!("{base}/{dist}/{serv_location}")
}

/// `<servDir>/<servId>` slot directory.
pub fn slot_dir(serv_dir: &str, serv_id: i32) -> String {
    format!("{serv_dir}/{serv_id}")
}

/// Lock name guarding slot allocation for one service.
pub fn slot_alloc_lock(serv_location: &str) -> String {
    format!("{serv_location}-slot-alloc")
}

/// Lock name for leader/follower election of one service.
pub fn master_slave_lock(serv_location: &str) -> String {
    format!("{serv_location}-master-slave")
}
