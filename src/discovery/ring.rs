//! Consistent hash ring over weighted instance labels
//!
//! Members are virtual labels `"<servId>-<replica>"`. Each label is fanned
//! out to a fixed number of points so arc shares track weights closely.
//! Hashing is deterministic, so identical label sets yield identical routing
//! in every process.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

/// Virtual points per label.
const POINTS_PER_LABEL: usize = 20;

/// Consistent hash ring mapping routing keys to member labels.
#[derive(Debug, Default)]
pub struct HashRing {
    ring: BTreeMap<u64, String>,
    members: usize,
}

impl HashRing {
    /// Build a fresh ring from the full label list.
    pub fn from_labels<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut ring = BTreeMap::new();
        let mut members = 0;
        for label in labels {
            let label = label.as_ref();
            members += 1;
            for i in 0..POINTS_PER_LABEL {
                ring.insert(hash_key(&format!("{label}:{i}")), label.to_string());
            }
        }
        Self { ring, members }
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Number of labels the ring was built from.
    pub fn len(&self) -> usize {
        self.members
    }

    /// Label owning the arc the key hashes into.
    pub fn get(&self, key: &str) -> Option<&str> {
        if self.ring.is_empty() {
            return None;
        }
        let hash = hash_key(key);
        self.ring
            .range(hash..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, label)| label.as_str())
    }

    /// The points a label contributes; used to reason about rebuild
    /// stability in tests.
    #[cfg(test)]
    fn points_of(&self, label: &str) -> Vec<u64> {
        self.ring
            .iter()
            .filter(|(_, l)| l.as_str() == label)
            .map(|(h, _)| *h)
            .collect()
    }
}

fn hash_key(key: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}
