//! Carto store: in-RAM reverse index from watched objects to the workloads that depend on them.

#![forbid(unsafe_code)]

use std::hash::BuildHasherDefault;
use std::time::{Duration, Instant};

use carto_core::NamespacedName;
use dashmap::DashMap;
use rustc_hash::{FxHashMap, FxHasher};
use smallvec::SmallVec;
use tracing::debug;

/// API group + kind of a watched object (version-independent).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupKind {
    pub group: String,
    pub kind: String,
}

impl GroupKind {
    pub fn new(group: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { group: group.into(), kind: kind.into() }
    }
}

/// A tracked upstream object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key {
    pub group_kind: GroupKind,
    pub object: NamespacedName,
}

impl Key {
    pub fn new(group_kind: GroupKind, object: NamespacedName) -> Self {
        Self { group_kind, object }
    }
}

pub type Owners = SmallVec<[NamespacedName; 4]>;

type FxBuild = BuildHasherDefault<FxHasher>;

/// Reverse index `Key -> {owner -> expiry}`. Sharded map; writers only hold a
/// shard lock while mutating a single key's edge set.
pub struct DependencyTracker {
    ttl: Duration,
    edges: DashMap<Key, FxHashMap<NamespacedName, Instant>, FxBuild>,
}

impl DependencyTracker {
    /// Edges expire `ttl` after their last renewal (second resolution).
    pub fn new(ttl: Duration) -> Self {
        Self { ttl: Duration::from_secs(ttl.as_secs().max(1)), edges: DashMap::with_hasher(FxBuild::default()) }
    }

    pub fn track(&self, key: Key, owner: NamespacedName) {
        self.track_at(key, owner, Instant::now());
    }

    pub fn track_at(&self, key: Key, owner: NamespacedName, now: Instant) {
        debug!(kind = %key.group_kind.kind, object = %key.object, owner = %owner, "tracking dependency");
        self.edges.entry(key).or_default().insert(owner, now + self.ttl);
    }

    /// Remove every edge pointing at `owner`.
    pub fn clear_tracked(&self, owner: &NamespacedName) {
        for mut entry in self.edges.iter_mut() {
            entry.value_mut().remove(owner);
        }
        self.edges.retain(|_, owners| !owners.is_empty());
    }

    pub fn lookup(&self, key: &Key) -> Owners {
        self.lookup_at(key, Instant::now())
    }

    /// Live owners for `key`; expired edges are dropped on the way.
    pub fn lookup_at(&self, key: &Key, now: Instant) -> Owners {
        let mut out = Owners::new();
        let emptied = match self.edges.get_mut(key) {
            Some(mut owners) => {
                owners.retain(|_, expiry| *expiry > now);
                out.extend(owners.keys().cloned());
                owners.is_empty()
            }
            None => false,
        };
        if emptied {
            self.edges.remove_if(key, |_, owners| owners.is_empty());
        }
        out.sort();
        metrics::counter!("dependency_lookup_total", 1u64);
        out
    }

    /// Number of tracked keys (expired edges included until looked up or cleared).
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}
