//! Kache store: objects keyed by partition and UID, plus the set of
//! partitions that have a live watch.

#![forbid(unsafe_code)]

use kache_core::{uid_of, Error, Partition, Result, Uid};
use kube::core::DynamicObject;
use metrics::gauge;
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

#[derive(Default)]
struct Inner {
    objects: FxHashMap<Partition, FxHashMap<Uid, DynamicObject>>,
    watched: FxHashSet<Partition>,
    closed: bool,
}

/// Shared cache. Every operation takes the single lock once, so readers
/// never observe half of a write.
#[derive(Default)]
pub struct CacheStore {
    inner: RwLock<Inner>,
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace by UID. Last write wins.
    pub fn upsert(&self, partition: &Partition, obj: DynamicObject) -> Result<Uid> {
        let uid = uid_of(&obj)?;
        let mut inner = self.inner.write();
        inner.objects.entry(partition.clone()).or_default().insert(uid, obj);
        Ok(uid)
    }

    /// Returns whether an entry was present.
    pub fn remove(&self, partition: &Partition, uid: &Uid) -> bool {
        let mut inner = self.inner.write();
        match inner.objects.get_mut(partition) {
            Some(objs) => objs.remove(uid).is_some(),
            None => false,
        }
    }

    /// Replace the partition's contents with `objs`. Objects without a UID are
    /// skipped and counted in the returned value.
    pub fn resync(&self, partition: &Partition, objs: Vec<DynamicObject>) -> usize {
        let mut fresh = FxHashMap::default();
        let mut skipped = 0;
        for obj in objs {
            match uid_of(&obj) {
                Ok(uid) => {
                    fresh.insert(uid, obj);
                }
                Err(_) => skipped += 1,
            }
        }
        let mut inner = self.inner.write();
        let prev = inner.objects.insert(partition.clone(), fresh).map(|m| m.len()).unwrap_or(0);
        debug!(partition = %partition, prev, now = inner.objects[partition].len(), "partition resynced");
        skipped
    }

    /// Objects of `partition` in `namespace` (empty matches every namespace),
    /// optionally narrowed to one name. No ordering is guaranteed.
    pub fn query(&self, partition: &Partition, namespace: &str, name: Option<&str>) -> Vec<DynamicObject> {
        let inner = self.inner.read();
        let Some(objs) = inner.objects.get(partition) else {
            return Vec::new();
        };
        objs.values()
            .filter(|o| namespace.is_empty() || o.metadata.namespace.as_deref() == Some(namespace))
            .filter(|o| name.map_or(true, |n| o.metadata.name.as_deref() == Some(n)))
            .cloned()
            .collect()
    }

    pub fn len(&self, partition: &Partition) -> usize {
        self.inner.read().objects.get(partition).map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_watched(&self, partition: &Partition) -> bool {
        self.inner.read().watched.contains(partition)
    }

    /// Returns false if the partition was already marked. Fails with
    /// [`Error::Cancelled`] once the store has been cleared.
    pub fn mark_watched(&self, partition: &Partition) -> Result<bool> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(Error::Cancelled);
        }
        let added = inner.watched.insert(partition.clone());
        gauge!("kache_watched_partitions", inner.watched.len() as f64);
        Ok(added)
    }

    /// Watched partitions, sorted by GVK key.
    pub fn watched(&self) -> Vec<Partition> {
        let mut out: Vec<_> = self.inner.read().watched.iter().cloned().collect();
        out.sort_by_key(|p| p.to_string());
        out
    }

    /// Drop every object and every watch mark. No partition can be marked
    /// afterwards.
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.closed = true;
        inner.objects.clear();
        inner.watched.clear();
        gauge!("kache_watched_partitions", 0.0);
    }
}
