use std::sync::Arc;

use kache_core::{prepare, uid_of, EventHandler, Partition, WatchEvent};
use kache_store::CacheStore;
use metrics::counter;
use tracing::{debug, warn};

/// Applies watch events for one partition to the shared cache. Add and Update
/// both upsert by UID, so redelivery converges to the same state.
pub struct CacheEventHandler {
    partition: Partition,
    store: Arc<CacheStore>,
}

impl CacheEventHandler {
    pub fn new(partition: Partition, store: Arc<CacheStore>) -> Self {
        Self { partition, store }
    }
}

impl EventHandler for CacheEventHandler {
    fn handle(&self, event: WatchEvent) {
        counter!("kache_events_total", 1);
        match event {
            WatchEvent::Added(obj) | WatchEvent::Updated(obj) => {
                if let Err(e) = self.store.upsert(&self.partition, prepare(obj)) {
                    counter!("kache_events_rejected_total", 1);
                    warn!(partition = %self.partition, error = %e, "dropping event");
                }
            }
            WatchEvent::Deleted(obj) => match uid_of(&obj) {
                Ok(uid) => {
                    let existed = self.store.remove(&self.partition, &uid);
                    debug!(partition = %self.partition, name = ?obj.metadata.name, existed, "object deleted");
                }
                Err(e) => {
                    counter!("kache_events_rejected_total", 1);
                    warn!(partition = %self.partition, error = %e, "dropping delete");
                }
            },
            WatchEvent::Resynced(objs) => {
                let count = objs.len();
                let skipped = self.store.resync(&self.partition, objs.into_iter().map(prepare).collect());
                if skipped > 0 {
                    counter!("kache_events_rejected_total", skipped as u64);
                    warn!(partition = %self.partition, skipped, "resync dropped objects without uid");
                }
                debug!(partition = %self.partition, count, "resync applied");
            }
        }
    }
}
