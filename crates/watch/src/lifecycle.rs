use std::sync::Arc;
use std::time::Instant;

use kache_core::{Error, Partition, ResourceResolver, Result, WatchFactory};
use kache_store::CacheStore;
use metrics::{counter, histogram};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::handler::CacheEventHandler;

/// Turns an unwatched partition into a live, delivering watch. Callers must
/// hold the orchestrator's establishment guard.
pub(crate) struct InformerManager {
    resolver: Arc<dyn ResourceResolver>,
    factory: Arc<dyn WatchFactory>,
    store: Arc<CacheStore>,
    cancel: CancellationToken,
}

impl InformerManager {
    pub(crate) fn new(
        resolver: Arc<dyn ResourceResolver>,
        factory: Arc<dyn WatchFactory>,
        store: Arc<CacheStore>,
        cancel: CancellationToken,
    ) -> Self {
        Self { resolver, factory, store, cancel }
    }

    /// Resolve, attach, start, then mark. Nothing is left behind on failure.
    pub(crate) async fn establish(&self, partition: &Partition) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let t0 = Instant::now();

        let resource = self.resolver.resolve(partition).await?;
        let handle = self.factory.for_resource(&resource);
        let handler = Arc::new(CacheEventHandler::new(partition.clone(), Arc::clone(&self.store)));
        let id = handle.attach_handler(handler)?;

        if let Err(e) = self.factory.start(&self.cancel) {
            handle.detach_handler(id);
            warn!(partition = %partition, error = %e, "watch start failed; handler detached");
            return Err(e);
        }

        // cancellation may have fired while we were resolving; the store
        // refuses the mark once teardown has cleared it
        let marked = if self.cancel.is_cancelled() { Err(Error::Cancelled) } else { self.store.mark_watched(partition) };
        if let Err(e) = marked {
            handle.detach_handler(id);
            info!(partition = %partition, "watch abandoned after cancellation; handler detached");
            return Err(e);
        }
        counter!("kache_establish_total", 1);
        histogram!("kache_establish_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(partition = %partition, resource = %resource.plural, took_ms = %t0.elapsed().as_millis(), "watch established");
        Ok(())
    }
}
