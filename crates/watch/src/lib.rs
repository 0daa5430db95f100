//! Kache watch: answers List/Get from a live per-kind watch once one exists,
//! and from the backend store until then.
//!
//! The first read of a partition establishes its watch (resolve, attach the
//! cache handler, start delivery) and is answered by the backend. Every later
//! read of that partition is served from the cache the watch keeps current.

#![forbid(unsafe_code)]

use std::future::Future;
use std::sync::Arc;

use kache_core::{BackendStore, Error, Key, Partition, ResourceResolver, Result, WatchFactory};
use kache_store::CacheStore;
use kube::core::DynamicObject;
use metrics::counter;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

mod handler;
mod lifecycle;

pub use handler::CacheEventHandler;
use lifecycle::InformerManager;

pub struct Watch {
    store: Arc<CacheStore>,
    manager: InformerManager,
    backend: Arc<dyn BackendStore>,
    cancel: CancellationToken,
    establish: Mutex<()>,
}

impl Watch {
    pub fn builder() -> WatchBuilder {
        WatchBuilder::default()
    }

    /// List objects matching `key.namespace` (empty means all namespaces).
    pub async fn list(&self, key: &Key) -> Result<Vec<DynamicObject>> {
        let partition = key.partition();
        if self.store.is_watched(&partition) {
            counter!("kache_cache_hits_total", 1);
            return Ok(self.store.query(&partition, &key.namespace, None));
        }
        self.ensure_watched(&partition).await?;
        debug!(key = %key, "list served by backend");
        self.backend_call(self.backend.list(key)).await
    }

    /// Get one object by `key.name`. A watched partition without a match
    /// yields [`Error::NotFound`].
    pub async fn get(&self, key: &Key) -> Result<DynamicObject> {
        let name = key
            .name
            .as_deref()
            .ok_or_else(|| Error::InvalidKey(format!("{}: get requires a name", key)))?;
        let partition = key.partition();
        if self.store.is_watched(&partition) {
            counter!("kache_cache_hits_total", 1);
            return self
                .store
                .query(&partition, &key.namespace, Some(name))
                .into_iter()
                .next()
                .ok_or_else(|| Error::NotFound(key.to_string()));
        }
        self.ensure_watched(&partition).await?;
        debug!(key = %key, "get served by backend");
        self.backend_call(self.backend.get(key)).await
    }

    pub fn is_watched(&self, key: &Key) -> bool {
        self.store.is_watched(&key.partition())
    }

    /// Partitions with a live watch, sorted by GVK key.
    pub fn watched(&self) -> Vec<Partition> {
        self.store.watched()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Establish at most once per partition. Callers that arrive while another
    /// establishment is running wait for it and then find the mark set.
    async fn ensure_watched(&self, partition: &Partition) -> Result<()> {
        let _guard = tokio::select! {
            g = self.establish.lock() => g,
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
        };
        if self.store.is_watched(partition) {
            return Ok(());
        }
        self.manager.establish(partition).await
    }

    async fn backend_call<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        counter!("kache_backend_calls_total", 1);
        tokio::select! {
            res = fut => res,
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
        }
    }
}

/// Assembles a [`Watch`] from its collaborators. `resolver`, `factory`,
/// `backend` and `cancel` are required.
#[derive(Default)]
pub struct WatchBuilder {
    resolver: Option<Arc<dyn ResourceResolver>>,
    factory: Option<Arc<dyn WatchFactory>>,
    backend: Option<Arc<dyn BackendStore>>,
    cancel: Option<CancellationToken>,
    store: Option<Arc<CacheStore>>,
}

impl WatchBuilder {
    pub fn resolver(mut self, resolver: Arc<dyn ResourceResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn factory(mut self, factory: Arc<dyn WatchFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn backend(mut self, backend: Arc<dyn BackendStore>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Start from an existing cache instead of an empty one.
    pub fn store(mut self, store: Arc<CacheStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> anyhow::Result<Watch> {
        let resolver = self.resolver.ok_or_else(|| anyhow::anyhow!("watch builder: resolver is required"))?;
        let factory = self.factory.ok_or_else(|| anyhow::anyhow!("watch builder: factory is required"))?;
        let backend = self.backend.ok_or_else(|| anyhow::anyhow!("watch builder: backend is required"))?;
        let cancel = self.cancel.ok_or_else(|| anyhow::anyhow!("watch builder: cancel token is required"))?;
        let store = self.store.unwrap_or_default();

        // Without a runtime there is nothing to spawn on; reads still honor the token.
        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            let store = Arc::clone(&store);
            let cancel = cancel.clone();
            rt.spawn(async move {
                cancel.cancelled().await;
                store.clear();
                info!("watch cancelled; cache cleared");
            });
        }

        let manager = InformerManager::new(resolver, factory, Arc::clone(&store), cancel.clone());
        Ok(Watch { store, manager, backend, cancel, establish: Mutex::new(()) })
    }
}
