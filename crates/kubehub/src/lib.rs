//! Kache kubehub: the kube-rs backed collaborators of the watch
//! orchestrator (discovery, shared informers, one-shot API reads).

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use kache_core::{prepare, with_types, BackendStore, Error, Key, Partition, ResourceResolver, Result};
use kube::{
    api::{Api, ListParams},
    core::{ApiResource, DynamicObject},
    discovery::Discovery,
    Client,
};
use tokio::sync::RwLock;
use tracing::{debug, info};

mod informer;

pub use informer::{KubeInformer, KubeWatchFactory};

/// Runtime knobs, read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KubehubConfig {
    /// Server-side timeout of each watch request, in seconds.
    pub watch_timeout_secs: u32,
    /// How long a discovery result stays valid; `None` keeps it until a miss.
    pub discovery_ttl: Option<Duration>,
}

impl Default for KubehubConfig {
    fn default() -> Self {
        Self { watch_timeout_secs: 290, discovery_ttl: None }
    }
}

impl KubehubConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let watch_timeout_secs = get("KACHE_WATCH_TIMEOUT_SECS")
            .and_then(|s| s.parse::<u32>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(d.watch_timeout_secs);
        let discovery_ttl = get("KACHE_DISCOVERY_TTL_SECS")
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|v| *v > 0)
            .map(Duration::from_secs);
        Self { watch_timeout_secs, discovery_ttl }
    }
}

/// All production collaborators sharing one client.
pub struct Kubehub {
    pub resolver: Arc<DiscoveryResolver>,
    pub factory: Arc<KubeWatchFactory>,
    pub backend: Arc<ApiServerBackend>,
}

impl Kubehub {
    pub async fn connect(cfg: KubehubConfig) -> anyhow::Result<Self> {
        let client = Client::try_default().await.context("building kube client")?;
        Ok(Self::with_client(client, cfg))
    }

    pub fn with_client(client: Client, cfg: KubehubConfig) -> Self {
        let resolver = Arc::new(DiscoveryResolver::new(client.clone(), cfg.discovery_ttl));
        let factory = Arc::new(KubeWatchFactory::new(client.clone(), cfg));
        let backend = Arc::new(ApiServerBackend::new(client, resolver.clone()));
        Self { resolver, factory, backend }
    }
}

/// Resolves partitions through API discovery (incl. CRDs). The discovery
/// result is cached; a miss on a cached result triggers one refresh so kinds
/// installed after startup are found.
pub struct DiscoveryResolver {
    client: Client,
    ttl: Option<Duration>,
    cached: RwLock<Option<(Instant, Arc<Discovery>)>>,
}

impl DiscoveryResolver {
    pub fn new(client: Client, ttl: Option<Duration>) -> Self {
        Self { client, ttl, cached: RwLock::new(None) }
    }

    async fn discovery(&self, force: bool) -> anyhow::Result<Arc<Discovery>> {
        if !force {
            if let Some((at, d)) = self.cached.read().await.as_ref() {
                if self.ttl.map_or(true, |ttl| at.elapsed() < ttl) {
                    return Ok(Arc::clone(d));
                }
            }
        }
        let mut slot = self.cached.write().await;
        let t0 = Instant::now();
        let d = Arc::new(Discovery::new(self.client.clone()).run().await.context("running api discovery")?);
        info!(groups = d.groups().count(), took_ms = %t0.elapsed().as_millis(), "discovery refreshed");
        *slot = Some((Instant::now(), Arc::clone(&d)));
        Ok(d)
    }
}

fn serves(ar: &ApiResource, partition: &Partition) -> bool {
    ar.group == partition.group && ar.version == partition.version && ar.kind == partition.kind
}

/// First candidate serving `partition`. Callers put preferred versions first.
fn pick_resource(candidates: impl IntoIterator<Item = ApiResource>, partition: &Partition) -> Option<ApiResource> {
    candidates.into_iter().find(|ar| serves(ar, partition))
}

fn find_api_resource(discovery: &Discovery, partition: &Partition) -> Option<ApiResource> {
    let preferred = discovery.groups().flat_map(|g| g.recommended_resources());
    // recommended_resources only covers the preferred version
    let all = discovery.groups().flat_map(|g| g.versions().flat_map(move |v| g.versioned_resources(v)));
    pick_resource(preferred.chain(all).map(|(ar, _caps)| ar), partition)
}

#[async_trait::async_trait]
impl ResourceResolver for DiscoveryResolver {
    async fn resolve(&self, partition: &Partition) -> Result<ApiResource> {
        let resolution = |e: anyhow::Error| Error::Resolution { partition: partition.clone(), reason: format!("{e:#}") };
        let d = self.discovery(false).await.map_err(resolution)?;
        if let Some(ar) = find_api_resource(&d, partition) {
            return Ok(ar);
        }
        debug!(partition = %partition, "kind not in cached discovery; refreshing");
        let d = self.discovery(true).await.map_err(resolution)?;
        find_api_resource(&d, partition)
            .ok_or_else(|| Error::Resolution { partition: partition.clone(), reason: "kind not served by cluster".into() })
    }
}

/// One-shot reads straight from the API server.
pub struct ApiServerBackend {
    client: Client,
    resolver: Arc<dyn ResourceResolver>,
}

impl ApiServerBackend {
    pub fn new(client: Client, resolver: Arc<dyn ResourceResolver>) -> Self {
        Self { client, resolver }
    }

    async fn api(&self, key: &Key) -> Result<(Api<DynamicObject>, ApiResource)> {
        let ar = self.resolver.resolve(&key.partition()).await?;
        let api = if key.namespace.is_empty() {
            Api::all_with(self.client.clone(), &ar)
        } else {
            Api::namespaced_with(self.client.clone(), &key.namespace, &ar)
        };
        Ok((api, ar))
    }
}

fn normalize(items: Vec<DynamicObject>, ar: &ApiResource) -> Vec<DynamicObject> {
    items.into_iter().map(|o| prepare(with_types(o, ar))).collect()
}

#[async_trait::async_trait]
impl BackendStore for ApiServerBackend {
    async fn list(&self, key: &Key) -> Result<Vec<DynamicObject>> {
        let (api, ar) = self.api(key).await?;
        let list = api.list(&ListParams::default()).await.map_err(|e| Error::Backend(e.into()))?;
        debug!(key = %key, count = list.items.len(), "backend list");
        Ok(normalize(list.items, &ar))
    }

    async fn get(&self, key: &Key) -> Result<DynamicObject> {
        let name = key.name.as_deref().ok_or_else(|| Error::InvalidKey(format!("{}: get requires a name", key)))?;
        let (api, ar) = self.api(key).await?;
        match api.get(name).await {
            Ok(obj) => Ok(prepare(with_types(obj, &ar))),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Err(Error::NotFound(key.to_string())),
            Err(e) => Err(Error::Backend(e.into())),
        }
    }
}
