#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kache_core::{
    BackendStore, Error, EventHandler, HandlerId, Key, Partition, ResourceResolver, Result, WatchEvent, WatchFactory,
    WatchHandle,
};
use kube::core::{ApiResource, DynamicObject};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

pub fn pod(n: u8, name: &str, ns: &str) -> DynamicObject {
    serde_json::from_value(serde_json::json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": name,
            "namespace": ns,
            "uid": format!("00000000-0000-0000-0000-{:012}", n),
        },
        "spec": { "containers": [{ "name": "app", "image": "nginx" }] },
    }))
    .unwrap()
}

pub fn pods_resource() -> ApiResource {
    ApiResource {
        group: String::new(),
        version: "v1".into(),
        api_version: "v1".into(),
        kind: "Pod".into(),
        plural: "pods".into(),
    }
}

pub fn by_name(mut v: Vec<DynamicObject>) -> Vec<DynamicObject> {
    v.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
    v
}

/// Resolves `v1/Pod` only; everything else is unknown.
#[derive(Default)]
pub struct FakeResolver {
    pub calls: AtomicUsize,
    pub fail: AtomicBool,
    pub delay: Option<Duration>,
}

#[async_trait::async_trait]
impl ResourceResolver for FakeResolver {
    async fn resolve(&self, partition: &Partition) -> Result<ApiResource> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        if self.fail.load(Ordering::SeqCst) || *partition != Partition::new("", "v1", "Pod") {
            return Err(Error::Resolution { partition: partition.clone(), reason: "unknown kind".into() });
        }
        Ok(pods_resource())
    }
}

#[derive(Default)]
pub struct FakeHandle {
    pub attach_calls: AtomicUsize,
    next: AtomicU64,
    handlers: Mutex<Vec<(HandlerId, Arc<dyn EventHandler>)>>,
}

impl FakeHandle {
    pub fn attached(&self) -> usize {
        self.handlers.lock().len()
    }

    /// Deliver an event to every attached handler.
    pub fn emit(&self, event: WatchEvent) {
        let handlers: Vec<_> = self.handlers.lock().iter().map(|(_, h)| Arc::clone(h)).collect();
        for h in handlers {
            h.handle(event.clone());
        }
    }
}

impl WatchHandle for FakeHandle {
    fn attach_handler(&self, handler: Arc<dyn EventHandler>) -> Result<HandlerId> {
        self.attach_calls.fetch_add(1, Ordering::SeqCst);
        let id = HandlerId(self.next.fetch_add(1, Ordering::SeqCst));
        self.handlers.lock().push((id, handler));
        Ok(id)
    }

    fn detach_handler(&self, id: HandlerId) {
        self.handlers.lock().retain(|(h, _)| *h != id);
    }
}

#[derive(Default)]
pub struct FakeFactory {
    pub for_resource_calls: AtomicUsize,
    pub start_calls: AtomicUsize,
    pub fail_start: AtomicBool,
    handles: Mutex<HashMap<String, Arc<FakeHandle>>>,
}

impl FakeFactory {
    pub fn handle(&self, plural: &str) -> Arc<FakeHandle> {
        Arc::clone(self.handles.lock().entry(plural.to_string()).or_default())
    }
}

impl WatchFactory for FakeFactory {
    fn for_resource(&self, resource: &ApiResource) -> Arc<dyn WatchHandle> {
        self.for_resource_calls.fetch_add(1, Ordering::SeqCst);
        self.handle(&resource.plural)
    }

    fn start(&self, _cancel: &CancellationToken) -> Result<()> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(Error::Establishment("informer factory refused to start".into()));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeBackend {
    pub list_calls: AtomicUsize,
    pub get_calls: AtomicUsize,
    pub fail: AtomicBool,
    pub delay: Option<Duration>,
    pub objects: Vec<DynamicObject>,
}

impl FakeBackend {
    pub fn with(objects: Vec<DynamicObject>) -> Self {
        Self { objects, ..Default::default() }
    }

    pub fn calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst) + self.get_calls.load(Ordering::SeqCst)
    }

    async fn pause(&self) -> Result<()> {
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Backend(anyhow::anyhow!("apiserver unavailable")));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl BackendStore for FakeBackend {
    async fn list(&self, key: &Key) -> Result<Vec<DynamicObject>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await?;
        Ok(self
            .objects
            .iter()
            .filter(|o| key.namespace.is_empty() || o.metadata.namespace.as_deref() == Some(key.namespace.as_str()))
            .cloned()
            .collect())
    }

    async fn get(&self, key: &Key) -> Result<DynamicObject> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await?;
        self.objects
            .iter()
            .find(|o| o.metadata.name == key.name && o.metadata.namespace.as_deref() == Some(key.namespace.as_str()))
            .cloned()
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }
}

pub struct Fixture {
    pub resolver: Arc<FakeResolver>,
    pub factory: Arc<FakeFactory>,
    pub backend: Arc<FakeBackend>,
    pub cancel: CancellationToken,
}

impl Fixture {
    pub fn new(backend: FakeBackend) -> Self {
        Self::with_resolver(FakeResolver::default(), backend)
    }

    pub fn with_resolver(resolver: FakeResolver, backend: FakeBackend) -> Self {
        Self {
            resolver: Arc::new(resolver),
            factory: Arc::new(FakeFactory::default()),
            backend: Arc::new(backend),
            cancel: CancellationToken::new(),
        }
    }

    pub fn builder(&self) -> kache_watch::WatchBuilder {
        kache_watch::Watch::builder()
            .resolver(self.resolver.clone())
            .factory(self.factory.clone())
            .backend(self.backend.clone())
            .cancel(self.cancel.clone())
    }

    pub fn resolves(&self) -> usize {
        self.resolver.calls.load(Ordering::SeqCst)
    }

    pub fn starts(&self) -> usize {
        self.factory.start_calls.load(Ordering::SeqCst)
    }

    pub fn attaches(&self) -> usize {
        self.factory.handle("pods").attach_calls.load(Ordering::SeqCst)
    }
}
