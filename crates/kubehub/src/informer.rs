use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use kache_core::{uid_of, with_types, Error, EventHandler, HandlerId, Result, Uid, WatchEvent, WatchFactory, WatchHandle};
use kube::{
    api::Api,
    core::{ApiResource, DynamicObject},
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client,
};
use metrics::counter;
use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::KubehubConfig;

/// A single list+watch stream shared by every handler attached to it.
pub struct KubeInformer {
    resource: ApiResource,
    handlers: RwLock<Vec<(HandlerId, Arc<dyn EventHandler>)>>,
    next_id: AtomicU64,
    running: AtomicBool,
}

impl KubeInformer {
    pub fn new(resource: ApiResource) -> Self {
        Self { resource, handlers: RwLock::new(Vec::new()), next_id: AtomicU64::new(0), running: AtomicBool::new(false) }
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }

    /// Fan an event out to every attached handler.
    pub fn dispatch(&self, event: WatchEvent) {
        let handlers: Vec<_> = self.handlers.read().iter().map(|(_, h)| Arc::clone(h)).collect();
        for h in handlers {
            h.handle(event.clone());
        }
    }
}

impl WatchHandle for KubeInformer {
    fn attach_handler(&self, handler: Arc<dyn EventHandler>) -> Result<HandlerId> {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.handlers.write().push((id, handler));
        debug!(resource = %self.resource.plural, id = id.0, "handler attached");
        Ok(id)
    }

    fn detach_handler(&self, id: HandlerId) {
        self.handlers.write().retain(|(h, _)| *h != id);
    }
}

/// Turns raw watcher events into cache events. Applied is reported as Added
/// for a UID not seen on this stream yet and as Updated otherwise. Objects
/// missing `apiVersion`/`kind` (relist items) get them from the resource.
struct Translator {
    resource: ApiResource,
    seen: FxHashSet<Uid>,
}

impl Translator {
    fn new(resource: ApiResource) -> Self {
        Self { resource, seen: FxHashSet::default() }
    }

    fn translate(&mut self, ev: Event<DynamicObject>) -> WatchEvent {
        let ev = match ev {
            Event::Applied(o) => Event::Applied(with_types(o, &self.resource)),
            Event::Deleted(o) => Event::Deleted(with_types(o, &self.resource)),
            Event::Restarted(list) => {
                Event::Restarted(list.into_iter().map(|o| with_types(o, &self.resource)).collect())
            }
        };
        match ev {
            Event::Applied(o) => match uid_of(&o) {
                Ok(uid) if !self.seen.insert(uid) => WatchEvent::Updated(o),
                _ => WatchEvent::Added(o),
            },
            Event::Deleted(o) => {
                if let Ok(uid) = uid_of(&o) {
                    self.seen.remove(&uid);
                }
                WatchEvent::Deleted(o)
            }
            Event::Restarted(list) => {
                self.seen = list.iter().filter_map(|o| uid_of(o).ok()).collect();
                WatchEvent::Resynced(list)
            }
        }
    }
}

/// Shared informer factory: one [`KubeInformer`] per resource, each started
/// at most once.
pub struct KubeWatchFactory {
    client: Client,
    cfg: KubehubConfig,
    informers: Mutex<FxHashMap<String, Arc<KubeInformer>>>,
}

impl KubeWatchFactory {
    pub fn new(client: Client, cfg: KubehubConfig) -> Self {
        Self { client, cfg, informers: Mutex::new(FxHashMap::default()) }
    }
}

fn informer_key(ar: &ApiResource) -> String {
    format!("{}/{}", ar.api_version, ar.plural)
}

impl WatchFactory for KubeWatchFactory {
    fn for_resource(&self, resource: &ApiResource) -> Arc<dyn WatchHandle> {
        let mut informers = self.informers.lock();
        let inf = informers
            .entry(informer_key(resource))
            .or_insert_with(|| Arc::new(KubeInformer::new(resource.clone())));
        Arc::clone(inf) as Arc<dyn WatchHandle>
    }

    fn start(&self, cancel: &CancellationToken) -> Result<()> {
        let rt = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Establishment(format!("no tokio runtime to run informers: {e}")))?;
        let informers = self.informers.lock();
        for inf in informers.values() {
            if inf.running.swap(true, Ordering::SeqCst) {
                continue;
            }
            rt.spawn(run_informer(self.client.clone(), Arc::clone(inf), self.cfg.clone(), cancel.clone()));
        }
        Ok(())
    }
}

async fn run_informer(client: Client, informer: Arc<KubeInformer>, cfg: KubehubConfig, cancel: CancellationToken) {
    let plural = informer.resource.plural.clone();
    let api: Api<DynamicObject> = Api::all_with(client, &informer.resource);
    let wc = watcher::Config::default().timeout(cfg.watch_timeout_secs);
    let stream = watcher::watcher(api, wc).default_backoff();
    futures::pin_mut!(stream);
    let mut translator = Translator::new(informer.resource.clone());
    info!(resource = %plural, api_version = %informer.resource.api_version, "informer started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(resource = %plural, "informer stopped");
                return;
            }
            next = stream.next() => match next {
                Some(Ok(ev)) => informer.dispatch(translator.translate(ev)),
                Some(Err(e)) => {
                    counter!("kache_watch_errors_total", 1);
                    warn!(resource = %plural, error = %e, "watch error; backing off");
                }
                None => break,
            }
        }
    }
    // let a later start() bring it back
    informer.running.store(false, Ordering::SeqCst);
    warn!(resource = %plural, "watcher stream ended");
}
