//! Collaborators the watch orchestrator depends on. Production versions live
//! in `kache-kubehub`; tests substitute their own.

use std::sync::Arc;

use kube::core::{ApiResource, DynamicObject};
use tokio_util::sync::CancellationToken;

use crate::{Key, Partition, Result};

/// Notification delivered by a watch stream.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Added(DynamicObject),
    Updated(DynamicObject),
    Deleted(DynamicObject),
    /// Full relist after the stream restarted; replaces the partition contents.
    Resynced(Vec<DynamicObject>),
}

/// Consumer of watch events. Called from the delivery path, so it must not block.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: WatchEvent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(pub u64);

/// Maps a partition to the concrete resource the watch factory understands.
#[async_trait::async_trait]
pub trait ResourceResolver: Send + Sync {
    async fn resolve(&self, partition: &Partition) -> Result<ApiResource>;
}

/// One watch stream per resource, shared by everything attached to it.
pub trait WatchHandle: Send + Sync {
    fn attach_handler(&self, handler: Arc<dyn EventHandler>) -> Result<HandlerId>;
    /// Unknown ids are ignored.
    fn detach_handler(&self, id: HandlerId);
}

pub trait WatchFactory: Send + Sync {
    /// Return the stream for `resource`, registering it on first use.
    fn for_resource(&self, resource: &ApiResource) -> Arc<dyn WatchHandle>;

    /// Start delivery for every registered stream not yet running. Streams
    /// already running are left alone. All delivery stops once `cancel` fires.
    fn start(&self, cancel: &CancellationToken) -> Result<()>;
}

/// Authoritative source consulted while a partition has no live watch.
#[async_trait::async_trait]
pub trait BackendStore: Send + Sync {
    async fn list(&self, key: &Key) -> Result<Vec<DynamicObject>>;
    async fn get(&self, key: &Key) -> Result<DynamicObject>;
}
