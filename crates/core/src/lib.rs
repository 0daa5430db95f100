//! Kache core types: request keys, cache partitions, object identity and the
//! collaborator traits the watch orchestrator is built from.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

mod collab;
mod error;
mod object;

pub use collab::{BackendStore, EventHandler, HandlerId, ResourceResolver, WatchEvent, WatchFactory, WatchHandle};
pub use error::{Error, Result};
pub use object::{prepare, to_uid, uid_of, with_types, Uid};

pub mod prelude {
    pub use super::{
        BackendStore, Error, EventHandler, HandlerId, Key, Partition, ResourceResolver, Result, Uid, WatchEvent,
        WatchFactory, WatchHandle,
    };
}

/// Identifies a single read request: a collection when `name` is `None`,
/// a single object otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Key {
    pub namespace: String,
    pub api_version: String,
    pub kind: String,
    pub name: Option<String>,
}

impl Key {
    pub fn list(namespace: impl Into<String>, api_version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), api_version: api_version.into(), kind: kind.into(), name: None }
    }

    pub fn get(
        namespace: impl Into<String>,
        api_version: impl Into<String>,
        kind: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self { name: Some(name.into()), ..Self::list(namespace, api_version, kind) }
    }

    /// Cache partition this key reads from. `api_version` is either
    /// `group/version` or a bare core-group `version`.
    pub fn partition(&self) -> Partition {
        let (group, version) = match self.api_version.split_once('/') {
            Some((g, v)) => (g.to_string(), v.to_string()),
            None => (String::new(), self.api_version.clone()),
        };
        Partition { group, version, kind: self.kind.clone() }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ns = if self.namespace.is_empty() { "(all)" } else { self.namespace.as_str() };
        match &self.name {
            Some(name) => write!(f, "{} {}/{}", self.partition(), ns, name),
            None => write!(f, "{} {}", self.partition(), ns),
        }
    }
}

/// Group/Version/Kind identity; the first-level cache index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Partition {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl Partition {
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { group: group.into(), version: version.into(), kind: kind.into() }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

/// Renders the GVK key form: `v1/Pod` or `apps/v1/Deployment`.
impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.kind)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

impl FromStr for Partition {
    type Err = Error;

    fn from_str(key: &str) -> Result<Self> {
        let parts: Vec<_> = key.split('/').collect();
        match parts.as_slice() {
            [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(Partition::new("", *version, *kind)),
            [group, version, kind] if !group.is_empty() && !version.is_empty() && !kind.is_empty() => {
                Ok(Partition::new(*group, *version, *kind))
            }
            _ => Err(Error::InvalidKey(format!("{} (expect v1/Kind or group/v1/Kind)", key))),
        }
    }
}
