use crate::Partition;

/// Per-call failures of the cache. None of them is fatal; each leaves the
/// cache consistent, with the partition possibly still unwatched.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid key: {0}")]
    InvalidKey(String),
    /// The partition does not map to any served resource.
    #[error("resolve {partition}: {reason}")]
    Resolution { partition: Partition, reason: String },
    /// Attaching to or starting the watch failed; safe to retry.
    #[error("establish watch: {0}")]
    Establishment(String),
    /// Authoritative read failed; the backend error is passed through untouched.
    #[error(transparent)]
    Backend(anyhow::Error),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("watch cancelled")]
    Cancelled,
    #[error("object missing metadata.uid")]
    MissingUid,
    #[error("invalid metadata.uid {0:?}")]
    InvalidUid(String),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
