//! Provider-independent snapshot storage.
//!
//! Every provider implements [`SnapStore`] with identical semantics, so restore code never needs
//! to know where artifacts live. Ordering, "latest" and chain logic live in [`crate::snapshot`],
//! above the trait, and are not duplicated per provider.

pub mod factory;
pub mod local;
pub mod object;

pub use factory::new_snap_store;
pub use local::LocalSnapStore;
pub use object::ObjectSnapStore;

use std::{fmt, io, str::FromStr};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use tracing::info;

use crate::{
    BoxFuture,
    context::Cancelled,
    snapshot::{self, Snapshot},
};

/// Readable artifact stream returned by [`SnapStore::fetch`]; the caller owns it.
pub type SnapshotReader = Box<dyn AsyncRead + Send + Unpin>;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Provider {
    Local,
    S3,
    #[serde(rename = "ABS")]
    Abs,
    #[serde(rename = "GCS")]
    Gcs,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "Local",
            Self::S3 => "S3",
            Self::Abs => "ABS",
            Self::Gcs => "GCS",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "s3" => Ok(Self::S3),
            "abs" => Ok(Self::Abs),
            "gcs" => Ok(Self::Gcs),
            other => Err(format!(
                "unknown storage provider: {other:?} (expected Local|S3|ABS|GCS)"
            )),
        }
    }
}

/// Selects the provider and the namespace artifacts live under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    pub provider: String,
    /// Bucket/container name, or the base directory for `Local`.
    pub container: String,
    /// Directory or key prefix under the container.
    pub prefix: String,
}

#[derive(Debug)]
pub enum SnapStoreError {
    Configuration {
        reason: String,
    },
    /// The snapshot's `path` is not a key this crate produces.
    InvalidKey {
        path: String,
    },
    Write {
        provider: Provider,
        path: String,
        source: BoxError,
    },
    Read {
        provider: Provider,
        path: String,
        source: BoxError,
    },
    NotFound {
        provider: Provider,
        path: String,
    },
    Cancelled(Cancelled),
}

impl SnapStoreError {
    pub(crate) fn write(provider: Provider, path: &str, source: impl Into<BoxError>) -> Self {
        Self::Write {
            provider,
            path: path.to_string(),
            source: source.into(),
        }
    }

    pub(crate) fn read(provider: Provider, path: &str, source: impl Into<BoxError>) -> Self {
        Self::Read {
            provider,
            path: path.to_string(),
            source: source.into(),
        }
    }

    pub(crate) fn not_found(provider: Provider, path: &str) -> Self {
        Self::NotFound {
            provider,
            path: path.to_string(),
        }
    }

    /// `true` for transient I/O failures; `NotFound` is definitive.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Write { .. } | Self::Read { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl fmt::Display for SnapStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration { reason } => write!(f, "snapstore configuration error: {reason}"),
            Self::InvalidKey { path } => write!(f, "invalid snapshot key: {path:?}"),
            Self::Write {
                provider,
                path,
                source,
            } => write!(f, "{provider} snapstore write {path}: {source}"),
            Self::Read {
                provider,
                path,
                source,
            } => write!(f, "{provider} snapstore read {path}: {source}"),
            Self::NotFound { provider, path } => {
                write!(f, "{provider} snapstore: snapshot not found: {path}")
            }
            Self::Cancelled(e) => write!(f, "snapstore {e}"),
        }
    }
}

impl std::error::Error for SnapStoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Write { source, .. } | Self::Read { source, .. } => Some(source.as_ref()),
            Self::Cancelled(e) => Some(e),
            Self::Configuration { .. } | Self::InvalidKey { .. } | Self::NotFound { .. } => None,
        }
    }
}

impl From<Cancelled> for SnapStoreError {
    fn from(value: Cancelled) -> Self {
        Self::Cancelled(value)
    }
}

/// Storage contract implemented once per provider.
///
/// `save` never leaves a partial artifact visible to `list`/`fetch`. `delete` of a missing
/// artifact succeeds; other delete failures are reported. A `delete` racing a `fetch` of the
/// same artifact is not coordinated: sequencing garbage collection after restores is the
/// caller's job.
pub trait SnapStore: Send + Sync + 'static {
    fn provider(&self) -> Provider;

    fn save<'a>(
        &'a self,
        snap: &'a Snapshot,
        data: &'a mut (dyn AsyncRead + Send + Unpin),
    ) -> BoxFuture<'a, Result<(), SnapStoreError>>;

    fn fetch<'a>(&'a self, snap: &'a Snapshot)
    -> BoxFuture<'a, Result<SnapshotReader, SnapStoreError>>;

    /// All parseable artifacts under the prefix, ordered by `last_revision` ascending.
    fn list(&self) -> BoxFuture<'_, Result<Vec<Snapshot>, SnapStoreError>>;

    fn delete<'a>(&'a self, snap: &'a Snapshot) -> BoxFuture<'a, Result<(), SnapStoreError>>;

    fn size<'a>(&'a self, snap: &'a Snapshot) -> BoxFuture<'a, Result<u64, SnapStoreError>>;

    /// The latest snapshot, or `None` for an empty store.
    fn get_latest(&self) -> BoxFuture<'_, Result<Option<Snapshot>, SnapStoreError>> {
        Box::pin(async move {
            let snaps = self.list().await?;
            Ok(snapshot::latest(&snaps).cloned())
        })
    }
}

/// Reject descriptors whose `path` could escape the prefix or disagrees with the other fields.
pub(crate) fn checked_key(snap: &Snapshot) -> Result<&str, SnapStoreError> {
    match Snapshot::parse_key(&snap.path) {
        Some(parsed) if parsed == *snap => Ok(&snap.path),
        _ => Err(SnapStoreError::InvalidKey {
            path: snap.path.clone(),
        }),
    }
}

pub(crate) fn is_io_not_found(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::NotFound
}

/// Delete everything older than the `max_full` newest full snapshots.
///
/// Returns the deleted snapshots. Stops at the first failed delete.
pub async fn collect_garbage(
    store: &dyn SnapStore,
    max_full: usize,
) -> Result<Vec<Snapshot>, SnapStoreError> {
    let snaps = store.list().await?;
    let garbage = snapshot::garbage(&snaps, max_full);
    for snap in &garbage {
        store.delete(snap).await?;
        info!(provider = %store.provider(), path = %snap.path, "gc: deleted snapshot");
    }
    Ok(garbage)
}
