use std::sync::Arc;

use object_store::{
    ObjectStore,
    buffered::{BufReader, BufWriter},
    path::Path as ObjectPath,
};
use tokio::io::{AsyncRead, AsyncWriteExt as _};
use tracing::{debug, warn};

use crate::{
    BoxFuture,
    snapshot::{self, Snapshot},
    snapstore::{Provider, SnapStore, SnapStoreError, SnapshotReader, checked_key},
};

/// Snapshot store over any `object_store` backend (S3, Azure Blob, GCS).
///
/// Uploads go through a buffered multipart writer that only becomes visible on completion; a
/// failed upload is aborted.
#[derive(Debug, Clone)]
pub struct ObjectSnapStore {
    provider: Provider,
    store: Arc<dyn ObjectStore>,
    prefix: Option<ObjectPath>,
}

impl ObjectSnapStore {
    pub fn new(
        provider: Provider,
        store: Arc<dyn ObjectStore>,
        prefix: &str,
    ) -> Result<Self, SnapStoreError> {
        let prefix = prefix.trim_matches('/');
        let prefix = if prefix.is_empty() {
            None
        } else {
            Some(
                ObjectPath::parse(prefix).map_err(|e| SnapStoreError::Configuration {
                    reason: format!("invalid store prefix {prefix:?}: {e}"),
                })?,
            )
        };
        Ok(Self {
            provider,
            store,
            prefix,
        })
    }

    fn location(&self, key: &str) -> ObjectPath {
        match &self.prefix {
            Some(prefix) => prefix.child(key),
            None => ObjectPath::from(key),
        }
    }

    async fn abort_upload(&self, writer: &mut BufWriter, key: &str) {
        if let Err(e) = writer.abort().await {
            warn!(
                provider = %self.provider,
                path = %key,
                error = %e,
                "failed to abort snapshot upload; multipart parts may be left behind"
            );
        }
    }

    fn read_err(&self, key: &str, err: object_store::Error) -> SnapStoreError {
        match err {
            object_store::Error::NotFound { .. } => SnapStoreError::not_found(self.provider, key),
            other => SnapStoreError::read(self.provider, key, other),
        }
    }
}

impl SnapStore for ObjectSnapStore {
    fn provider(&self) -> Provider {
        self.provider
    }

    fn save<'a>(
        &'a self,
        snap: &'a Snapshot,
        data: &'a mut (dyn AsyncRead + Send + Unpin),
    ) -> BoxFuture<'a, Result<(), SnapStoreError>> {
        Box::pin(async move {
            let key = checked_key(snap)?;
            let mut writer = BufWriter::new(self.store.clone(), self.location(key));

            let written = match tokio::io::copy(data, &mut writer).await {
                Ok(n) => n,
                Err(e) => {
                    self.abort_upload(&mut writer, key).await;
                    return Err(SnapStoreError::write(self.provider, key, e));
                }
            };
            if let Err(e) = writer.shutdown().await {
                self.abort_upload(&mut writer, key).await;
                return Err(SnapStoreError::write(self.provider, key, e));
            }

            debug!(provider = %self.provider, path = %key, bytes = written, "saved snapshot");
            Ok(())
        })
    }

    fn fetch<'a>(
        &'a self,
        snap: &'a Snapshot,
    ) -> BoxFuture<'a, Result<SnapshotReader, SnapStoreError>> {
        Box::pin(async move {
            let key = checked_key(snap)?;
            let meta = self
                .store
                .head(&self.location(key))
                .await
                .map_err(|e| self.read_err(key, e))?;
            Ok(Box::new(BufReader::new(self.store.clone(), &meta)) as SnapshotReader)
        })
    }

    fn list(&self) -> BoxFuture<'_, Result<Vec<Snapshot>, SnapStoreError>> {
        Box::pin(async move {
            let listing = self
                .store
                .list_with_delimiter(self.prefix.as_ref())
                .await
                .map_err(|e| {
                    let prefix = self.prefix.as_ref().map(|p| p.as_ref()).unwrap_or("");
                    SnapStoreError::read(self.provider, prefix, e)
                })?;

            let mut snaps: Vec<Snapshot> = listing
                .objects
                .iter()
                .filter_map(|meta| {
                    let name = meta.location.filename()?;
                    let parsed = Snapshot::parse_key(name);
                    if parsed.is_none() {
                        debug!(provider = %self.provider, key = %meta.location, "list: skipping non-snapshot object");
                    }
                    parsed
                })
                .collect();

            snapshot::sort_timeline(&mut snaps);
            Ok(snaps)
        })
    }

    fn delete<'a>(&'a self, snap: &'a Snapshot) -> BoxFuture<'a, Result<(), SnapStoreError>> {
        Box::pin(async move {
            let key = checked_key(snap)?;
            match self.store.delete(&self.location(key)).await {
                Ok(()) => Ok(()),
                Err(object_store::Error::NotFound { .. }) => {
                    debug!(provider = %self.provider, path = %key, "delete: snapshot already absent");
                    Ok(())
                }
                Err(e) => Err(SnapStoreError::write(self.provider, key, e)),
            }
        })
    }

    fn size<'a>(&'a self, snap: &'a Snapshot) -> BoxFuture<'a, Result<u64, SnapStoreError>> {
        Box::pin(async move {
            let key = checked_key(snap)?;
            let meta = self
                .store
                .head(&self.location(key))
                .await
                .map_err(|e| self.read_err(key, e))?;
            Ok(meta.size)
        })
    }
}
