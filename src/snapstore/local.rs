use std::path::{Path, PathBuf};

use tokio::io::{AsyncRead, AsyncWriteExt as _};
use tracing::{debug, warn};

use crate::{
    BoxFuture,
    snapshot::{self, Snapshot},
    snapstore::{
        Provider, SnapStore, SnapStoreError, SnapshotReader, checked_key, is_io_not_found,
    },
};

const TMP_SUFFIX: &str = ".tmp";

/// Snapshot store backed by a directory: `<container>/<prefix>/<key>`.
///
/// Writes go to `<key>.tmp` and are renamed into place after `fsync`, so a failed or
/// interrupted save never produces a file that `list` would parse.
#[derive(Debug, Clone)]
pub struct LocalSnapStore {
    root: PathBuf,
}

impl LocalSnapStore {
    pub fn new(container: impl AsRef<Path>, prefix: &str) -> Self {
        let prefix = prefix.trim_matches('/');
        let root = if prefix.is_empty() {
            container.as_ref().to_path_buf()
        } else {
            container.as_ref().join(prefix)
        };
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn save_inner(
        &self,
        key: &str,
        data: &mut (dyn AsyncRead + Send + Unpin),
    ) -> std::io::Result<u64> {
        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.root.join(key);
        let tmp = self.root.join(format!("{key}{TMP_SUFFIX}"));

        let guard = TmpFile::new(tmp);
        let mut file = tokio::fs::File::create(guard.path()).await?;
        let written = tokio::io::copy(data, &mut file).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(guard.path(), &path).await?;
        guard.disarm();
        Ok(written)
    }
}

/// Removes a half-written temp file when a save fails or its future is dropped.
struct TmpFile {
    path: PathBuf,
    armed: bool,
}

impl TmpFile {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for TmpFile {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // Drop cannot await.
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "removed incomplete snapshot temp file"),
            Err(e) if is_io_not_found(&e) => {}
            Err(e) => warn!(
                path = %self.path.display(),
                error = %e,
                "failed to remove incomplete snapshot temp file"
            ),
        }
    }
}

impl SnapStore for LocalSnapStore {
    fn provider(&self) -> Provider {
        Provider::Local
    }

    fn save<'a>(
        &'a self,
        snap: &'a Snapshot,
        data: &'a mut (dyn AsyncRead + Send + Unpin),
    ) -> BoxFuture<'a, Result<(), SnapStoreError>> {
        Box::pin(async move {
            let key = checked_key(snap)?;
            let written = self
                .save_inner(key, data)
                .await
                .map_err(|e| SnapStoreError::write(Provider::Local, key, e))?;
            debug!(root = %self.root.display(), path = %key, bytes = written, "saved snapshot");
            Ok(())
        })
    }

    fn fetch<'a>(
        &'a self,
        snap: &'a Snapshot,
    ) -> BoxFuture<'a, Result<SnapshotReader, SnapStoreError>> {
        Box::pin(async move {
            let key = checked_key(snap)?;
            match tokio::fs::File::open(self.root.join(key)).await {
                Ok(file) => Ok(Box::new(file) as SnapshotReader),
                Err(e) if is_io_not_found(&e) => Err(SnapStoreError::not_found(Provider::Local, key)),
                Err(e) => Err(SnapStoreError::read(Provider::Local, key, e)),
            }
        })
    }

    fn list(&self) -> BoxFuture<'_, Result<Vec<Snapshot>, SnapStoreError>> {
        Box::pin(async move {
            let root = self.root.display().to_string();
            let mut dir = match tokio::fs::read_dir(&self.root).await {
                Ok(dir) => dir,
                Err(e) if is_io_not_found(&e) => return Ok(Vec::new()),
                Err(e) => return Err(SnapStoreError::read(Provider::Local, &root, e)),
            };

            let mut snaps = Vec::new();
            while let Some(entry) = dir
                .next_entry()
                .await
                .map_err(|e| SnapStoreError::read(Provider::Local, &root, e))?
            {
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| SnapStoreError::read(Provider::Local, &root, e))?;
                if !file_type.is_file() {
                    continue;
                }
                let name = entry.file_name();
                let Some(name) = name.to_str() else {
                    continue;
                };
                match Snapshot::parse_key(name) {
                    Some(snap) => snaps.push(snap),
                    None => debug!(root = %root, name = %name, "list: skipping non-snapshot file"),
                }
            }

            snapshot::sort_timeline(&mut snaps);
            Ok(snaps)
        })
    }

    fn delete<'a>(&'a self, snap: &'a Snapshot) -> BoxFuture<'a, Result<(), SnapStoreError>> {
        Box::pin(async move {
            let key = checked_key(snap)?;
            match tokio::fs::remove_file(self.root.join(key)).await {
                Ok(()) => Ok(()),
                Err(e) if is_io_not_found(&e) => {
                    debug!(path = %key, "delete: snapshot already absent");
                    Ok(())
                }
                Err(e) => Err(SnapStoreError::write(Provider::Local, key, e)),
            }
        })
    }

    fn size<'a>(&'a self, snap: &'a Snapshot) -> BoxFuture<'a, Result<u64, SnapStoreError>> {
        Box::pin(async move {
            let key = checked_key(snap)?;
            match tokio::fs::metadata(self.root.join(key)).await {
                Ok(meta) => Ok(meta.len()),
                Err(e) if is_io_not_found(&e) => Err(SnapStoreError::not_found(Provider::Local, key)),
                Err(e) => Err(SnapStoreError::read(Provider::Local, key, e)),
            }
        })
    }
}
