//! Content-addressed store of downloaded originals.
//!
//! Files are named by the MD5 digest of the request key. A file only ever appears under its
//! final name through an atomic rename of a fully written temp file living in the same
//! directory, so `has` never reports a partial download.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::LoadError;
use crate::events::RequestKey;

const TEMP_PREFIX: &str = ".tmp-";

/// File name of a cached original: 32 lowercase hex characters.
///
/// MD5 is not collision resistant against an adversary. Two distinct keys mapping to the
/// same name would serve one image for the other; this is accepted and not detected.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DiskCacheKey(String);

impl DiskCacheKey {
    pub fn for_request(key: &RequestKey) -> Self {
        Self(format!("{:x}", md5::compute(key.as_bytes())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DiskCacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct DiskCache {
    private_root: PathBuf,
    external_root: Option<PathBuf>,
}

impl DiskCache {
    /// Prepare the cache roots and sweep temp files a crashed process may have left behind.
    pub fn open(private_root: PathBuf, external_root: Option<PathBuf>) -> io::Result<Self> {
        std::fs::create_dir_all(&private_root)?;
        let cache = Self {
            private_root,
            external_root,
        };
        cache.purge_temp_files();
        info!(
            private = %cache.private_root.display(),
            external = ?cache.external_root.as_ref().map(|p| p.display().to_string()),
            "disk cache opened"
        );
        Ok(cache)
    }

    /// Directory new entries go to and lookups read from.
    ///
    /// The external root wins while it is present. This is re-evaluated on every call since
    /// removable storage can come and go between lookups.
    pub fn root(&self) -> &Path {
        match &self.external_root {
            Some(external) if external.is_dir() => external,
            _ => &self.private_root,
        }
    }

    pub fn path(&self, key: &DiskCacheKey) -> PathBuf {
        self.root().join(key.as_str())
    }

    pub fn has(&self, key: &DiskCacheKey) -> bool {
        self.path(key).is_file()
    }

    /// Drain `stream` into the cache under `key`.
    ///
    /// Returns the final location. On any error the partial data is discarded and nothing
    /// is visible under `path(key)`. Concurrent commits of one key are last-writer-wins.
    pub async fn commit<S>(&self, key: &DiskCacheKey, mut stream: S) -> Result<PathBuf, LoadError>
    where
        S: Stream<Item = Result<Bytes, LoadError>> + Unpin,
    {
        let root = self.root().to_path_buf();
        let final_path = root.join(key.as_str());
        let commit_err = |source| LoadError::DiskCommit {
            path: final_path.clone(),
            source,
        };

        tokio::fs::create_dir_all(&root).await.map_err(commit_err)?;
        let temp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(&root)
            .map_err(commit_err)?;
        // Dropping `temp_path` on any early return deletes the partial file.
        let (file, temp_path) = temp.into_parts();
        let mut file = tokio::fs::File::from_std(file);

        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await.map_err(commit_err)?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(commit_err)?;
        file.sync_all().await.map_err(commit_err)?;
        drop(file);

        temp_path
            .persist(&final_path)
            .map_err(|err| commit_err(err.error))?;
        debug!(key = %key, bytes = written, path = %final_path.display(), "disk cache: committed");
        Ok(final_path)
    }

    /// Drop an entry, e.g. one that turned out not to decode.
    pub fn remove(&self, key: &DiskCacheKey) -> io::Result<()> {
        match std::fs::remove_file(self.path(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn purge_temp_files(&self) {
        let roots = std::iter::once(&self.private_root).chain(self.external_root.as_ref());
        for root in roots {
            let Ok(entries) = std::fs::read_dir(root) else {
                continue;
            };
            for entry in entries.flatten() {
                let is_temp = entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| name.starts_with(TEMP_PREFIX));
                if !is_temp {
                    continue;
                }
                match std::fs::remove_file(entry.path()) {
                    Ok(()) => debug!(path = %entry.path().display(), "disk cache: removed orphaned temp file"),
                    Err(err) => warn!(path = %entry.path().display(), "disk cache: cannot remove temp file: {err}"),
                }
            }
        }
    }
}
