//! Fetch → (disk cache) → downsample → memory cache, for one task.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, instrument, warn};

use crate::cache::disk::{DiskCache, DiskCacheKey};
use crate::cache::memory::MemoryCache;
use crate::error::LoadError;
use crate::events::{DecodedImage, LoadTask, RequiredSize, SourceKind};
use crate::fetch::ContentFetcher;
use crate::processing::downsample::Downsampler;

pub struct Pipeline {
    memory: Arc<MemoryCache>,
    disk: Arc<DiskCache>,
    fetcher: Arc<dyn ContentFetcher>,
    decoder: Arc<dyn Downsampler>,
    disk_cache_enabled: bool,
}

impl Pipeline {
    pub fn new(
        memory: Arc<MemoryCache>,
        disk: Arc<DiskCache>,
        fetcher: Arc<dyn ContentFetcher>,
        decoder: Arc<dyn Downsampler>,
        disk_cache_enabled: bool,
    ) -> Self {
        Self {
            memory,
            disk,
            fetcher,
            decoder,
            disk_cache_enabled,
        }
    }

    /// Run the task once. Failures are logged and come back as `None`; nothing is retried.
    #[instrument(skip_all, fields(key = %task.key, source = ?task.source))]
    pub async fn execute(&self, task: &LoadTask) -> Option<DecodedImage> {
        let result = match task.source {
            SourceKind::Local => {
                self.decode_file(PathBuf::from(task.key.as_str()), task.size)
                    .await
            }
            SourceKind::Remote => self.load_remote(task).await,
        };

        match result {
            Ok(image) => {
                let admission = self.memory.put(task.key.clone(), image.clone());
                debug!(
                    size = ?image.dimensions(),
                    bytes = image.byte_size(),
                    ?admission,
                    "loaded"
                );
                Some(image)
            }
            Err(err) => {
                warn!("load failed: {err}");
                None
            }
        }
    }

    async fn load_remote(&self, task: &LoadTask) -> Result<DecodedImage, LoadError> {
        let url = task.key.as_str();
        let disk_key = DiskCacheKey::for_request(&task.key);

        if self.disk.has(&disk_key) {
            debug!(disk_key = %disk_key, "disk cache hit");
            let path = self.disk.path(&disk_key);
            return self.decode_cached(&disk_key, path, task.size).await;
        }

        if self.disk_cache_enabled {
            let stream = self.fetcher.fetch_stream(url).await?;
            let path = self.disk.commit(&disk_key, stream).await?;
            self.decode_cached(&disk_key, path, task.size).await
        } else {
            let bytes = self.fetcher.fetch(url).await?;
            self.decode_bytes(bytes, task.size).await
        }
    }

    /// Decode a disk-cache entry; an entry that does not decode is dropped so the next
    /// request fetches a fresh copy.
    async fn decode_cached(
        &self,
        disk_key: &DiskCacheKey,
        path: PathBuf,
        size: RequiredSize,
    ) -> Result<DecodedImage, LoadError> {
        let result = self.decode_file(path, size).await;
        if let Err(LoadError::Decode(_)) = &result {
            if let Err(err) = self.disk.remove(disk_key) {
                warn!(disk_key = %disk_key, "cannot remove undecodable cache entry: {err}");
            }
        }
        result
    }

    async fn decode_file(
        &self,
        path: PathBuf,
        size: RequiredSize,
    ) -> Result<DecodedImage, LoadError> {
        let decoder = Arc::clone(&self.decoder);
        tokio::task::spawn_blocking(move || decoder.decode_file(&path, size)).await?
    }

    async fn decode_bytes(&self, bytes: Bytes, size: RequiredSize) -> Result<DecodedImage, LoadError> {
        let decoder = Arc::clone(&self.decoder);
        tokio::task::spawn_blocking(move || decoder.decode_bytes(&bytes, size)).await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RequestKey;
    use crate::fetch::ByteStream;
    use crate::processing::downsample::ScaledDecoder;
    use async_trait::async_trait;
    use futures::StreamExt;
    use image::{ImageFormat, RgbaImage};
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StaticFetcher {
        body: Bytes,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ContentFetcher for StaticFetcher {
        async fn fetch_stream(&self, _url: &str) -> Result<ByteStream, LoadError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let body = self.body.clone();
            Ok(futures::stream::iter(vec![Ok(body)]).boxed())
        }
    }

    fn png(width: u32, height: u32) -> Bytes {
        let mut out = Cursor::new(Vec::new());
        RgbaImage::new(width, height)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        Bytes::from(out.into_inner())
    }

    struct Fixture {
        pipeline: Pipeline,
        memory: Arc<MemoryCache>,
        disk: Arc<DiskCache>,
        fetcher: Arc<StaticFetcher>,
        _dir: tempfile::TempDir,
    }

    fn fixture(body: Bytes, disk_cache_enabled: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let memory = Arc::new(MemoryCache::new(1 << 20));
        let disk = Arc::new(DiskCache::open(dir.path().join("cache"), None).unwrap());
        let fetcher = Arc::new(StaticFetcher {
            body,
            calls: AtomicUsize::new(0),
        });
        let pipeline = Pipeline::new(
            Arc::clone(&memory),
            Arc::clone(&disk),
            fetcher.clone(),
            Arc::new(ScaledDecoder),
            disk_cache_enabled,
        );
        Fixture {
            pipeline,
            memory,
            disk,
            fetcher,
            _dir: dir,
        }
    }

    fn remote(url: &str) -> LoadTask {
        LoadTask {
            key: RequestKey::from(url),
            source: SourceKind::Remote,
            size: RequiredSize::new(8, 8),
        }
    }

    #[tokio::test]
    async fn remote_load_goes_through_the_disk_cache() {
        let fx = fixture(png(32, 32), true);
        let task = remote("https://example.com/a.png");

        let image = fx.pipeline.execute(&task).await.unwrap();
        assert_eq!(image.dimensions(), (8, 8));
        assert!(fx.memory.contains(&task.key));
        assert!(fx.disk.has(&DiskCacheKey::for_request(&task.key)));

        // Second pass decodes from disk without fetching.
        fx.memory.clear();
        assert!(fx.pipeline.execute(&task).await.is_some());
        assert_eq!(fx.fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disabled_disk_cache_decodes_in_memory() {
        let fx = fixture(png(32, 32), false);
        let task = remote("https://example.com/a.png");

        assert!(fx.pipeline.execute(&task).await.is_some());
        fx.memory.clear();
        assert!(fx.pipeline.execute(&task).await.is_some());
        assert_eq!(fx.fetcher.calls.load(Ordering::SeqCst), 2);
        assert!(!fx.disk.has(&DiskCacheKey::for_request(&task.key)));
    }

    #[tokio::test]
    async fn undecodable_download_is_not_kept() {
        let fx = fixture(Bytes::from_static(b"<html>not found</html>"), true);
        let task = remote("https://example.com/missing.png");

        assert!(fx.pipeline.execute(&task).await.is_none());
        assert!(!fx.disk.has(&DiskCacheKey::for_request(&task.key)));
        assert!(fx.memory.is_empty());
    }

    #[tokio::test]
    async fn local_files_skip_fetch_and_disk() {
        let fx = fixture(Bytes::new(), true);
        let path = fx._dir.path().join("local.png");
        std::fs::write(&path, png(16, 16)).unwrap();
        let task = LoadTask {
            key: RequestKey::from(path.to_string_lossy().as_ref()),
            source: SourceKind::Local,
            size: RequiredSize::new(4, 4),
        };

        let image = fx.pipeline.execute(&task).await.unwrap();
        assert_eq!(image.dimensions(), (4, 4));
        assert_eq!(fx.fetcher.calls.load(Ordering::SeqCst), 0);
        assert!(fx.memory.contains(&task.key));
    }

    #[tokio::test]
    async fn missing_local_file_yields_no_image() {
        let fx = fixture(Bytes::new(), true);
        let task = LoadTask {
            key: RequestKey::from("/definitely/not/here.png"),
            source: SourceKind::Local,
            size: RequiredSize::new(4, 4),
        };
        assert!(fx.pipeline.execute(&task).await.is_none());
    }
}
