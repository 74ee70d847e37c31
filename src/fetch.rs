//! Fetching raw image bytes from remote sources.

use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use reqwest::{Client, header};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::config::FetchOptions;
use crate::error::LoadError;

/// Body of a fetch, chunk by chunk.
pub type ByteStream = BoxStream<'static, Result<Bytes, LoadError>>;

#[async_trait]
pub trait ContentFetcher: Send + Sync + 'static {
    /// Open the body of `url` as a stream.
    async fn fetch_stream(&self, url: &str) -> Result<ByteStream, LoadError>;

    /// Fetch the whole body into memory.
    async fn fetch(&self, url: &str) -> Result<Bytes, LoadError> {
        let chunks: Vec<Bytes> = self.fetch_stream(url).await?.try_collect().await?;
        if chunks.len() == 1 {
            return Ok(chunks.into_iter().next().unwrap_or_default());
        }
        Ok(Bytes::from(chunks.concat()))
    }

    /// Stream the body of `url` straight into `destination`, returning the byte count.
    ///
    /// This writes in place; callers needing all-or-nothing semantics go through
    /// [`DiskCache::commit`](crate::cache::disk::DiskCache::commit) instead.
    async fn fetch_to_file(&self, url: &str, destination: &Path) -> Result<u64, LoadError> {
        let mut stream = self.fetch_stream(url).await?;
        let mut file = tokio::fs::File::create(destination).await?;
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(written)
    }
}

/// Fetcher for `http://` and `https://` sources.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(options: &FetchOptions) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(options.connect_timeout)
            .timeout(options.timeout)
            .user_agent(options.user_agent.clone())
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ContentFetcher for HttpFetcher {
    async fn fetch_stream(&self, url: &str) -> Result<ByteStream, LoadError> {
        debug!("fetching `{url}`");
        let fetch_err = |source| LoadError::Fetch {
            url: url.to_owned(),
            source,
        };
        let response = self
            .client
            .get(url)
            .header(header::ACCEPT, "image/*")
            .send()
            .await
            .map_err(fetch_err)?;

        let status = response.status();
        if !status.is_success() {
            return Err(LoadError::HttpStatus {
                url: url.to_owned(),
                status: status.as_u16(),
            });
        }

        let owned_url = url.to_owned();
        let body = response.bytes_stream().map_err(move |source| LoadError::Fetch {
            url: owned_url.clone(),
            source,
        });
        Ok(body.boxed())
    }
}
