use std::path::PathBuf;

use thiserror::Error;

/// Failure of a single load.
///
/// None of these ever reach the caller as a hard error: the pipeline logs them and the
/// target receives "no image".
#[derive(Debug, Error)]
pub enum LoadError {
    /// The network (or the local file behind a fetch) was unreachable or the transfer broke off.
    #[error("failed to fetch {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The server answered, but not with the image.
    #[error("fetching {url} returned status {status}")]
    HttpStatus { url: String, status: u16 },

    /// Malformed or truncated image bytes.
    #[error("failed to decode image: {0}")]
    Decode(String),

    /// The fetched bytes could not be persisted into the disk cache.
    #[error("failed to commit {path} to the disk cache: {source}")]
    DiskCommit {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The blocking decode task died before producing a result.
    #[error("decode task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// Underlying IO error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<image::ImageError> for LoadError {
    fn from(err: image::ImageError) -> Self {
        match err {
            image::ImageError::IoError(io) => Self::Io(io),
            other => Self::Decode(other.to_string()),
        }
    }
}

impl From<jpeg_decoder::Error> for LoadError {
    fn from(err: jpeg_decoder::Error) -> Self {
        match err {
            jpeg_decoder::Error::Unsupported(feature) => {
                Self::Decode(format!("unsupported JPEG feature: {feature:?}"))
            }
            jpeg_decoder::Error::Io(io) => Self::Io(io),
            other => Self::Decode(other.to_string()),
        }
    }
}
