//! Values that travel through the loader: request keys, tasks, decoded images and outcomes.

use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

use image::RgbaImage;

/// Identifier of an image: a local path or a remote URL.
///
/// Cheap to clone; used as the memory-cache key and the single-flight key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestKey(Arc<str>);

impl RequestKey {
    pub fn new(key: impl Into<Arc<str>>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for RequestKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RequestKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for RequestKey {
    fn from(key: String) -> Self {
        Self::new(key)
    }
}

impl From<&String> for RequestKey {
    fn from(key: &String) -> Self {
        Self::new(key.as_str())
    }
}

/// Where the bytes of an image come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Local,
    Remote,
}

impl SourceKind {
    /// Guess the source kind from the shape of the key.
    pub fn infer(key: &str) -> Self {
        let lower = key.get(..8).unwrap_or(key).to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            Self::Remote
        } else {
            Self::Local
        }
    }
}

/// Pixel size a target wants an image decoded for. Both dimensions are at least 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequiredSize {
    pub width: u32,
    pub height: u32,
}

impl RequiredSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
        }
    }
}

/// An image decoded to RGBA8 and already downsampled for its target.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pixels: Arc<RgbaImage>,
}

impl DecodedImage {
    pub fn new(pixels: RgbaImage) -> Self {
        Self {
            pixels: Arc::new(pixels),
        }
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.pixels.dimensions()
    }

    /// Decoded pixel bytes; this is what the memory cache accounts, not the encoded size.
    pub fn byte_size(&self) -> u64 {
        self.pixels.as_raw().len() as u64
    }

    pub fn pixels(&self) -> &RgbaImage {
        &self.pixels
    }

    /// Whether both handles share the same pixel buffer.
    pub fn same_as(&self, other: &DecodedImage) -> bool {
        Arc::ptr_eq(&self.pixels, &other.pixels)
    }
}

/// Cache-miss work: owned by the queue until a worker claims it.
#[derive(Debug, Clone)]
pub struct LoadTask {
    pub key: RequestKey,
    pub source: SourceKind,
    pub size: RequiredSize,
}

/// What happened to one request once its result reached the display context.
#[derive(Debug, Clone)]
pub enum LoadOutcome {
    /// The image was handed to the target.
    Shown(DecodedImage),
    /// No image could be produced; the target was told to clear.
    Cleared,
    /// The target asked for something else in the meantime; the result was dropped.
    Stale,
    /// The loader shut down before the request ran.
    Abandoned,
}

impl LoadOutcome {
    pub fn image(&self) -> Option<&DecodedImage> {
        match self {
            Self::Shown(image) => Some(image),
            _ => None,
        }
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, Self::Stale)
    }
}
