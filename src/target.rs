//! Display targets and their "currently expected image" marker.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::events::{DecodedImage, RequestKey};
use crate::processing::layout::ViewBounds;

/// Something that shows images: a widget, a texture slot, a terminal preview.
///
/// `show` is only ever called from the thread driving the
/// [`DeliveryPump`](crate::tasks::dispatcher::DeliveryPump).
pub trait ImageView: Send + Sync + 'static {
    /// Current size knowledge, consulted when a request misses the memory cache.
    fn bounds(&self) -> ViewBounds;

    /// Display `image`; `None` means no image could be produced and the view should clear
    /// or fall back to a placeholder.
    fn show(&self, image: Option<&DecodedImage>);
}

static NEXT_TARGET_ID: AtomicU64 = AtomicU64::new(1);

struct TargetInner {
    id: u64,
    expected: Mutex<Option<RequestKey>>,
    view: Box<dyn ImageView>,
}

/// Shared handle to a display target.
///
/// Clones refer to the same target. A target that is reused for another image (a recycled
/// list cell, say) simply gets a new request; results for the old key are then dropped.
#[derive(Clone)]
pub struct TargetHandle {
    inner: Arc<TargetInner>,
}

impl TargetHandle {
    pub fn new(view: impl ImageView) -> Self {
        Self {
            inner: Arc::new(TargetInner {
                id: NEXT_TARGET_ID.fetch_add(1, Ordering::Relaxed),
                expected: Mutex::new(None),
                view: Box::new(view),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Key of the image this target was last asked to show.
    pub fn expected(&self) -> Option<RequestKey> {
        self.lock_expected().clone()
    }

    pub fn is_expecting(&self, key: &RequestKey) -> bool {
        self.lock_expected().as_ref() == Some(key)
    }

    pub(crate) fn expect(&self, key: RequestKey) {
        *self.lock_expected() = Some(key);
    }

    pub fn bounds(&self) -> ViewBounds {
        self.inner.view.bounds()
    }

    pub(crate) fn show(&self, image: Option<&DecodedImage>) {
        self.inner.view.show(image);
    }

    fn lock_expected(&self) -> std::sync::MutexGuard<'_, Option<RequestKey>> {
        self.inner.expected.lock().expect("target marker poisoned")
    }
}

impl PartialEq for TargetHandle {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for TargetHandle {}

impl fmt::Debug for TargetHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetHandle")
            .field("id", &self.inner.id)
            .field("expected", &self.expected())
            .finish()
    }
}
