use crate::config::DisplaySize;
use crate::events::RequiredSize;

/// What a display target knows about its own size. Zero or `None` means "unknown".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ViewBounds {
    /// Size after layout; zero before the first measure pass.
    pub measured_width: u32,
    pub measured_height: u32,
    /// Size declared in the layout, when it is an exact value.
    pub layout_width: Option<u32>,
    pub layout_height: Option<u32>,
    /// Declared upper bound.
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
}

impl ViewBounds {
    pub fn measured(width: u32, height: u32) -> Self {
        Self {
            measured_width: width,
            measured_height: height,
            ..Self::default()
        }
    }
}

/// Derives the size an image must be decoded for.
#[derive(Debug, Clone, Copy)]
pub struct SizeResolver {
    display: DisplaySize,
}

impl SizeResolver {
    pub fn new(display: DisplaySize) -> Self {
        Self { display }
    }

    /// Per dimension: measured size, else layout size, else maximum size, else the display.
    pub fn resolve(&self, bounds: &ViewBounds) -> RequiredSize {
        let width = first_positive(&[
            Some(bounds.measured_width),
            bounds.layout_width,
            bounds.max_width,
            Some(self.display.width),
        ]);
        let height = first_positive(&[
            Some(bounds.measured_height),
            bounds.layout_height,
            bounds.max_height,
            Some(self.display.height),
        ]);
        RequiredSize::new(width, height)
    }
}

fn first_positive(candidates: &[Option<u32>]) -> u32 {
    candidates
        .iter()
        .flatten()
        .copied()
        .find(|v| *v > 0)
        .unwrap_or(1)
}

/// Integer reduction applied while decoding a `native` sized image for `required`.
///
/// Picks the larger of the rounded per-axis ratios and never goes below 1, so images are
/// never upsampled.
pub fn sample_factor(native: (u32, u32), required: RequiredSize) -> u32 {
    let (native_w, native_h) = native;
    if native_w <= required.width && native_h <= required.height {
        return 1;
    }
    let ratio_w = (native_w as f64 / required.width.max(1) as f64).round();
    let ratio_h = (native_h as f64 / required.height.max(1) as f64).round();
    (ratio_w.max(ratio_h) as u32).max(1)
}

/// Size of a `native` image after reduction by `factor`, rounding up.
pub fn reduced_size(native: (u32, u32), factor: u32) -> (u32, u32) {
    let factor = factor.max(1);
    (
        native.0.div_ceil(factor).max(1),
        native.1.div_ceil(factor).max(1),
    )
}
