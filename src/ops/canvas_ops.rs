// ============================================================================
// CANVAS-LEVEL OPERATIONS — crop to content, padding
// ============================================================================

use image::{Rgba, RgbaImage};

use super::FilterError;

/// Inclusive-exclusive pixel rectangle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContentBounds {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Per-side padding in pixels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Padding {
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
    pub left: u32,
}

impl Padding {
    pub fn uniform(px: u32) -> Self {
        Self { top: px, right: px, bottom: px, left: px }
    }
}

/// Crop to the bounding box of pixels that differ from the top-left pixel
/// by more than `threshold` (Euclidean RGB distance, or alpha difference).
///
/// Returns the input unchanged with `None` when no pixel qualifies.
pub fn crop_to_content(src: &RgbaImage, threshold: f32) -> (RgbaImage, Option<ContentBounds>) {
    match content_bounds(src, threshold) {
        Some(b) => {
            let cropped = image::imageops::crop_imm(src, b.x, b.y, b.width, b.height).to_image();
            (cropped, Some(b))
        }
        None => (src.clone(), None),
    }
}

/// Bounding box used by `crop_to_content`.
pub fn content_bounds(src: &RgbaImage, threshold: f32) -> Option<ContentBounds> {
    let (w, h) = src.dimensions();
    if w == 0 || h == 0 {
        return None;
    }
    let reference = *src.get_pixel(0, 0);

    let mut min_x = w;
    let mut min_y = h;
    let mut max_x = 0u32;
    let mut max_y = 0u32;
    let mut found = false;
    for (x, y, p) in src.enumerate_pixels() {
        if differs(*p, reference, threshold) {
            found = true;
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }
    }
    found.then(|| ContentBounds {
        x: min_x,
        y: min_y,
        width: max_x - min_x + 1,
        height: max_y - min_y + 1,
    })
}

fn differs(p: Rgba<u8>, reference: Rgba<u8>, threshold: f32) -> bool {
    let dr = p[0] as f32 - reference[0] as f32;
    let dg = p[1] as f32 - reference[1] as f32;
    let db = p[2] as f32 - reference[2] as f32;
    let da = (p[3] as f32 - reference[3] as f32).abs();
    (dr * dr + dg * dg + db * db).sqrt() > threshold || da > threshold
}

/// Grow the image by `padding`, filling the new border with `fill`.
pub fn pad(src: &RgbaImage, padding: Padding, fill: Rgba<u8>) -> Result<RgbaImage, FilterError> {
    let (w, h) = src.dimensions();
    let nw = w
        .checked_add(padding.left)
        .and_then(|v| v.checked_add(padding.right));
    let nh = h
        .checked_add(padding.top)
        .and_then(|v| v.checked_add(padding.bottom));
    let (Some(nw), Some(nh)) = (nw, nh) else {
        return Err(FilterError::InvalidDimensions { width: u32::MAX, height: u32::MAX });
    };
    if nw == 0 || nh == 0 || (nw as u64) * (nh as u64) * 4 > isize::MAX as u64 {
        return Err(FilterError::InvalidDimensions { width: nw, height: nh });
    }

    let mut out = RgbaImage::from_pixel(nw, nh, fill);
    image::imageops::replace(&mut out, src, padding.left as i64, padding.top as i64);
    Ok(out)
}
