pub mod adjustments;
pub mod canvas_ops;
pub mod filters;
pub mod recolor;
pub mod segmentation;
pub mod worker;

use image::RgbaImage;
use rayon::prelude::*;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum FilterError {
    #[error("invalid dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },
    #[error("invalid colour '{0}'")]
    InvalidColor(String),
    #[error("mask is {mask:?} but image is {image:?}")]
    MaskMismatch { mask: (u32, u32), image: (u32, u32) },
    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },
}

// ============================================================================
// HELPER: per-pixel transform
// ============================================================================

/// Map every pixel through `transform`, returning a new image.
/// `transform` receives (r, g, b, a) as f32 in 0..255 and returns the same;
/// results are rounded and clamped.
pub(crate) fn map_pixels<F>(src: &RgbaImage, transform: F) -> RgbaImage
where
    F: Fn(f32, f32, f32, f32) -> (f32, f32, f32, f32) + Sync,
{
    let w = src.width() as usize;
    let h = src.height() as usize;
    if w == 0 || h == 0 {
        return src.clone();
    }

    let src_raw = src.as_raw();
    let mut dst_raw = vec![0u8; w * h * 4];
    let stride = w * 4;

    dst_raw.par_chunks_mut(stride).enumerate().for_each(|(y, row_out)| {
        let row_in = &src_raw[y * stride..(y + 1) * stride];
        for x in 0..w {
            let pi = x * 4;
            let r = row_in[pi] as f32;
            let g = row_in[pi + 1] as f32;
            let b = row_in[pi + 2] as f32;
            let a = row_in[pi + 3] as f32;
            let (nr, ng, nb, na) = transform(r, g, b, a);
            row_out[pi]     = nr.round().clamp(0.0, 255.0) as u8;
            row_out[pi + 1] = ng.round().clamp(0.0, 255.0) as u8;
            row_out[pi + 2] = nb.round().clamp(0.0, 255.0) as u8;
            row_out[pi + 3] = na.round().clamp(0.0, 255.0) as u8;
        }
    });

    RgbaImage::from_raw(w as u32, h as u32, dst_raw).unwrap_or_else(|| src.clone())
}

/// Rec. 601 luma, the weights every grayscale path in the crate uses.
#[inline]
pub fn luminance(r: f32, g: f32, b: f32) -> f32 {
    0.299 * r + 0.587 * g + 0.114 * b
}
