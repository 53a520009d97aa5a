// ============================================================================
// BACKGROUND REMOVAL — confidence mask → alpha
// ============================================================================
//
// The segmentation model itself is an external collaborator behind
// `SegmentationModel`.  This module owns the mask math: resampling,
// thresholding or feathering, expansion, hole filling, inversion and the
// final edge blur, then multiplies the result into the image's alpha.

use image::{GrayImage, RgbaImage};
use rayon::prelude::*;

use super::FilterError;
use super::filters::blur_plane;
use super::worker::CancelToken;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum SegmentationError {
    #[error("segmentation model unavailable: {0}")]
    ModelUnavailable(String),
    #[error("segmentation inference failed: {0}")]
    InferenceFailed(String),
    #[error("invalid model output: {0}")]
    InvalidOutput(String),
    #[error("segmentation cancelled")]
    Cancelled,
    #[error(transparent)]
    Filter(#[from] FilterError),
}

impl SegmentationError {
    /// Cancellation is a silent outcome, not a failure to report.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SegmentationError::Cancelled)
    }
}

/// Settings for the Remove Background operation.
/// These control how the model mask is post-processed before being
/// multiplied into the alpha channel.
#[derive(Clone, Debug, PartialEq)]
pub struct RemoveBgSettings {
    /// Foreground confidence threshold (0.0–1.0). Default: 0.5.
    pub threshold: f32,
    /// When true, alpha ramps linearly around the threshold
    /// (`confidence - threshold + 0.5`) instead of a hard cutoff.
    pub feather: bool,
    /// Keep the background and drop the foreground instead.
    pub invert_mask: bool,
    /// Box-blur radius applied to the final alpha mask. 0 = none.
    pub edge_feather_radius: u32,
    /// Mask expansion in pixels. Positive = grow foreground (keep more),
    /// negative = shrink foreground (remove more). Default: 0.
    pub mask_expansion: i32,
    /// Fill interior holes in the foreground mask using morphological close
    /// (dilate then erode). The value is the kernel radius. 0 = disabled.
    pub fill_holes: u32,
}

impl Default for RemoveBgSettings {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            feather: true,
            invert_mask: false,
            edge_feather_radius: 0,
            mask_expansion: 0,
            fill_holes: 0,
        }
    }
}

/// Per-pixel foreground confidence in [0, 1].
#[derive(Clone, Debug, PartialEq)]
pub struct ConfidenceMask {
    width: u32,
    height: u32,
    values: Vec<f32>,
}

impl ConfidenceMask {
    /// Values are clamped to [0, 1].
    pub fn new(width: u32, height: u32, values: Vec<f32>) -> Result<Self, SegmentationError> {
        if width == 0 || height == 0 || values.len() != width as usize * height as usize {
            return Err(SegmentationError::InvalidOutput(format!(
                "{} values for a {}x{} mask",
                values.len(),
                width,
                height
            )));
        }
        if values.iter().any(|v| v.is_nan()) {
            return Err(SegmentationError::InvalidOutput("mask contains NaN".to_string()));
        }
        let values = values.into_iter().map(|v| v.clamp(0.0, 1.0)).collect();
        Ok(Self { width, height, values })
    }

    /// Accept raw model output, applying a sigmoid only when the values
    /// are logits rather than probabilities.
    pub fn from_model_output(width: u32, height: u32, raw: Vec<f32>) -> Result<Self, SegmentationError> {
        let already_prob = is_probability_space(&raw);
        let values = raw.into_iter().map(|v| to_probability(v, already_prob)).collect();
        Self::new(width, height, values)
    }

    pub fn from_gray(mask: &GrayImage) -> Result<Self, SegmentationError> {
        let values = mask.as_raw().iter().map(|&v| v as f32 / 255.0).collect();
        Self::new(mask.width(), mask.height(), values)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn get(&self, x: u32, y: u32) -> f32 {
        self.values[y as usize * self.width as usize + x as usize]
    }

    /// Bilinear resample to `width`×`height` (pixel-centre aligned).
    pub fn resample(&self, width: u32, height: u32) -> ConfidenceMask {
        if (width, height) == (self.width, self.height) || width == 0 || height == 0 {
            return self.clone();
        }
        let sx = self.width as f32 / width as f32;
        let sy = self.height as f32 / height as f32;
        let max_x = (self.width - 1) as f32;
        let max_y = (self.height - 1) as f32;
        let mut values = vec![0.0f32; width as usize * height as usize];
        values.par_chunks_mut(width as usize).enumerate().for_each(|(y, row)| {
            let fy = ((y as f32 + 0.5) * sy - 0.5).clamp(0.0, max_y);
            let y0 = fy.floor() as u32;
            let y1 = (y0 + 1).min(self.height - 1);
            let ty = fy - y0 as f32;
            for (x, out) in row.iter_mut().enumerate() {
                let fx = ((x as f32 + 0.5) * sx - 0.5).clamp(0.0, max_x);
                let x0 = fx.floor() as u32;
                let x1 = (x0 + 1).min(self.width - 1);
                let tx = fx - x0 as f32;
                let top = self.get(x0, y0) * (1.0 - tx) + self.get(x1, y0) * tx;
                let bottom = self.get(x0, y1) * (1.0 - tx) + self.get(x1, y1) * tx;
                *out = top * (1.0 - ty) + bottom * ty;
            }
        });
        ConfidenceMask { width, height, values }
    }
}

/// Detect whether model output values are already probabilities (in [0, 1])
/// or raw logits (arbitrary range requiring sigmoid).
fn is_probability_space(data: &[f32]) -> bool {
    if data.is_empty() {
        return true;
    }
    // Sample up to 10000 evenly-spaced values for speed
    let step = (data.len() / 10000).max(1);
    let mut min_val = f32::MAX;
    let mut max_val = f32::MIN;
    for i in (0..data.len()).step_by(step) {
        min_val = min_val.min(data[i]);
        max_val = max_val.max(data[i]);
    }
    // If all values in [-0.05, 1.05], it's probability space
    min_val >= -0.05 && max_val <= 1.05
}

#[inline]
fn to_probability(v: f32, already_prob: bool) -> f32 {
    if already_prob {
        v.clamp(0.0, 1.0)
    } else {
        1.0 / (1.0 + (-v).exp())
    }
}

/// External segmentation engine.
pub trait SegmentationModel: Send + Sync {
    /// Produce a foreground confidence mask for `image`.  Long-running
    /// implementations should poll `cancel` and return
    /// `SegmentationError::Cancelled` when it fires.
    fn infer(&self, image: &RgbaImage, cancel: &CancelToken) -> Result<ConfidenceMask, SegmentationError>;
}

/// Turn a confidence mask into a `width`×`height` alpha plane in [0, 1].
pub fn mask_to_alpha(mask: &ConfidenceMask, width: u32, height: u32, settings: &RemoveBgSettings) -> Vec<f32> {
    let mask = mask.resample(width, height);
    let (w, h) = (width as usize, height as usize);
    let t = settings.threshold;

    let mut alpha: Vec<f32> = mask
        .values
        .par_iter()
        .map(|&c| {
            if settings.feather {
                (c - t + 0.5).clamp(0.0, 1.0)
            } else if c > t {
                1.0
            } else {
                0.0
            }
        })
        .collect();

    if settings.mask_expansion != 0 {
        alpha = expand(&alpha, w, h, settings.mask_expansion);
    }
    if settings.fill_holes > 0 {
        alpha = morphological_close(&alpha, w, h, settings.fill_holes as i32);
    }
    if settings.invert_mask {
        alpha.iter_mut().for_each(|a| *a = 1.0 - *a);
    }
    if settings.edge_feather_radius > 0 {
        alpha = blur_plane(&alpha, w, h, settings.edge_feather_radius);
    }
    alpha
}

/// Multiply `mask` into the alpha channel of `image` after post-processing.
pub fn apply_confidence_mask(image: &RgbaImage, mask: &ConfidenceMask, settings: &RemoveBgSettings) -> RgbaImage {
    let alpha = mask_to_alpha(mask, image.width(), image.height(), settings);
    multiply_alpha(image, &alpha)
}

/// Run `model` and apply its mask.  Nothing is returned unless the whole
/// pipeline succeeded, so a failure never yields a half-masked image.
pub fn remove_background(
    model: &dyn SegmentationModel,
    image: &RgbaImage,
    settings: &RemoveBgSettings,
    cancel: &CancelToken,
) -> Result<RgbaImage, SegmentationError> {
    if image.width() == 0 || image.height() == 0 {
        return Err(FilterError::InvalidDimensions { width: image.width(), height: image.height() }.into());
    }
    if cancel.is_cancelled() {
        return Err(SegmentationError::Cancelled);
    }
    let mask = model.infer(image, cancel).inspect_err(|e| {
        if !e.is_cancelled() {
            log_err!("Segmentation: {}", e);
        }
    })?;
    if cancel.is_cancelled() {
        return Err(SegmentationError::Cancelled);
    }
    Ok(apply_confidence_mask(image, &mask, settings))
}

/// Combine a hand-painted mask (255 = keep) with the existing alpha by
/// multiplication, bypassing any model.
pub fn apply_manual_mask(image: &RgbaImage, mask: &GrayImage) -> Result<RgbaImage, FilterError> {
    if image.dimensions() != mask.dimensions() {
        return Err(FilterError::MaskMismatch {
            mask: mask.dimensions(),
            image: image.dimensions(),
        });
    }
    let alpha: Vec<f32> = mask.as_raw().iter().map(|&v| v as f32 / 255.0).collect();
    Ok(multiply_alpha(image, &alpha))
}

fn multiply_alpha(image: &RgbaImage, alpha: &[f32]) -> RgbaImage {
    let mut output = image.clone();
    for (px, &m) in output.chunks_exact_mut(4).zip(alpha) {
        px[3] = (px[3] as f32 * m.clamp(0.0, 1.0)).round().clamp(0.0, 255.0) as u8;
    }
    output
}

/// Positive `amount` dilates (grows foreground), negative erodes.  Each
/// iteration is one 3×3 max/min pass.
fn expand(plane: &[f32], w: usize, h: usize, amount: i32) -> Vec<f32> {
    let grow = amount > 0;
    let mut current = plane.to_vec();
    for _ in 0..amount.unsigned_abs() {
        let prev = current.clone();
        current.par_chunks_mut(w).enumerate().for_each(|(y, row)| {
            for (x, out) in row.iter_mut().enumerate() {
                let mut v = prev[y * w + x];
                for ny in y.saturating_sub(1)..=(y + 1).min(h - 1) {
                    for nx in x.saturating_sub(1)..=(x + 1).min(w - 1) {
                        let n = prev[ny * w + nx];
                        v = if grow { v.max(n) } else { v.min(n) };
                    }
                }
                *out = v;
            }
        });
    }
    current
}

/// Dilate then erode: fills interior holes without moving the outer edge.
fn morphological_close(plane: &[f32], w: usize, h: usize, radius: i32) -> Vec<f32> {
    let dilated = expand(plane, w, h, radius);
    expand(&dilated, w, h, -radius)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgba};

    struct FixedMask(ConfidenceMask);

    impl SegmentationModel for FixedMask {
        fn infer(&self, _: &RgbaImage, _: &CancelToken) -> Result<ConfidenceMask, SegmentationError> {
            Ok(self.0.clone())
        }
    }

    struct Broken;

    impl SegmentationModel for Broken {
        fn infer(&self, _: &RgbaImage, _: &CancelToken) -> Result<ConfidenceMask, SegmentationError> {
            Err(SegmentationError::ModelUnavailable("no weights".to_string()))
        }
    }

    fn mask(values: &[f32], w: u32) -> ConfidenceMask {
        ConfidenceMask::new(w, values.len() as u32 / w, values.to_vec()).expect("valid mask")
    }

    #[test]
    fn feathered_alpha_ramps_around_threshold() {
        let m = mask(&[0.0, 0.3, 0.5, 0.7, 1.0], 5);
        let alpha = mask_to_alpha(&m, 5, 1, &RemoveBgSettings::default());
        let expected = [0.0, 0.3, 0.5, 0.7, 1.0];
        for (a, e) in alpha.iter().zip(expected) {
            assert!((a - e).abs() < 1e-6);
        }
    }

    #[test]
    fn hard_threshold_and_invert() {
        let m = mask(&[0.4, 0.5, 0.6], 3);
        let hard = RemoveBgSettings { feather: false, ..RemoveBgSettings::default() };
        assert_eq!(mask_to_alpha(&m, 3, 1, &hard), vec![0.0, 0.0, 1.0]);
        let inverted = RemoveBgSettings { invert_mask: true, ..hard };
        assert_eq!(mask_to_alpha(&m, 3, 1, &inverted), vec![1.0, 1.0, 0.0]);
    }

    #[test]
    fn mask_multiplies_existing_alpha() {
        let img = RgbaImage::from_pixel(2, 1, Rgba([10, 20, 30, 200]));
        let m = mask(&[1.0, 0.0], 2);
        let hard = RemoveBgSettings { feather: false, ..RemoveBgSettings::default() };
        let out = remove_background(&FixedMask(m), &img, &hard, &CancelToken::new()).expect("model succeeds");
        assert_eq!(*out.get_pixel(0, 0), Rgba([10, 20, 30, 200]));
        assert_eq!(*out.get_pixel(1, 0), Rgba([10, 20, 30, 0]));
    }

    #[test]
    fn model_failure_is_reported() {
        let img = RgbaImage::new(2, 2);
        let err = remove_background(&Broken, &img, &RemoveBgSettings::default(), &CancelToken::new());
        assert_eq!(err, Err(SegmentationError::ModelUnavailable("no weights".to_string())));
    }

    #[test]
    fn cancelled_token_short_circuits() {
        let img = RgbaImage::new(2, 2);
        let token = CancelToken::new();
        token.cancel();
        let m = mask(&[1.0; 4], 2);
        let err = remove_background(&FixedMask(m), &img, &RemoveBgSettings::default(), &token)
            .expect_err("cancelled");
        assert!(err.is_cancelled());
    }

    #[test]
    fn logits_get_sigmoid() {
        let m = ConfidenceMask::from_model_output(2, 1, vec![-8.0, 8.0]).expect("valid output");
        assert!(m.get(0, 0) < 0.01);
        assert!(m.get(1, 0) > 0.99);
        let p = ConfidenceMask::from_model_output(2, 1, vec![0.25, 0.75]).expect("valid output");
        assert_eq!(p.get(0, 0), 0.25);
        assert!(ConfidenceMask::from_model_output(3, 1, vec![0.0]).is_err());
    }

    #[test]
    fn small_mask_is_resampled_to_image_size() {
        let m = mask(&[0.0, 1.0], 2);
        let up = m.resample(4, 1);
        assert_eq!(up.get(0, 0), 0.0);
        assert_eq!(up.get(3, 0), 1.0);
        assert!(up.get(1, 0) > 0.0 && up.get(1, 0) < up.get(2, 0));
    }

    #[test]
    fn fill_holes_closes_interior_gap() {
        let mut values = vec![1.0f32; 25];
        values[12] = 0.0;
        let m = mask(&values, 5);
        let settings = RemoveBgSettings { feather: false, fill_holes: 1, ..RemoveBgSettings::default() };
        let alpha = mask_to_alpha(&m, 5, 5, &settings);
        assert_eq!(alpha[12], 1.0);
    }

    #[test]
    fn manual_mask_requires_matching_size() {
        let img = RgbaImage::from_pixel(2, 2, Rgba([1, 1, 1, 255]));
        let bad = GrayImage::new(3, 2);
        assert!(matches!(apply_manual_mask(&img, &bad), Err(FilterError::MaskMismatch { .. })));
        let half = GrayImage::from_pixel(2, 2, Luma([128]));
        let out = apply_manual_mask(&img, &half).expect("sizes match");
        assert_eq!(out.get_pixel(1, 1)[3], 128);
    }
}
