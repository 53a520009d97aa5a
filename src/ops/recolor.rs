// ============================================================================
// RECOLOR — colour parsing, grayscale overlay presets, selective HSL recolor
// ============================================================================

use image::{Rgba, RgbaImage};
use rayon::prelude::*;

use super::adjustments::{hsl_to_rgb, rgb_to_hsl};
use super::{FilterError, luminance};

/// Pixels with alpha below this are never recoloured.
const MIN_ALPHA: u8 = 10;

/// Used when an image has no visible pixels to build a histogram from.
pub const DEFAULT_SATURATION_THRESHOLD: f32 = 0.2;

/// Parse `#rgb`, `#rrggbb` or `#rrggbbaa` (the `#` is optional).
pub fn parse_hex_color(s: &str) -> Result<Rgba<u8>, FilterError> {
    let hex = s.trim().trim_start_matches('#');
    let invalid = || FilterError::InvalidColor(s.to_string());
    if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(invalid());
    }
    let byte = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| invalid());
    match hex.len() {
        3 => {
            let nib = |i: usize| u8::from_str_radix(&hex[i..i + 1], 16).map(|v| v * 17).map_err(|_| invalid());
            Ok(Rgba([nib(0)?, nib(1)?, nib(2)?, 255]))
        }
        6 => Ok(Rgba([byte(0)?, byte(2)?, byte(4)?, 255])),
        8 => Ok(Rgba([byte(0)?, byte(2)?, byte(4)?, byte(6)?])),
        _ => Err(invalid()),
    }
}

/// Lenient variant: unparseable input becomes opaque white, with a warning.
pub fn parse_hex_color_or_white(s: &str) -> Rgba<u8> {
    parse_hex_color(s).unwrap_or_else(|e| {
        log_warn!("Recolor: {}, using white", e);
        Rgba([255, 255, 255, 255])
    })
}

// ============================================================================
// GRAYSCALE + COLOUR OVERLAY
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RecolorTarget {
    Solid(Rgba<u8>),
    /// Top-to-bottom two-colour gradient.
    VerticalGradient { top: Rgba<u8>, bottom: Rgba<u8> },
}

impl RecolorTarget {
    fn color_at_row(&self, y: u32, height: u32) -> [f32; 3] {
        match *self {
            RecolorTarget::Solid(c) => [c[0] as f32, c[1] as f32, c[2] as f32],
            RecolorTarget::VerticalGradient { top, bottom } => {
                let t = if height > 1 { y as f32 / (height - 1) as f32 } else { 0.0 };
                [0, 1, 2].map(|i| top[i] as f32 + (bottom[i] as f32 - top[i] as f32) * t)
            }
        }
    }
}

/// Multiply the luma of each pixel by the target colour, then blend that
/// with the original by `intensity` (0 = unchanged, 1 = fully recoloured).
pub fn grayscale_overlay(src: &RgbaImage, target: RecolorTarget, intensity: f32) -> RgbaImage {
    let intensity = intensity.clamp(0.0, 1.0);
    let (w, h) = src.dimensions();
    if intensity == 0.0 || w == 0 || h == 0 {
        return src.clone();
    }
    let stride = w as usize * 4;
    let mut out = src.clone();
    out.par_chunks_mut(stride).enumerate().for_each(|(y, row)| {
        let color = target.color_at_row(y as u32, h);
        for px in row.chunks_exact_mut(4) {
            let gray = luminance(px[0] as f32, px[1] as f32, px[2] as f32);
            for c in 0..3 {
                let tinted = gray * color[c] / 255.0;
                let orig = px[c] as f32;
                px[c] = (orig + (tinted - orig) * intensity).round().clamp(0.0, 255.0) as u8;
            }
        }
    });
    out
}

// ============================================================================
// SELECTIVE HSL RECOLOR
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SelectiveRecolor {
    /// Target hue in degrees.
    pub target_hue: f32,
    /// When set, the right half of the image gets this hue instead.
    pub right_hue: Option<f32>,
    /// Saturation (0..1) at or below which a pixel counts as neutral.
    pub saturation_threshold: f32,
    /// Saturation multiplier; the result is clamped to 1.0.
    pub saturation_boost: f32,
}

impl Default for SelectiveRecolor {
    fn default() -> Self {
        Self {
            target_hue: 0.0,
            right_hue: None,
            saturation_threshold: DEFAULT_SATURATION_THRESHOLD,
            saturation_boost: 1.0,
        }
    }
}

/// Replace the hue of coloured pixels, keeping lightness.  Neutral pixels
/// (white/gray/black) and nearly transparent pixels are left untouched.
pub fn replace_icon_color(src: &RgbaImage, params: &SelectiveRecolor) -> RgbaImage {
    let (w, h) = src.dimensions();
    if w == 0 || h == 0 {
        return src.clone();
    }
    let half = w / 2;
    let left_hue = params.target_hue.rem_euclid(360.0) / 360.0;
    let right_hue = params.right_hue.map_or(left_hue, |r| r.rem_euclid(360.0) / 360.0);
    let stride = w as usize * 4;

    let mut out = src.clone();
    out.par_chunks_mut(stride).for_each(|row| {
        for (x, px) in row.chunks_exact_mut(4).enumerate() {
            if px[3] < MIN_ALPHA {
                continue;
            }
            let (_, s, l) = rgb_to_hsl(px[0] as f32 / 255.0, px[1] as f32 / 255.0, px[2] as f32 / 255.0);
            if s <= params.saturation_threshold {
                continue;
            }
            let hue = if (x as u32) < half { left_hue } else { right_hue };
            let ns = (s * params.saturation_boost).clamp(0.0, 1.0);
            let (r, g, b) = hsl_to_rgb(hue, ns, l);
            px[0] = (r * 255.0).round().clamp(0.0, 255.0) as u8;
            px[1] = (g * 255.0).round().clamp(0.0, 255.0) as u8;
            px[2] = (b * 255.0).round().clamp(0.0, 255.0) as u8;
        }
    });
    out
}

const BAND: std::ops::RangeInclusive<usize> = 10..=35;
const SMOOTH_RADIUS: usize = 2;

/// Suggest a neutral/coloured cutoff: the valley of the smoothed saturation
/// histogram (1% bins) between 10% and 35%.  When several bins tie for the
/// minimum, the centre of the widest run of them wins.
pub fn suggest_saturation_threshold(src: &RgbaImage) -> f32 {
    let mut histogram = [0u32; 101];
    let mut counted = 0usize;
    for p in src.pixels() {
        if p[3] < MIN_ALPHA {
            continue;
        }
        let (_, s, _) = rgb_to_hsl(p[0] as f32 / 255.0, p[1] as f32 / 255.0, p[2] as f32 / 255.0);
        histogram[(s * 100.0).round().clamp(0.0, 100.0) as usize] += 1;
        counted += 1;
    }
    if counted == 0 {
        return DEFAULT_SATURATION_THRESHOLD;
    }

    let smoothed: Vec<u32> = (0..histogram.len())
        .map(|i| {
            let lo = i.saturating_sub(SMOOTH_RADIUS);
            let hi = (i + SMOOTH_RADIUS).min(histogram.len() - 1);
            histogram[lo..=hi].iter().sum()
        })
        .collect();
    let Some(floor) = BAND.map(|i| smoothed[i]).min() else {
        return DEFAULT_SATURATION_THRESHOLD;
    };

    // Widest run of bins sitting at the floor.
    let mut best = (*BAND.start(), 0usize);
    let mut run_start = None;
    for i in BAND.chain(std::iter::once(BAND.end() + 1)) {
        let at_floor = BAND.contains(&i) && smoothed[i] == floor;
        match (at_floor, run_start) {
            (true, None) => run_start = Some(i),
            (false, Some(start)) => {
                if i - start > best.1 {
                    best = (start, i - start);
                }
                run_start = None;
            }
            _ => {}
        }
    }
    let valley = best.0 + best.1.saturating_sub(1) / 2;
    valley as f32 / 100.0
}
