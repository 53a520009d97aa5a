// ============================================================================
// ADJUSTMENT OPERATIONS — brightness, contrast, saturation, hue, grayscale
// ============================================================================
//
// Pure functions: the input buffer is never modified, alpha is preserved.

use image::RgbaImage;

use super::{luminance, map_pixels};

/// Additive brightness offset per channel.
/// `value`: -255..255 (0 = no change)
pub fn brightness(src: &RgbaImage, value: f32) -> RgbaImage {
    if value == 0.0 {
        return src.clone();
    }
    map_pixels(src, move |r, g, b, a| (r + value, g + value, b + value, a))
}

/// Linear contrast remap around 128.
/// `value`: -100..100 (0 = no change); clamped to that range.
pub fn contrast(src: &RgbaImage, value: f32) -> RgbaImage {
    let value = value.clamp(-100.0, 100.0);
    if value == 0.0 {
        return src.clone();
    }
    let factor = contrast_factor(value);
    map_pixels(src, move |r, g, b, a| {
        (
            factor * (r - 128.0) + 128.0,
            factor * (g - 128.0) + 128.0,
            factor * (b - 128.0) + 128.0,
            a,
        )
    })
}

pub fn contrast_factor(value: f32) -> f32 {
    (259.0 * (value + 255.0)) / (255.0 * (259.0 - value))
}

/// Interpolate between each pixel's luma gray and itself.
/// `value`: -100..∞ (0 = no change, -100 = fully gray, >0 oversaturates)
pub fn saturation(src: &RgbaImage, value: f32) -> RgbaImage {
    if value == 0.0 {
        return src.clone();
    }
    let factor = ((value + 100.0) / 100.0).max(0.0);
    map_pixels(src, move |r, g, b, a| {
        let gray = luminance(r, g, b);
        (
            gray + (r - gray) * factor,
            gray + (g - gray) * factor,
            gray + (b - gray) * factor,
            a,
        )
    })
}

/// Rotate hue by `degrees` with a single 3×3 matrix applied to RGB.
pub fn hue_rotate(src: &RgbaImage, degrees: f32) -> RgbaImage {
    if degrees.rem_euclid(360.0) == 0.0 {
        return src.clone();
    }
    let m = hue_rotation_matrix(degrees);
    map_pixels(src, move |r, g, b, a| {
        (
            m[0][0] * r + m[0][1] * g + m[0][2] * b,
            m[1][0] * r + m[1][1] * g + m[1][2] * b,
            m[2][0] * r + m[2][1] * g + m[2][2] * b,
            a,
        )
    })
}

/// Luminance-preserving hue rotation matrix (as used by SVG feColorMatrix).
pub fn hue_rotation_matrix(degrees: f32) -> [[f32; 3]; 3] {
    let (sin, cos) = degrees.to_radians().sin_cos();
    [
        [
            0.213 + cos * 0.787 - sin * 0.213,
            0.715 - cos * 0.715 - sin * 0.715,
            0.072 - cos * 0.072 + sin * 0.928,
        ],
        [
            0.213 - cos * 0.213 + sin * 0.143,
            0.715 + cos * 0.285 + sin * 0.140,
            0.072 - cos * 0.072 - sin * 0.283,
        ],
        [
            0.213 - cos * 0.213 - sin * 0.787,
            0.715 - cos * 0.715 + sin * 0.715,
            0.072 + cos * 0.928 + sin * 0.072,
        ],
    ]
}

/// Luma grayscale, alpha preserved.
pub fn grayscale(src: &RgbaImage) -> RgbaImage {
    map_pixels(src, |r, g, b, a| {
        let l = luminance(r, g, b);
        (l, l, l, a)
    })
}

/// The four basic adjustments in one pass, applied in the order
/// brightness, contrast, saturation, hue.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Adjustments {
    pub brightness: f32,
    pub contrast: f32,
    pub saturation: f32,
    pub hue: f32,
}

impl Adjustments {
    pub fn is_identity(&self) -> bool {
        self.brightness == 0.0
            && self.contrast == 0.0
            && self.saturation == 0.0
            && self.hue.rem_euclid(360.0) == 0.0
    }

    pub fn apply(&self, src: &RgbaImage) -> RgbaImage {
        if self.is_identity() {
            return src.clone();
        }
        let brightness = self.brightness;
        let contrast = contrast_factor(self.contrast.clamp(-100.0, 100.0));
        let sat = ((self.saturation + 100.0) / 100.0).max(0.0);
        let hue = (self.hue.rem_euclid(360.0) != 0.0).then(|| hue_rotation_matrix(self.hue));

        // Intermediate values are clamped between stages so the single pass
        // matches applying the filters one after another.
        map_pixels(src, move |r, g, b, a| {
            let mut c = [r, g, b];
            if brightness != 0.0 {
                c = c.map(|v| (v + brightness).round().clamp(0.0, 255.0));
            }
            if contrast != 1.0 {
                c = c.map(|v| (contrast * (v - 128.0) + 128.0).round().clamp(0.0, 255.0));
            }
            if sat != 1.0 {
                let gray = luminance(c[0], c[1], c[2]);
                c = c.map(|v| (gray + (v - gray) * sat).round().clamp(0.0, 255.0));
            }
            if let Some(m) = hue {
                c = [
                    m[0][0] * c[0] + m[0][1] * c[1] + m[0][2] * c[2],
                    m[1][0] * c[0] + m[1][1] * c[1] + m[1][2] * c[2],
                    m[2][0] * c[0] + m[2][1] * c[1] + m[2][2] * c[2],
                ];
            }
            (c[0], c[1], c[2], a)
        })
    }
}

// ============================================================================
// COLOR SPACE HELPERS
// ============================================================================

/// RGB (0..1) → HSL (H: 0..1, S: 0..1, L: 0..1)
pub fn rgb_to_hsl(r: f32, g: f32, b: f32) -> (f32, f32, f32) {
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let l = (max + min) / 2.0;

    if (max - min).abs() < 1e-6 {
        return (0.0, 0.0, l);
    }

    let d = max - min;
    let s = if l > 0.5 { d / (2.0 - max - min) } else { d / (max + min) };

    let h = if (max - r).abs() < 1e-6 {
        let mut h = (g - b) / d;
        if h < 0.0 { h += 6.0; }
        h / 6.0
    } else if (max - g).abs() < 1e-6 {
        ((b - r) / d + 2.0) / 6.0
    } else {
        ((r - g) / d + 4.0) / 6.0
    };

    (h, s, l)
}

/// HSL (H: 0..1, S: 0..1, L: 0..1) → RGB (0..1)
pub fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s.abs() < 1e-6 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    let r = hue_to_rgb(p, q, h + 1.0 / 3.0);
    let g = hue_to_rgb(p, q, h);
    let b = hue_to_rgb(p, q, h - 1.0 / 3.0);

    (r, g, b)
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 { t += 1.0; }
    if t > 1.0 { t -= 1.0; }
    if t < 1.0 / 6.0 { return p + (q - p) * 6.0 * t; }
    if t < 1.0 / 2.0 { return q; }
    if t < 2.0 / 3.0 { return p + (q - p) * (2.0 / 3.0 - t) * 6.0; }
    p
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn sample() -> RgbaImage {
        RgbaImage::from_fn(6, 5, |x, y| Rgba([(x * 40) as u8, (y * 50) as u8, 77, (x * 10 + y) as u8]))
    }

    #[test]
    fn neutral_parameters_are_identity() {
        let img = sample();
        assert_eq!(brightness(&img, 0.0), img);
        assert_eq!(contrast(&img, 0.0), img);
        assert_eq!(saturation(&img, 0.0), img);
        assert_eq!(hue_rotate(&img, 360.0), img);
        assert_eq!(Adjustments::default().apply(&img), img);
    }

    #[test]
    fn brightness_clamps_and_keeps_alpha() {
        let img = RgbaImage::from_pixel(1, 1, Rgba([250, 10, 128, 33]));
        let out = brightness(&img, 20.0);
        assert_eq!(*out.get_pixel(0, 0), Rgba([255, 30, 148, 33]));
    }

    #[test]
    fn contrast_uses_the_259_factor() {
        let f = contrast_factor(50.0);
        let expected = (f * (200.0 - 128.0) + 128.0_f32).round().clamp(0.0, 255.0) as u8;
        let out = contrast(&RgbaImage::from_pixel(1, 1, Rgba([200, 128, 0, 255])), 50.0);
        assert_eq!(out.get_pixel(0, 0)[0], expected);
        assert_eq!(out.get_pixel(0, 0)[1], 128);
    }

    #[test]
    fn full_desaturation_is_gray() {
        let out = saturation(&RgbaImage::from_pixel(1, 1, Rgba([255, 0, 0, 255])), -100.0);
        let p = out.get_pixel(0, 0);
        assert_eq!(p[0], p[1]);
        assert_eq!(p[1], p[2]);
        assert_eq!(p[0], 76);
    }

    #[test]
    fn hue_rotation_keeps_gray_gray() {
        let out = hue_rotate(&RgbaImage::from_pixel(1, 1, Rgba([100, 100, 100, 255])), 120.0);
        let p = out.get_pixel(0, 0);
        for c in 0..3 {
            assert!((p[c] as i32 - 100).abs() <= 1);
        }
    }

    #[test]
    fn combined_matches_sequential() {
        let img = sample();
        let adj = Adjustments { brightness: 10.0, contrast: 20.0, saturation: 30.0, hue: 0.0 };
        let sequential = saturation(&contrast(&brightness(&img, 10.0), 20.0), 30.0);
        assert_eq!(adj.apply(&img), sequential);
    }

    #[test]
    fn hsl_round_trip() {
        let (h, s, l) = rgb_to_hsl(0.2, 0.6, 0.4);
        let (r, g, b) = hsl_to_rgb(h, s, l);
        assert!((r - 0.2).abs() < 1e-4 && (g - 0.6).abs() < 1e-4 && (b - 0.4).abs() < 1e-4);
    }
}
