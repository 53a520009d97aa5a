// ============================================================================
// IMAGE FILTERS — box blur, sharpen, edge detection
// ============================================================================

use image::RgbaImage;
use rayon::prelude::*;

use super::luminance;

/// Separable box blur of the RGB channels (horizontal pass, then vertical).
/// Samples past the edge clamp to the nearest valid pixel.  Alpha is kept.
pub fn box_blur(src: &RgbaImage, radius: u32) -> RgbaImage {
    let (w, h) = (src.width() as usize, src.height() as usize);
    if radius == 0 || w == 0 || h == 0 {
        return src.clone();
    }

    let raw = src.as_raw();
    let planes: Vec<Vec<f32>> = (0..3)
        .into_par_iter()
        .map(|c| {
            let plane: Vec<f32> = raw.chunks_exact(4).map(|p| p[c] as f32).collect();
            blur_plane(&plane, w, h, radius)
        })
        .collect();

    let mut out = src.clone();
    for (i, px) in out.chunks_exact_mut(4).enumerate() {
        for c in 0..3 {
            px[c] = planes[c][i].round().clamp(0.0, 255.0) as u8;
        }
    }
    out
}

/// Box blur of a single-channel `w`×`h` plane with clamped edges.
pub fn blur_plane(plane: &[f32], w: usize, h: usize, radius: u32) -> Vec<f32> {
    if radius == 0 || w == 0 || h == 0 || plane.len() != w * h {
        return plane.to_vec();
    }
    let r = radius as i64;
    let window = (2 * r + 1) as f32;

    let mut tmp = vec![0.0f32; w * h];
    tmp.par_chunks_mut(w).enumerate().for_each(|(y, row)| {
        let row_in = &plane[y * w..(y + 1) * w];
        for (x, out) in row.iter_mut().enumerate() {
            let mut acc = 0.0;
            for k in -r..=r {
                let sx = (x as i64 + k).clamp(0, w as i64 - 1) as usize;
                acc += row_in[sx];
            }
            *out = acc / window;
        }
    });

    let mut out = vec![0.0f32; w * h];
    out.par_chunks_mut(w).enumerate().for_each(|(y, row)| {
        for (x, o) in row.iter_mut().enumerate() {
            let mut acc = 0.0;
            for k in -r..=r {
                let sy = (y as i64 + k).clamp(0, h as i64 - 1) as usize;
                acc += tmp[sy * w + x];
            }
            *o = acc / window;
        }
    });
    out
}

/// 3×3 sharpen with kernel `[[0,-k,0],[-k,1+4k,-k],[0,-k,0]]` on RGB.
/// The 1px border ring is copied unmodified.
pub fn sharpen(src: &RgbaImage, amount: f32) -> RgbaImage {
    let (w, h) = (src.width() as usize, src.height() as usize);
    if amount == 0.0 || w < 3 || h < 3 {
        return src.clone();
    }
    let raw = src.as_raw();
    let stride = w * 4;
    let centre = 1.0 + 4.0 * amount;

    let mut out = raw.clone();
    out.par_chunks_mut(stride).enumerate().for_each(|(y, row)| {
        if y == 0 || y == h - 1 {
            return;
        }
        for x in 1..w - 1 {
            let i = y * stride + x * 4;
            for c in 0..3 {
                let v = centre * raw[i + c] as f32
                    - amount
                        * (raw[i - stride + c] as f32
                            + raw[i + stride + c] as f32
                            + raw[i - 4 + c] as f32
                            + raw[i + 4 + c] as f32);
                row[x * 4 + c] = v.round().clamp(0.0, 255.0) as u8;
            }
        }
    });
    RgbaImage::from_raw(w as u32, h as u32, out).unwrap_or_else(|| src.clone())
}

/// Luma conversion followed by Sobel gradient magnitude.  Output is gray
/// written to RGB with full opacity; the 1px border is left as in the input.
pub fn edge_detect(src: &RgbaImage) -> RgbaImage {
    let (w, h) = (src.width() as usize, src.height() as usize);
    if w < 3 || h < 3 {
        return src.clone();
    }
    let gray: Vec<f32> = src
        .as_raw()
        .chunks_exact(4)
        .map(|p| luminance(p[0] as f32, p[1] as f32, p[2] as f32))
        .collect();
    let stride = w * 4;

    let mut out = src.as_raw().clone();
    out.par_chunks_mut(stride).enumerate().for_each(|(y, row)| {
        if y == 0 || y == h - 1 {
            return;
        }
        let g = |x: usize, y: usize| gray[y * w + x];
        for x in 1..w - 1 {
            let gx = -g(x - 1, y - 1) - 2.0 * g(x - 1, y) - g(x - 1, y + 1)
                + g(x + 1, y - 1) + 2.0 * g(x + 1, y) + g(x + 1, y + 1);
            let gy = -g(x - 1, y - 1) - 2.0 * g(x, y - 1) - g(x + 1, y - 1)
                + g(x - 1, y + 1) + 2.0 * g(x, y + 1) + g(x + 1, y + 1);
            let mag = (gx * gx + gy * gy).sqrt().round().clamp(0.0, 255.0) as u8;
            row[x * 4..x * 4 + 4].copy_from_slice(&[mag, mag, mag, 255]);
        }
    });
    RgbaImage::from_raw(w as u32, h as u32, out).unwrap_or_else(|| src.clone())
}
