// ============================================================================
// LAYER COMPOSITOR — CPU source-over compositing with blend modes
// ============================================================================
//
// Layers are painted bottom to top by z-index.  Each target pixel centre is
// mapped back into layer space through the inverse of the layer transform
// (translate, then rotate/scale about the layer's own centre) and sampled
// nearest-neighbour, so output depends only on the inputs.

use image::{Rgba, RgbaImage};
use rayon::prelude::*;

use crate::canvas::{BlendMode, Layer, Transform};

/// Clear `target` to transparent and paint every visible layer onto it.
pub fn compose(layers: &[&Layer], target: &mut RgbaImage) {
    compose_over_background(layers, Rgba([0, 0, 0, 0]), target);
}

/// Fill `target` with `background`, then paint every visible layer.
pub fn compose_over_background(layers: &[&Layer], background: Rgba<u8>, target: &mut RgbaImage) {
    for px in target.pixels_mut() {
        *px = background;
    }

    let mut visible: Vec<&Layer> = layers.iter().copied().filter(|l| l.visible).collect();
    // Stable: equal z-indices keep their input order.
    visible.sort_by_key(|l| l.z_index);

    for layer in visible {
        paint_layer(layer, target);
    }
}

fn paint_layer(layer: &Layer, target: &mut RgbaImage) {
    let opacity = layer.opacity.clamp(0.0, 1.0);
    let t = layer.transform;
    if opacity <= 0.0 || t.scale_x == 0.0 || t.scale_y == 0.0 {
        return;
    }
    let src = layer.image();
    if src.width() == 0 || src.height() == 0 {
        return;
    }
    if t.is_integer_translation() {
        paint_translated(src, t.x as i64, t.y as i64, layer.blend_mode, opacity, target);
    } else {
        paint_transformed(src, &t, layer.blend_mode, opacity, target);
    }
}

/// Exact pixel copy path for layers that are only offset by whole pixels.
fn paint_translated(src: &RgbaImage, dx: i64, dy: i64, mode: BlendMode, opacity: f32, target: &mut RgbaImage) {
    let tw = target.width() as i64;
    let th = target.height() as i64;
    let sw = src.width() as i64;
    let sh = src.height() as i64;

    let x0 = dx.max(0);
    let x1 = dx.saturating_add(sw).min(tw);
    let y0 = dy.max(0);
    let y1 = dy.saturating_add(sh).min(th);
    if x0 >= x1 || y0 >= y1 {
        return;
    }

    let stride = tw as usize * 4;
    target
        .par_chunks_mut(stride)
        .enumerate()
        .for_each(|(ty, row)| {
            let ty = ty as i64;
            if ty < y0 || ty >= y1 {
                return;
            }
            let sy = (ty - dy) as u32;
            for tx in x0..x1 {
                let sx = (tx - dx) as u32;
                let top = *src.get_pixel(sx, sy);
                let i = tx as usize * 4;
                let base = Rgba([row[i], row[i + 1], row[i + 2], row[i + 3]]);
                let out = blend_pixel(base, top, mode, opacity);
                row[i..i + 4].copy_from_slice(&out.0);
            }
        });
}

fn paint_transformed(src: &RgbaImage, t: &Transform, mode: BlendMode, opacity: f32, target: &mut RgbaImage) {
    let sw = src.width() as f32;
    let sh = src.height() as f32;
    let (cx, cy) = (sw / 2.0, sh / 2.0);
    // Canvas-space position of the layer centre.
    let (px, py) = (t.x + cx, t.y + cy);
    let (sin, cos) = t.rotation.to_radians().sin_cos();

    // Forward map of the layer corners bounds the rows we need to visit.
    let forward = |lx: f32, ly: f32| -> (f32, f32) {
        let (ux, uy) = ((lx - cx) * t.scale_x, (ly - cy) * t.scale_y);
        (px + ux * cos - uy * sin, py + ux * sin + uy * cos)
    };
    let corners = [forward(0.0, 0.0), forward(sw, 0.0), forward(0.0, sh), forward(sw, sh)];
    let min_x = corners.iter().map(|c| c.0).fold(f32::INFINITY, f32::min).floor().max(0.0) as u32;
    let max_x = corners.iter().map(|c| c.0).fold(f32::NEG_INFINITY, f32::max).ceil().min(target.width() as f32) as u32;
    let min_y = corners.iter().map(|c| c.1).fold(f32::INFINITY, f32::min).floor().max(0.0) as u32;
    let max_y = corners.iter().map(|c| c.1).fold(f32::NEG_INFINITY, f32::max).ceil().min(target.height() as f32) as u32;
    if min_x >= max_x || min_y >= max_y {
        return;
    }

    let (inv_sx, inv_sy) = (1.0 / t.scale_x, 1.0 / t.scale_y);
    let stride = target.width() as usize * 4;
    target
        .par_chunks_mut(stride)
        .enumerate()
        .for_each(|(ty, row)| {
            let ty = ty as u32;
            if ty < min_y || ty >= max_y {
                return;
            }
            let qy = ty as f32 + 0.5 - py;
            for tx in min_x..max_x {
                let qx = tx as f32 + 0.5 - px;
                // Inverse rotation, then inverse scale.
                let rx = qx * cos + qy * sin;
                let ry = -qx * sin + qy * cos;
                let lx = rx * inv_sx + cx;
                let ly = ry * inv_sy + cy;
                if lx < 0.0 || ly < 0.0 || lx >= sw || ly >= sh {
                    continue;
                }
                let top = *src.get_pixel(lx as u32, ly as u32);
                let i = tx as usize * 4;
                let base = Rgba([row[i], row[i + 1], row[i + 2], row[i + 3]]);
                let out = blend_pixel(base, top, mode, opacity);
                row[i..i + 4].copy_from_slice(&out.0);
            }
        });
}

/// Source-over composite of `top` onto `base` with the given blend mode and
/// layer opacity.  Channels are rounded, so 50% opacity gives alpha 128.
pub fn blend_pixel(base: Rgba<u8>, top: Rgba<u8>, mode: BlendMode, opacity: f32) -> Rgba<u8> {
    // Fast path: fully transparent top pixel, nothing to blend
    if top[3] == 0 {
        return base;
    }

    // Fast path: Normal blend, full opacity, fully opaque top pixel: overwrite
    if matches!(mode, BlendMode::Normal) && opacity >= 1.0 && top[3] == 255 {
        return top;
    }

    let opacity = opacity.clamp(0.0, 1.0);

    let base_r = base[0] as f32 / 255.0;
    let base_g = base[1] as f32 / 255.0;
    let base_b = base[2] as f32 / 255.0;
    let base_a = base[3] as f32 / 255.0;

    let top_r = top[0] as f32 / 255.0;
    let top_g = top[1] as f32 / 255.0;
    let top_b = top[2] as f32 / 255.0;
    let top_a = (top[3] as f32 / 255.0) * opacity;

    let (r, g, b) = match mode {
        BlendMode::Normal => (top_r, top_g, top_b),
        BlendMode::Multiply => (base_r * top_r, base_g * top_g, base_b * top_b),
        BlendMode::Screen => (
            1.0 - (1.0 - base_r) * (1.0 - top_r),
            1.0 - (1.0 - base_g) * (1.0 - top_g),
            1.0 - (1.0 - base_b) * (1.0 - top_b),
        ),
        BlendMode::Overlay => (
            overlay_channel(base_r, top_r),
            overlay_channel(base_g, top_g),
            overlay_channel(base_b, top_b),
        ),
        BlendMode::Darken => (base_r.min(top_r), base_g.min(top_g), base_b.min(top_b)),
        BlendMode::Lighten => (base_r.max(top_r), base_g.max(top_g), base_b.max(top_b)),
    };

    // Where the backdrop is transparent the blend function has nothing to
    // act on, so the top colour shows through unchanged.
    let r = (1.0 - base_a) * top_r + base_a * r;
    let g = (1.0 - base_a) * top_g + base_a * g;
    let b = (1.0 - base_a) * top_b + base_a * b;

    let out_a = top_a + base_a * (1.0 - top_a);
    if out_a == 0.0 {
        return Rgba([0, 0, 0, 0]);
    }

    let out_r = (r * top_a + base_r * base_a * (1.0 - top_a)) / out_a;
    let out_g = (g * top_a + base_g * base_a * (1.0 - top_a)) / out_a;
    let out_b = (b * top_a + base_b * base_a * (1.0 - top_a)) / out_a;

    Rgba([
        to_channel(out_r),
        to_channel(out_g),
        to_channel(out_b),
        to_channel(out_a),
    ])
}

#[inline]
fn to_channel(v: f32) -> u8 {
    (v * 255.0).round().clamp(0.0, 255.0) as u8
}

fn overlay_channel(base: f32, top: f32) -> f32 {
    if base < 0.5 {
        2.0 * base * top
    } else {
        1.0 - 2.0 * (1.0 - base) * (1.0 - top)
    }
}
