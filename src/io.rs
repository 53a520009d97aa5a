use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageEncoder, ImageError, ImageFormat, RgbaImage};
use std::path::Path;

/// Encode an RGBA image as PNG bytes.
pub fn encode_png(image: &RgbaImage) -> Result<Vec<u8>, ImageError> {
    let mut buf = Vec::new();
    PngEncoder::new(&mut buf).write_image(
        image.as_raw(),
        image.width(),
        image.height(),
        image::ColorType::Rgba8,
    )?;
    Ok(buf)
}

/// Encode an image as JPEG bytes.  Alpha is discarded.
pub fn encode_jpeg(image: &RgbaImage, quality: u8) -> Result<Vec<u8>, ImageError> {
    let rgb_image = DynamicImage::ImageRgba8(image.clone()).to_rgb8();
    let mut buf = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100));
    encoder.encode(
        rgb_image.as_raw(),
        rgb_image.width(),
        rgb_image.height(),
        image::ColorType::Rgb8,
    )?;
    Ok(buf)
}

/// Decode PNG/JPEG bytes into RGBA, sniffing the format.
pub fn decode_rgba(bytes: &[u8]) -> Result<RgbaImage, ImageError> {
    Ok(image::load_from_memory(bytes)?.into_rgba8())
}

pub fn decode_rgba_as(bytes: &[u8], format: ImageFormat) -> Result<RgbaImage, ImageError> {
    Ok(image::load_from_memory_with_format(bytes, format)?.into_rgba8())
}

/// Load an image file from disk as RGBA.
pub fn load_image(path: &Path) -> Result<RgbaImage, ImageError> {
    Ok(image::open(path)?.into_rgba8())
}

/// MIME type sniffed from magic bytes.
pub fn sniff_mime(bytes: &[u8]) -> &'static str {
    match image::guess_format(bytes) {
        Ok(ImageFormat::Png) => "image/png",
        Ok(ImageFormat::Jpeg) => "image/jpeg",
        Ok(ImageFormat::Gif) => "image/gif",
        Ok(ImageFormat::WebP) => "image/webp",
        Ok(ImageFormat::Bmp) => "image/bmp",
        Ok(ImageFormat::Tiff) => "image/tiff",
        _ => "application/octet-stream",
    }
}

/// Downscale so the longest edge is at most `max_edge`.  Images already
/// small enough are returned unchanged.
pub fn fit_within(image: &RgbaImage, max_edge: u32) -> RgbaImage {
    let (w, h) = image.dimensions();
    let longest = w.max(h);
    if longest <= max_edge || longest == 0 {
        return image.clone();
    }
    let scale = max_edge as f32 / longest as f32;
    let nw = ((w as f32 * scale).round() as u32).max(1);
    let nh = ((h as f32 * scale).round() as u32).max(1);
    image::imageops::resize(image, nw, nh, FilterType::Triangle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn png_is_lossless() {
        let mut img = RgbaImage::new(3, 2);
        img.put_pixel(1, 1, Rgba([10, 20, 30, 40]));
        let bytes = encode_png(&img).expect("png encodes");
        assert_eq!(sniff_mime(&bytes), "image/png");
        assert_eq!(decode_rgba(&bytes).expect("png decodes"), img);
    }

    #[test]
    fn jpeg_is_close_for_flat_colour() {
        let img = RgbaImage::from_pixel(16, 16, Rgba([120, 60, 200, 255]));
        let bytes = encode_jpeg(&img, 92).expect("jpeg encodes");
        assert_eq!(sniff_mime(&bytes), "image/jpeg");
        let back = decode_rgba(&bytes).expect("jpeg decodes");
        let p = back.get_pixel(8, 8);
        for c in 0..3 {
            assert!((p[c] as i32 - img.get_pixel(8, 8)[c] as i32).abs() <= 4);
        }
        assert_eq!(p[3], 255);
    }

    #[test]
    fn fit_within_keeps_aspect() {
        let img = RgbaImage::new(400, 100);
        let small = fit_within(&img, 128);
        assert_eq!(small.dimensions(), (128, 32));
        assert_eq!(sniff_mime(b"not an image"), "application/octet-stream");
    }
}
