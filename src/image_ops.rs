//! Image helpers (C7): decode/encode PNG/JPEG into premultiplied RGBA8888,
//! background-color parsing, and a minimal raw TIFF writer.

use image::{DynamicImage, GenericImageView, ImageEncoder, RgbaImage};

use crate::error::{Result, ServerError};

/// A premultiplied-alpha RGBA8888 canvas. Blending and resampling happen in
/// this space so alpha compositing stays simple and fast.
#[derive(Clone)]
pub struct Canvas {
    pub width: u32,
    pub height: u32,
    /// Premultiplied RGBA, row-major, top-to-bottom.
    pub pixels: Vec<[u8; 4]>,
}

impl Canvas {
    pub fn new(width: u32, height: u32, bg: [u8; 4]) -> Self {
        Self { width, height, pixels: vec![premultiply(bg); (width as usize) * (height as usize)] }
    }

    #[inline]
    fn idx(&self, x: u32, y: u32) -> usize {
        (y as usize) * (self.width as usize) + (x as usize)
    }

    pub fn get(&self, x: u32, y: u32) -> [u8; 4] {
        self.pixels[self.idx(x, y)]
    }

    pub fn set(&mut self, x: u32, y: u32, p: [u8; 4]) {
        let i = self.idx(x, y);
        self.pixels[i] = p;
    }

    /// Back-to-front "over" blend of an already-premultiplied source pixel.
    pub fn blend(&mut self, x: u32, y: u32, src: [u8; 4]) {
        let dst = self.get(x, y);
        let inv_a = 255 - src[3] as u32;
        let out = [
            (src[0] as u32 + dst[0] as u32 * inv_a / 255) as u8,
            (src[1] as u32 + dst[1] as u32 * inv_a / 255) as u8,
            (src[2] as u32 + dst[2] as u32 * inv_a / 255) as u8,
            (src[3] as u32 + dst[3] as u32 * inv_a / 255) as u8,
        ];
        self.set(x, y, out);
    }

    /// Converts to a straight-alpha `image::RgbaImage` for encoding.
    pub fn to_rgba_image(&self) -> RgbaImage {
        let mut img = RgbaImage::new(self.width, self.height);
        for y in 0..self.height {
            for x in 0..self.width {
                let p = unpremultiply(self.get(x, y));
                img.put_pixel(x, y, image::Rgba(p));
            }
        }
        img
    }
}

pub fn premultiply(p: [u8; 4]) -> [u8; 4] {
    let a = p[3] as u32;
    [
        (p[0] as u32 * a / 255) as u8,
        (p[1] as u32 * a / 255) as u8,
        (p[2] as u32 * a / 255) as u8,
        p[3],
    ]
}

pub fn unpremultiply(p: [u8; 4]) -> [u8; 4] {
    if p[3] == 0 {
        return [0, 0, 0, 0];
    }
    let a = p[3] as u32;
    [
        ((p[0] as u32 * 255) / a).min(255) as u8,
        ((p[1] as u32 * 255) / a).min(255) as u8,
        ((p[2] as u32 * 255) / a).min(255) as u8,
        p[3],
    ]
}

/// Decodes PNG/JPEG/WEBP bytes into a premultiplied RGBA [`Canvas`].
pub fn decode_to_canvas(bytes: &[u8]) -> Result<Canvas> {
    let img = image::load_from_memory(bytes).map_err(|e| ServerError::Format(e.to_string()))?;
    Ok(dynamic_image_to_canvas(&img))
}

pub fn dynamic_image_to_canvas(img: &DynamicImage) -> Canvas {
    let (w, h) = img.dimensions();
    let rgba = img.to_rgba8();
    let mut pixels = Vec::with_capacity((w * h) as usize);
    for p in rgba.pixels() {
        pixels.push(premultiply(p.0));
    }
    Canvas { width: w, height: h, pixels }
}

/// Samples `canvas` at a fractional source coordinate with bilinear
/// filtering; coordinates outside `[0, width)x[0, height)` clamp to the edge.
pub fn bilinear_sample(canvas: &Canvas, sx: f64, sy: f64) -> [u8; 4] {
    let sx = sx.clamp(0.0, (canvas.width - 1) as f64);
    let sy = sy.clamp(0.0, (canvas.height - 1) as f64);
    let x0 = sx.floor() as u32;
    let y0 = sy.floor() as u32;
    let x1 = (x0 + 1).min(canvas.width - 1);
    let y1 = (y0 + 1).min(canvas.height - 1);
    let fx = sx - x0 as f64;
    let fy = sy - y0 as f64;

    let p00 = canvas.get(x0, y0);
    let p10 = canvas.get(x1, y0);
    let p01 = canvas.get(x0, y1);
    let p11 = canvas.get(x1, y1);

    let mut out = [0u8; 4];
    for c in 0..4 {
        let top = p00[c] as f64 * (1.0 - fx) + p10[c] as f64 * fx;
        let bottom = p01[c] as f64 * (1.0 - fx) + p11[c] as f64 * fx;
        out[c] = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    }
    out
}

/// Encodes a canvas as PNG (lossless).
pub fn encode_png(canvas: &Canvas) -> Result<Vec<u8>> {
    let img = canvas.to_rgba_image();
    let mut out = Vec::new();
    image::codecs::png::PngEncoder::new(&mut out)
        .write_image(img.as_raw(), canvas.width, canvas.height, image::ExtendedColorType::Rgba8)
        .map_err(|e| ServerError::Format(e.to_string()))?;
    Ok(out)
}

/// Encodes a canvas as JPEG at `quality` (1-100). JPEG carries no alpha, so
/// the canvas is first flattened onto opaque black.
pub fn encode_jpeg(canvas: &Canvas, quality: u8) -> Result<Vec<u8>> {
    let img = canvas.to_rgba_image();
    let rgb = DynamicImage::ImageRgba8(img).to_rgb8();
    let mut out = Vec::new();
    image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality)
        .encode(rgb.as_raw(), canvas.width, canvas.height, image::ExtendedColorType::Rgb8)
        .map_err(|e| ServerError::Format(e.to_string()))?;
    Ok(out)
}

/// Emits an uncompressed, one-strip, little-endian RGBA TIFF per §4.7.
pub fn encode_tiff(canvas: &Canvas) -> Result<Vec<u8>> {
    let img = canvas.to_rgba_image();
    crate::sources::geotiff::writer::write_rgba_tiff(canvas.width, canvas.height, img.as_raw())
}

/// Parses a background color from `#RRGGBB`, `0xAARRGGBB`, or `white`/`black`.
/// Alpha defaults to 0 when `transparent` is requested, else 255.
pub fn parse_bgcolor(spec: Option<&str>, transparent: bool) -> [u8; 4] {
    let default_alpha = if transparent { 0 } else { 255 };
    let Some(spec) = spec else {
        return [255, 255, 255, default_alpha];
    };
    let spec = spec.trim();
    if let Some(hex) = spec.strip_prefix("0x").or_else(|| spec.strip_prefix("0X")) {
        if hex.len() == 8 {
            if let Ok(v) = u32::from_str_radix(hex, 16) {
                let a = ((v >> 24) & 0xFF) as u8;
                let r = ((v >> 16) & 0xFF) as u8;
                let g = ((v >> 8) & 0xFF) as u8;
                let b = (v & 0xFF) as u8;
                return [r, g, b, a];
            }
        }
    }
    if let Some(hex) = spec.strip_prefix('#') {
        if hex.len() == 6 {
            if let Ok(v) = u32::from_str_radix(hex, 16) {
                let r = ((v >> 16) & 0xFF) as u8;
                let g = ((v >> 8) & 0xFF) as u8;
                let b = (v & 0xFF) as u8;
                return [r, g, b, default_alpha];
            }
        }
    }
    match spec.to_ascii_lowercase().as_str() {
        "white" => [255, 255, 255, default_alpha],
        "black" => [0, 0, 0, default_alpha],
        _ => [255, 255, 255, default_alpha],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn premultiply_round_trips_opaque() {
        let p = [200, 100, 50, 255];
        assert_eq!(unpremultiply(premultiply(p)), p);
    }

    #[test]
    fn premultiply_zero_alpha_is_transparent_black() {
        assert_eq!(premultiply([10, 20, 30, 0]), [0, 0, 0, 0]);
    }

    #[test]
    fn parse_bgcolor_hex_rgb() {
        assert_eq!(parse_bgcolor(Some("#ff0000"), false), [255, 0, 0, 255]);
    }

    #[test]
    fn parse_bgcolor_argb_hex() {
        assert_eq!(parse_bgcolor(Some("0x80112233"), false), [0x11, 0x22, 0x33, 0x80]);
    }

    #[test]
    fn parse_bgcolor_named_defaults_transparent_when_requested() {
        assert_eq!(parse_bgcolor(Some("white"), true), [255, 255, 255, 0]);
    }

    #[test]
    fn bilinear_sample_at_pixel_center_matches_exact_value() {
        let canvas = Canvas { width: 2, height: 2, pixels: vec![[10, 0, 0, 255], [20, 0, 0, 255], [30, 0, 0, 255], [40, 0, 0, 255]] };
        assert_eq!(bilinear_sample(&canvas, 0.0, 0.0), [10, 0, 0, 255]);
    }
}
