//! WMS `GetMap` compositor (C6, §4.6): stitches one or more registered
//! sources into an arbitrary bounding-box image.

use std::sync::Arc;

use crate::error::{Result, ServerError};
use crate::image_ops::{bilinear_sample, decode_to_canvas, encode_jpeg, encode_png, encode_tiff, Canvas};
use crate::mercator::{mercator_tile_coordinates, tile_bounds, tile_count, Bounds, EARTH_RADIUS, TILE_SIZE};
use crate::sources::{SourceType, TileFormat, TileSource};

const MAX_DIMENSION: u32 = 32768;
const EARTH_CIRCUMFERENCE: f64 = 2.0 * std::f64::consts::PI * EARTH_RADIUS;

pub struct GetMapRequest<'a> {
    pub width: u32,
    pub height: u32,
    pub bbox: Bounds,
    pub layer_names: &'a [String],
    pub format: TileFormat,
    pub transparent: bool,
    pub bgcolor: Option<&'a str>,
}

pub struct GetMapOutput {
    pub bytes: Vec<u8>,
    pub content_type: &'static str,
}

pub fn validate(req: &GetMapRequest) -> Result<()> {
    if req.width == 0 || req.width > MAX_DIMENSION || req.height == 0 || req.height > MAX_DIMENSION {
        return Err(ServerError::Protocol(format!("width/height must be in [1, {MAX_DIMENSION}]")));
    }
    if !matches!(req.format, TileFormat::Png | TileFormat::Jpg | TileFormat::Tiff) {
        return Err(ServerError::Protocol("format must be image/png, image/jpeg, or image/tiff".into()));
    }
    if !(req.bbox.left.is_finite() && req.bbox.bottom.is_finite() && req.bbox.right.is_finite() && req.bbox.top.is_finite()) {
        return Err(ServerError::Protocol("bbox must contain finite coordinates".into()));
    }
    if req.bbox.left >= req.bbox.right || req.bbox.bottom >= req.bbox.top {
        return Err(ServerError::Protocol("bbox must satisfy minX<maxX and minY<maxY".into()));
    }
    if req.layer_names.is_empty() {
        return Err(ServerError::Protocol("LAYERS must not be empty".into()));
    }
    Ok(())
}

/// Renders a `GetMap` response. Unknown layer names are silently skipped
/// (§9); a present layer that fails mid-fetch aborts the whole response.
pub async fn get_map(
    req: GetMapRequest<'_>,
    resolve_source: impl Fn(&str) -> Option<Arc<dyn TileSource>>,
    jpeg_quality: u8,
) -> Result<GetMapOutput> {
    validate(&req)?;

    let bg = crate::image_ops::parse_bgcolor(req.bgcolor, req.transparent);
    let mut canvas = Canvas::new(req.width, req.height, bg);

    for layer_name in req.layer_names {
        let Some(source) = resolve_source(layer_name) else {
            continue;
        };
        render_layer(&mut canvas, &req.bbox, source.as_ref()).await?;
    }

    let bytes = match req.format {
        TileFormat::Png => encode_png(&canvas)?,
        TileFormat::Jpg => encode_jpeg(&canvas, jpeg_quality)?,
        TileFormat::Tiff => encode_tiff(&canvas)?,
        other => return Err(ServerError::Protocol(format!("unsupported GetMap format {other:?}"))),
    };

    Ok(GetMapOutput { bytes, content_type: req.format.content_type() })
}

async fn render_layer(canvas: &mut Canvas, bbox: &Bounds, source: &dyn TileSource) -> Result<()> {
    if source.metadata().source_type == SourceType::Geotiff {
        if let Some(geotiff) = source.as_any().downcast_ref::<crate::sources::geotiff::GeoTiffSource>() {
            return render_geotiff_layer(canvas, bbox, geotiff).await;
        }
    }
    render_tiled_layer(canvas, bbox, source).await
}

async fn render_geotiff_layer(
    canvas: &mut Canvas,
    bbox: &Bounds,
    geotiff: &crate::sources::geotiff::GeoTiffSource,
) -> Result<()> {
    let Some(sub_image) = geotiff.get_image_part(canvas.width, canvas.height, bbox).await? else {
        return Ok(());
    };
    for y in 0..canvas.height {
        for x in 0..canvas.width {
            canvas.blend(x, y, sub_image.get(x, y));
        }
    }
    Ok(())
}

async fn render_tiled_layer(canvas: &mut Canvas, bbox: &Bounds, source: &dyn TileSource) -> Result<()> {
    let meta = source.metadata();
    let zoom = choose_zoom(canvas.width, bbox, meta.min_zoom, meta.max_zoom);
    let n = tile_count(zoom);

    for tile in mercator_tile_coordinates(bbox, zoom) {
        let x = tile.x % n;
        let Some(tile_data) = source.get_tile(x, tile.y, zoom).await? else {
            continue;
        };
        if tile_data.format == TileFormat::Pbf {
            continue; // vector tiles have no pixel representation to composite here
        }
        let tile_canvas = decode_to_canvas(&tile_data.data)?;
        let tile_proj_bounds = tile_bounds(x, tile.y, zoom);
        blit_tile(canvas, bbox, &tile_canvas, &tile_proj_bounds);
    }
    Ok(())
}

/// `zoom` such that one source tile maps to roughly one output pixel along
/// the longer axis of the requested bbox.
fn choose_zoom(width: u32, bbox: &Bounds, min_zoom: u8, max_zoom: u8) -> u8 {
    let zoom = (width as f64 / (bbox.width() * TILE_SIZE / EARTH_CIRCUMFERENCE)).log2();
    (zoom.round() as i32).clamp(min_zoom as i32, max_zoom as i32) as u8
}

/// Maps every output pixel covered by `tile_bounds_proj` to a source pixel in
/// `tile_canvas`, bilinear-sampling and alpha-blending it onto `canvas`.
fn blit_tile(canvas: &mut Canvas, output_bbox: &Bounds, tile_canvas: &Canvas, tile_bounds_proj: &Bounds) {
    let px_per_meter_x = canvas.width as f64 / output_bbox.width();
    let px_per_meter_y = canvas.height as f64 / output_bbox.height();

    let out_x0 = ((tile_bounds_proj.left - output_bbox.left) * px_per_meter_x).floor().max(0.0) as u32;
    let out_x1 = (((tile_bounds_proj.right - output_bbox.left) * px_per_meter_x).ceil() as i64)
        .clamp(0, canvas.width as i64) as u32;
    let out_y0 = (((output_bbox.top - tile_bounds_proj.top) * px_per_meter_y).floor().max(0.0)) as u32;
    let out_y1 = (((output_bbox.top - tile_bounds_proj.bottom) * px_per_meter_y).ceil() as i64)
        .clamp(0, canvas.height as i64) as u32;

    for out_y in out_y0..out_y1 {
        let merc_y = output_bbox.top - (out_y as f64 + 0.5) / px_per_meter_y;
        for out_x in out_x0..out_x1 {
            let merc_x = output_bbox.left + (out_x as f64 + 0.5) / px_per_meter_x;
            let sx = (merc_x - tile_bounds_proj.left) / tile_bounds_proj.width() * tile_canvas.width as f64;
            let sy = (tile_bounds_proj.top - merc_y) / tile_bounds_proj.height() * tile_canvas.height as f64;
            if sx < 0.0 || sy < 0.0 || sx >= tile_canvas.width as f64 || sy >= tile_canvas.height as f64 {
                continue;
            }
            let sample = bilinear_sample(tile_canvas, sx, sy);
            canvas.blend(out_x, out_y, sample);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_oversized_dimensions() {
        let req = GetMapRequest {
            width: 100000,
            height: 100,
            bbox: Bounds::new(0.0, 0.0, 1.0, 1.0),
            layer_names: &["a".to_string()],
            format: TileFormat::Png,
            transparent: false,
            bgcolor: None,
        };
        assert!(validate(&req).is_err());
    }

    #[test]
    fn rejects_inverted_bbox() {
        let req = GetMapRequest {
            width: 256,
            height: 256,
            bbox: Bounds::new(10.0, 0.0, 0.0, 1.0),
            layer_names: &["a".to_string()],
            format: TileFormat::Png,
            transparent: false,
            bgcolor: None,
        };
        assert!(validate(&req).is_err());
    }

    #[test]
    fn rejects_empty_layer_list() {
        let req = GetMapRequest {
            width: 256,
            height: 256,
            bbox: Bounds::new(0.0, 0.0, 1.0, 1.0),
            layer_names: &[],
            format: TileFormat::Png,
            transparent: false,
            bgcolor: None,
        };
        assert!(validate(&req).is_err());
    }

    #[test]
    fn choose_zoom_clamps_to_source_range() {
        let bbox = Bounds::new(-EARTH_CIRCUMFERENCE / 2.0, -EARTH_CIRCUMFERENCE / 2.0, EARTH_CIRCUMFERENCE / 2.0, EARTH_CIRCUMFERENCE / 2.0);
        assert_eq!(choose_zoom(256, &bbox, 3, 18), 3);
    }
}
