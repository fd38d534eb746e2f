//! GeoTIFF tile synthesizer (C4g, §4.5): treats a single tiled GeoTIFF as a
//! zoom-agnostic EPSG:3857 raster source, reading only the source tiles that
//! cover each requested tile or `GetMap` region.

pub mod writer;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;
use tiff::decoder::{ChunkType, Decoder, DecodingResult};
use tiff::tags::Tag;

use crate::error::{Result, ServerError};
use crate::image_ops::{encode_jpeg, encode_png, Canvas};
use crate::mercator::{flip_y, lat_to_y, lon_to_x, tile_bounds, Bounds};
use crate::sources::{SourceMetadata, TileData, TileFormat, TileSource};

const GEO_KEY_DIRECTORY: u16 = 34735;
const GEO_DOUBLE_PARAMS: u16 = 34736;
const GEO_ASCII_PARAMS: u16 = 34737;
const MODEL_TIEPOINT: u16 = 33922;
const MODEL_PIXEL_SCALE: u16 = 33550;
const MODEL_TRANSFORMATION: u16 = 34264;

const KEY_GT_MODEL_TYPE: u64 = 1024;
const KEY_GEOGRAPHIC_TYPE: u64 = 2048;
const KEY_GEOG_ANGULAR_UNITS: u64 = 2054;
const KEY_PROJECTED_CS_TYPE: u64 = 3072;
const KEY_PROJ_LINEAR_UNITS: u64 = 3076;

const EPSG_WGS84: u64 = 4326;
const EPSG_WEB_MERCATOR: u64 = 3857;
const ANGULAR_UNIT_DEGREE: u64 = 9102;
const LINEAR_UNIT_METRE: u64 = 9001;

#[derive(Debug, Clone, Copy, FromPrimitive, PartialEq, Eq)]
enum ModelType {
    Projected = 1,
    Geographic = 2,
}

/// Parsed, validated georeferencing needed to place pixels in EPSG:3857.
#[derive(Debug, Clone)]
struct GeoReference {
    model_type: ModelType,
    /// Origin of pixel (0,0) in the file's native CRS (degrees if
    /// geographic, meters if already EPSG:3857).
    origin_x: f64,
    origin_y: f64,
    pixel_size_x: f64,
    pixel_size_y: f64,
    width: u32,
    height: u32,
}

impl GeoReference {
    /// Projected (EPSG:3857) bounds covering the whole raster.
    fn projected_bounds(&self) -> Bounds {
        let (left, top) = self.to_mercator(self.origin_x, self.origin_y);
        let (right, bottom) = self.to_mercator(
            self.origin_x + self.pixel_size_x * self.width as f64,
            self.origin_y - self.pixel_size_y * self.height as f64,
        );
        Bounds::new(left.min(right), bottom.min(top), left.max(right), bottom.max(top))
    }

    fn to_mercator(&self, x: f64, y: f64) -> (f64, f64) {
        match self.model_type {
            ModelType::Projected => (x, y),
            ModelType::Geographic => (lon_to_x(x), lat_to_y(y)),
        }
    }

    /// Maps an EPSG:3857 point to fractional pixel coordinates, top-left
    /// origin, row increasing downward (matching source pixel order).
    fn mercator_to_pixel(&self, mx: f64, my: f64) -> (f64, f64) {
        let (native_x, native_y) = match self.model_type {
            ModelType::Projected => (mx, my),
            ModelType::Geographic => (crate::mercator::x_to_lon(mx), crate::mercator::y_to_lat(my)),
        };
        let px = (native_x - self.origin_x) / self.pixel_size_x;
        let py = (self.origin_y - native_y) / self.pixel_size_y;
        (px, py)
    }
}

#[derive(Debug)]
pub struct GeoTiffSource {
    path: PathBuf,
    geo: GeoReference,
    metadata: SourceMetadata,
    jpeg_quality: u8,
}

impl GeoTiffSource {
    pub async fn open(id: &str, path: &Path, jpeg_quality: u8) -> Result<Self> {
        let path_buf = path.to_path_buf();
        let id = id.to_string();
        let geo = tokio::task::spawn_blocking({
            let path = path_buf.clone();
            let id = id.clone();
            move || parse_georeference(&path, &id)
        })
        .await
        .map_err(|e| ServerError::BackendInit { backend: id.clone(), reason: e.to_string() })??;

        let bounds_dto = crate::mercator::to_geo_bounds(&geo.projected_bounds());
        let metadata = SourceMetadata {
            id: id.clone(),
            source_type: crate::sources::SourceType::Geotiff,
            title: id.clone(),
            abstract_text: None,
            format: TileFormat::Png,
            content_type: TileFormat::Png.content_type().to_string(),
            min_zoom: 0,
            max_zoom: 22,
            srs: "EPSG:3857".to_string(),
            geographical_bounds: Some(bounds_dto.into()),
        };

        Ok(Self { path: path_buf, geo, metadata, jpeg_quality })
    }
}

fn parse_georeference(path: &Path, id: &str) -> Result<GeoReference> {
    let file = std::fs::File::open(path)
        .map_err(|e| ServerError::BackendInit { backend: id.to_string(), reason: e.to_string() })?;
    let mut decoder = Decoder::new(file)
        .map_err(|e| ServerError::BackendInit { backend: id.to_string(), reason: e.to_string() })?;

    let fail = |reason: String| ServerError::Format(format!("geotiff '{id}': {reason}"));

    if decoder.get_tag_u32(Tag::Unknown(MODEL_TRANSFORMATION)).is_ok() {
        return Err(fail("ModelTransformation tag present; only ModelTiePoint+ModelPixelScale rasters are supported".into()));
    }

    let tie_points = decoder
        .get_tag_f64_vec(Tag::Unknown(MODEL_TIEPOINT))
        .map_err(|e| fail(format!("missing ModelTiePointTag: {e}")))?;
    if tie_points.len() != 6 || tie_points[0] != 0.0 || tie_points[1] != 0.0 || tie_points[2] != 0.0 {
        return Err(fail("ModelTiePointTag must anchor raster pixel (0,0,0)".into()));
    }
    let origin_x = tie_points[3];
    let origin_y = tie_points[4];

    let pixel_scale = decoder
        .get_tag_f64_vec(Tag::Unknown(MODEL_PIXEL_SCALE))
        .map_err(|e| fail(format!("missing ModelPixelScaleTag: {e}")))?;
    if pixel_scale.len() < 2 {
        return Err(fail("ModelPixelScaleTag too short".into()));
    }

    let geo_keys = decoder
        .get_tag_u64_vec(Tag::Unknown(GEO_KEY_DIRECTORY))
        .map_err(|e| fail(format!("missing GeoKeyDirectoryTag: {e}")))?;
    if geo_keys.len() < 4 || geo_keys.len() % 4 != 0 {
        return Err(fail("GeoKeyDirectoryTag has invalid length".into()));
    }
    let double_params = decoder.get_tag_f64_vec(Tag::Unknown(GEO_DOUBLE_PARAMS)).unwrap_or_default();
    let _ascii_params = decoder.get_tag_ascii_string(Tag::Unknown(GEO_ASCII_PARAMS)).unwrap_or_default();

    let mut model_type: Option<ModelType> = None;
    let mut geographic_type: Option<u64> = None;
    let mut projected_type: Option<u64> = None;
    let mut angular_unit: Option<u64> = None;
    let mut linear_unit: Option<u64> = None;

    for row in geo_keys.chunks(4).skip(1) {
        let (key_id, location, _count, value) = (row[0], row[1], row[2], row[3]);
        let short_or_double = |v: u64, location: u64| -> f64 {
            if location == GEO_DOUBLE_PARAMS as u64 {
                double_params.get(v as usize).copied().unwrap_or(0.0)
            } else {
                v as f64
            }
        };
        match key_id {
            KEY_GT_MODEL_TYPE => model_type = ModelType::from_u64(value),
            KEY_GEOGRAPHIC_TYPE => geographic_type = Some(value),
            KEY_PROJECTED_CS_TYPE => projected_type = Some(value),
            KEY_GEOG_ANGULAR_UNITS => angular_unit = Some(value),
            KEY_PROJ_LINEAR_UNITS => linear_unit = Some(value),
            _ => {
                let _ = short_or_double(value, location);
            }
        }
    }

    let model_type = model_type.ok_or_else(|| fail("missing or unsupported GTModelTypeGeoKey".into()))?;
    match model_type {
        ModelType::Geographic => {
            if geographic_type != Some(EPSG_WGS84) {
                return Err(fail("GeographicTypeGeoKey must be EPSG:4326".into()));
            }
            if let Some(unit) = angular_unit {
                if unit != ANGULAR_UNIT_DEGREE {
                    return Err(fail("GeogAngularUnitsGeoKey must be degree".into()));
                }
            }
        }
        ModelType::Projected => {
            if projected_type != Some(EPSG_WEB_MERCATOR) {
                return Err(fail("ProjectedCSTypeGeoKey must be EPSG:3857".into()));
            }
            if let Some(unit) = linear_unit {
                if unit != LINEAR_UNIT_METRE {
                    return Err(fail("ProjLinearUnitsGeoKey must be metre".into()));
                }
            }
        }
    }

    if decoder.get_chunk_type() != ChunkType::Tile {
        return Err(fail("raster must use tiled layout; stripped GeoTIFFs are not supported".into()));
    }
    let planar_config = decoder.get_tag_u32(Tag::PlanarConfiguration).unwrap_or(1);
    if planar_config != 1 {
        return Err(fail("PlanarConfiguration must be contiguous (1); planar-separate rasters are not supported".into()));
    }

    let (width, height) =
        decoder.dimensions().map_err(|e| fail(format!("failed reading raster dimensions: {e}")))?;

    Ok(GeoReference {
        model_type,
        origin_x,
        origin_y,
        pixel_size_x: pixel_scale[0],
        pixel_size_y: pixel_scale[1],
        width,
        height,
    })
}

/// Half-open pixel-space rectangle in the raster's own grid, clamped to its
/// extent.
#[derive(Debug, Clone, Copy)]
struct PixelWindow {
    x0: u32,
    y0: u32,
    x1: u32,
    y1: u32,
}

/// A canvas holding the union of the source tiles covering a [`PixelWindow`],
/// plus the pixel offset of its top-left corner in the raster's own grid.
struct RasterWindow {
    canvas: Canvas,
    origin_x: u32,
    origin_y: u32,
}

impl RasterWindow {
    /// Samples at full-raster pixel coordinates `(px, py)`, or `None` if
    /// they fall outside the tiles that were actually read.
    fn sample(&self, px: f64, py: f64) -> Option<[u8; 4]> {
        let local_x = px - self.origin_x as f64;
        let local_y = py - self.origin_y as f64;
        if local_x < 0.0 || local_y < 0.0 || local_x >= self.canvas.width as f64 || local_y >= self.canvas.height as f64 {
            return None;
        }
        Some(crate::image_ops::bilinear_sample(&self.canvas, local_x, local_y))
    }
}

/// Computes the pixel-space rectangle covering `requested`, padded by one
/// pixel on each side so bilinear sampling near its edge never needs a
/// neighbor outside the window, and clamped to the raster extent.
fn pixel_window_for(geo: &GeoReference, requested: &Bounds) -> PixelWindow {
    let corners = [
        geo.mercator_to_pixel(requested.left, requested.top),
        geo.mercator_to_pixel(requested.right, requested.top),
        geo.mercator_to_pixel(requested.left, requested.bottom),
        geo.mercator_to_pixel(requested.right, requested.bottom),
    ];
    let min_x = corners.iter().map(|c| c.0).fold(f64::INFINITY, f64::min) - 1.0;
    let max_x = corners.iter().map(|c| c.0).fold(f64::NEG_INFINITY, f64::max) + 1.0;
    let min_y = corners.iter().map(|c| c.1).fold(f64::INFINITY, f64::min) - 1.0;
    let max_y = corners.iter().map(|c| c.1).fold(f64::NEG_INFINITY, f64::max) + 1.0;

    let clamp_x = |v: f64| v.max(0.0).min(geo.width as f64) as u32;
    let clamp_y = |v: f64| v.max(0.0).min(geo.height as f64) as u32;

    let x0 = clamp_x(min_x.floor());
    let y0 = clamp_y(min_y.floor());
    let x1 = clamp_x(max_x.ceil()).max(x0 + 1).min(geo.width);
    let y1 = clamp_y(max_y.ceil()).max(y0 + 1).min(geo.height);
    PixelWindow { x0, y0, x1, y1 }
}

/// Reads only the TIFF tiles whose pixel extents intersect `window` and
/// assembles them into a single tile-boundary-aligned canvas. The TIFF
/// library is not guaranteed thread-safe across threads, so every call opens
/// the file fresh inside `spawn_blocking`.
fn read_raster_window(path: &Path, id: &str, window: PixelWindow) -> Result<RasterWindow> {
    let file = std::fs::File::open(path)
        .map_err(|e| ServerError::Backend(format!("geotiff '{id}': reopen failed: {e}")))?;
    let mut decoder =
        Decoder::new(file).map_err(|e| ServerError::Backend(format!("geotiff '{id}': {e}")))?;
    let (width, height) =
        decoder.dimensions().map_err(|e| ServerError::Backend(format!("geotiff '{id}': {e}")))?;
    let color_type =
        decoder.colortype().map_err(|e| ServerError::Backend(format!("geotiff '{id}': {e}")))?;
    let samples_per_pixel: usize = match color_type {
        tiff::ColorType::RGB(_) => 3,
        tiff::ColorType::RGBA(_) => 4,
        tiff::ColorType::Gray(_) => 1,
        other => return Err(ServerError::Format(format!("geotiff '{id}': unsupported color type {other:?}"))),
    };

    let (tile_width, tile_height) = decoder.chunk_dimensions();
    let tiles_across = width.div_ceil(tile_width);
    let tiles_down = height.div_ceil(tile_height);

    let col_start = window.x0 / tile_width;
    let col_end = ((window.x1 - 1) / tile_width).min(tiles_across.saturating_sub(1));
    let row_start = window.y0 / tile_height;
    let row_end = ((window.y1 - 1) / tile_height).min(tiles_down.saturating_sub(1));

    let origin_x = col_start * tile_width;
    let origin_y = row_start * tile_height;
    let out_width = ((col_end - col_start + 1) * tile_width).min(width - origin_x);
    let out_height = ((row_end - row_start + 1) * tile_height).min(height - origin_y);

    let mut out = Canvas::new(out_width, out_height, [0, 0, 0, 0]);

    for row in row_start..=row_end {
        for col in col_start..=col_end {
            let chunk_index = row * tiles_across + col;
            let chunk = decoder
                .read_chunk(chunk_index)
                .map_err(|e| ServerError::Backend(format!("geotiff '{id}': failed reading tile {chunk_index}: {e}")))?;
            let (chunk_width, chunk_height) = decoder.chunk_data_dimensions(chunk_index);
            let bytes: Vec<u8> = match chunk {
                DecodingResult::U8(v) => v,
                DecodingResult::U16(v) => v.into_iter().map(|p| (p >> 8) as u8).collect(),
                other => return Err(ServerError::Format(format!("geotiff '{id}': unsupported sample format {other:?}"))),
            };

            let tile_origin_x = col * tile_width;
            let tile_origin_y = row * tile_height;
            for ty in 0..chunk_height {
                let dest_y = tile_origin_y + ty;
                if dest_y < origin_y || dest_y >= origin_y + out_height {
                    continue;
                }
                for tx in 0..chunk_width {
                    let dest_x = tile_origin_x + tx;
                    if dest_x < origin_x || dest_x >= origin_x + out_width {
                        continue;
                    }
                    let idx = (ty * chunk_width + tx) as usize * samples_per_pixel;
                    let sample = &bytes[idx..idx + samples_per_pixel];
                    let rgba = match samples_per_pixel {
                        1 => [sample[0], sample[0], sample[0], 255],
                        3 => [sample[0], sample[1], sample[2], 255],
                        4 => [sample[0], sample[1], sample[2], sample[3]],
                        _ => unreachable!(),
                    };
                    out.set(dest_x - origin_x, dest_y - origin_y, crate::image_ops::premultiply(rgba));
                }
            }
        }
    }

    Ok(RasterWindow { canvas: out, origin_x, origin_y })
}

#[async_trait]
impl TileSource for GeoTiffSource {
    async fn get_tile(&self, x: u32, y: u32, z: u8) -> Result<Option<TileData>> {
        if z < self.metadata.min_zoom || z > self.metadata.max_zoom {
            return Ok(None);
        }
        let requested = tile_bounds(x, flip_y(y, z), z);
        if !requested.intersects(&self.geo.projected_bounds()) {
            return Ok(None);
        }

        let path = self.path.clone();
        let id = self.metadata.id.clone();
        let geo = self.geo.clone();
        let jpeg_quality = self.jpeg_quality;
        let format = self.metadata.format;

        let out_canvas = tokio::task::spawn_blocking(move || -> Result<Canvas> {
            let window = pixel_window_for(&geo, &requested);
            let raster = read_raster_window(&path, &id, window)?;
            Ok(synthesize_tile(&raster, &geo, &requested))
        })
        .await
        .map_err(|e| ServerError::Backend(e.to_string()))??;

        let encoded = match format {
            TileFormat::Jpg => encode_jpeg(&out_canvas, jpeg_quality)?,
            _ => encode_png(&out_canvas)?,
        };
        Ok(Some(TileData::new(encoded, format)))
    }

    fn metadata(&self) -> &SourceMetadata {
        &self.metadata
    }

    fn projected_bounds(&self) -> Option<Bounds> {
        Some(self.geo.projected_bounds())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl GeoTiffSource {
    /// In-process fast path for the WMS compositor (§4.6 step 2): renders
    /// the raster directly into an output image sized exactly to the
    /// requested bbox, skipping the tile-grid indirection.
    pub async fn get_image_part(&self, width: u32, height: u32, bbox: &Bounds) -> Result<Option<Canvas>> {
        if !bbox.intersects(&self.geo.projected_bounds()) {
            return Ok(None);
        }
        let path = self.path.clone();
        let id = self.metadata.id.clone();
        let geo = self.geo.clone();
        let bbox = *bbox;

        let canvas = tokio::task::spawn_blocking(move || -> Result<Canvas> {
            let window = pixel_window_for(&geo, &bbox);
            let raster = read_raster_window(&path, &id, window)?;
            Ok(synthesize_region(&raster, &geo, &bbox, width, height))
        })
        .await
        .map_err(|e| ServerError::Backend(e.to_string()))??;

        Ok(Some(canvas))
    }
}

/// Draws a `width x height` output image for `requested` (EPSG:3857 bounds)
/// by bilinear-sampling `window`, mapping output pixel centers through
/// `geo.mercator_to_pixel`. Pixels outside the window sample as transparent.
fn synthesize_region(window: &RasterWindow, geo: &GeoReference, requested: &Bounds, width: u32, height: u32) -> Canvas {
    let mut out = Canvas::new(width, height, [0, 0, 0, 0]);
    let step_x = requested.width() / width as f64;
    let step_y = requested.height() / height as f64;

    for row in 0..height {
        let my = requested.top - (row as f64 + 0.5) * step_y;
        for col in 0..width {
            let mx = requested.left + (col as f64 + 0.5) * step_x;
            let (px, py) = geo.mercator_to_pixel(mx, my);
            if let Some(sample) = window.sample(px, py) {
                out.set(col, row, sample);
            }
        }
    }
    out
}

fn synthesize_tile(window: &RasterWindow, geo: &GeoReference, requested: &Bounds) -> Canvas {
    synthesize_region(window, geo, requested, 256, 256)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_geo(width: u32, height: u32) -> GeoReference {
        GeoReference {
            model_type: ModelType::Projected,
            origin_x: -100.0,
            origin_y: 100.0,
            pixel_size_x: 1.0,
            pixel_size_y: 1.0,
            width,
            height,
        }
    }

    #[test]
    fn projected_bounds_match_origin_and_pixel_size() {
        let geo = flat_geo(200, 200);
        let bounds = geo.projected_bounds();
        assert!((bounds.left - (-100.0)).abs() < 1e-9);
        assert!((bounds.top - 100.0).abs() < 1e-9);
        assert!((bounds.right - 100.0).abs() < 1e-9);
        assert!((bounds.bottom - (-100.0)).abs() < 1e-9);
    }

    #[test]
    fn synthesize_tile_fills_fully_covered_area() {
        let geo = flat_geo(256, 256);
        let window = RasterWindow { canvas: Canvas::new(256, 256, [10, 20, 30, 255]), origin_x: 0, origin_y: 0 };
        let requested = Bounds::new(-100.0, -100.0, 100.0, 100.0);
        let out = synthesize_tile(&window, &geo, &requested);
        let center = out.get(128, 128);
        assert_eq!(center, crate::image_ops::premultiply([10, 20, 30, 255]));
    }

    #[test]
    fn pixel_window_clamps_to_raster_extent_and_pads_by_one() {
        let geo = flat_geo(256, 256);
        let requested = Bounds::new(-100.0, -100.0, 100.0, 100.0);
        let window = pixel_window_for(&geo, &requested);
        assert_eq!(window.x0, 0);
        assert_eq!(window.y0, 0);
        assert_eq!(window.x1, 256);
        assert_eq!(window.y1, 256);
    }
}
