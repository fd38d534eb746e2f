//! Source abstraction (C2/C3): a typed source configuration, the uniform
//! `TileSource` contract every backend implements, and the format/metadata
//! types shared by all of them.

pub mod cache;
pub mod fs;
pub mod geotiff;
pub mod http_tile;
pub mod manager;
pub mod mbtiles;
#[cfg(feature = "postgis")]
pub mod postgis;
pub mod wms_source;

pub use manager::SourceManager;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::mercator::{Bounds, GeoBounds};

/// `type` discriminant of a [`SourceConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Mbtiles,
    File,
    Xyz,
    Tms,
    Wmts,
    Wms,
    Postgis,
    Geotiff,
}

/// Encoded tile/vector-tile payload format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TileFormat {
    Png,
    #[serde(alias = "jpeg")]
    Jpg,
    Pbf,
    Webp,
    Tiff,
}

impl TileFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            TileFormat::Png => "image/png",
            TileFormat::Jpg => "image/jpeg",
            TileFormat::Pbf => "application/vnd.mapbox-vector-tile",
            TileFormat::Webp => "image/webp",
            TileFormat::Tiff => "image/tiff",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "png" => Some(TileFormat::Png),
            "jpg" | "jpeg" => Some(TileFormat::Jpg),
            "pbf" | "mvt" => Some(TileFormat::Pbf),
            "webp" => Some(TileFormat::Webp),
            "tif" | "tiff" => Some(TileFormat::Tiff),
            _ => None,
        }
    }
}

/// How a cache-wrapped source file is addressed. Only `mbtiles` is
/// implemented (C5); the tag exists so config JSON stays self-describing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum CacheConfig {
    Mbtiles { dbfile: String },
}

/// PostGIS table/geometry/fields backend-specific block (C4f).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgisTableConfig {
    pub table: String,
    pub geometry: String,
    #[serde(default)]
    pub fields: Vec<String>,
}

/// Typed description of a source and its caching policy (C2). Backend
/// specific fields are optional and only meaningful for their matching
/// `source_type`; this mirrors the single tagged-record shape described for
/// the JSON config rather than a per-backend enum variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub source_type: SourceType,
    pub title: Option<String>,
    #[serde(rename = "abstract")]
    pub abstract_text: Option<String>,
    pub location: String,
    pub format: Option<TileFormat>,
    pub content_type: Option<String>,
    pub min_zoom: Option<u8>,
    pub max_zoom: Option<u8>,
    pub srs: Option<String>,
    #[serde(default)]
    pub tms: bool,
    #[serde(default)]
    pub cache: Option<CacheConfig>,
    /// WMTS: optional GetCapabilities URL probed at init.
    pub capabilities_url: Option<String>,
    /// PostGIS table/geometry/fields.
    pub postgis: Option<PostgisTableConfig>,
    /// PostGIS connection string. Kept separate from `location` so the
    /// "local path or URL template" invariant on `location` doesn't have to
    /// be stretched to also mean "DSN".
    pub connection_string: Option<String>,
    /// Per-backend request timeout override; falls back to the service
    /// default (§5) when absent.
    pub request_timeout_secs: Option<u64>,
}

/// Post-init record re-emitted with inferred fields filled in, per §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceMetadata {
    pub id: String,
    pub source_type: SourceType,
    pub title: String,
    pub abstract_text: Option<String>,
    pub format: TileFormat,
    pub content_type: String,
    pub min_zoom: u8,
    pub max_zoom: u8,
    pub srs: String,
    pub geographical_bounds: Option<GeoBoundsDto>,
}

/// Serializable mirror of [`GeoBounds`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GeoBoundsDto {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl From<GeoBounds> for GeoBoundsDto {
    fn from(b: GeoBounds) -> Self {
        Self { min_lon: b.min_lon, min_lat: b.min_lat, max_lon: b.max_lon, max_lat: b.max_lat }
    }
}

/// A decoded-but-still-encoded tile payload returned by `get_tile`: the raw
/// bytes plus enough metadata for the dispatcher to set response headers.
#[derive(Debug, Clone)]
pub struct TileData {
    pub data: Bytes,
    pub format: TileFormat,
    /// Set when the payload is already gzip-compressed (MBTiles `pbf` rows)
    /// so the dispatcher forwards `Content-Encoding: gzip` instead of
    /// re-compressing, or worse, double-gzipping.
    pub gzip_encoded: bool,
}

impl TileData {
    pub fn new(data: impl Into<Bytes>, format: TileFormat) -> Self {
        Self { data: data.into(), format, gzip_encoded: false }
    }

    pub fn gzip(data: impl Into<Bytes>, format: TileFormat) -> Self {
        Self { data: data.into(), format, gzip_encoded: true }
    }
}

/// Uniform contract every backend implements (C3 §4.2). `Init`-time I/O
/// (opening a database, probing an HTTP endpoint, parsing a GeoTIFF header)
/// happens in each backend's async constructor, before the handle is boxed
/// and inserted into the registry -- there is deliberately no separate
/// `init()` method on the trait object, since by the time anything holds a
/// `dyn TileSource` it has already passed that step once.
#[async_trait]
pub trait TileSource: Send + Sync + std::fmt::Debug {
    /// `Ok(None)` when `z` is out of range or the tile is legitimately
    /// absent; `Err` only for unexpected backend failure.
    async fn get_tile(&self, x: u32, y: u32, z: u8) -> Result<Option<TileData>>;

    fn metadata(&self) -> &SourceMetadata;

    /// Projected bounds of the source's data, when known. Used by the WMS
    /// compositor to decide whether a source can possibly cover a bbox.
    fn projected_bounds(&self) -> Option<Bounds> {
        None
    }

    /// Downcast hook for backend-specific extended behavior -- the GeoTIFF
    /// compositor fast path needs this to call `get_image_part` without
    /// threading a new enum variant through every other backend.
    fn as_any(&self) -> &dyn std::any::Any;
}
