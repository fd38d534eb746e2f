//! MBTiles source (C4a): a SQLite file following the MBTiles 1.3 schema.
//!
//! Also reused by [`crate::sources::cache`] (C5) for its underlying storage,
//! since the schema and tile-row addressing are identical.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::OpenFlags;

use crate::error::{Result, ServerError};
use crate::mercator::{flip_y, Bounds, GeoBounds};
use crate::sources::{GeoBoundsDto, SourceMetadata, SourceType, TileData, TileFormat, TileSource};

/// Pool of read-only connections to a single MBTiles file.
pub type MbtilesPool = Pool<SqliteConnectionManager>;

pub fn open_read_only_pool(path: &Path) -> Result<MbtilesPool> {
    let manager = SqliteConnectionManager::file(path)
        .with_flags(OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX);
    Pool::builder()
        .max_size(4)
        .build(manager)
        .map_err(|e| ServerError::BackendInit { backend: path.display().to_string(), reason: e.to_string() })
}

#[derive(Debug)]
pub struct MbtilesSource {
    pool: MbtilesPool,
    metadata: SourceMetadata,
    projected_bounds: Option<Bounds>,
}

impl MbtilesSource {
    pub async fn open(id: &str, path: &Path) -> Result<Self> {
        let path = path.to_path_buf();
        let id = id.to_string();
        let path_for_err = path.clone();
        tokio::task::spawn_blocking(move || Self::open_sync(&id, &path))
            .await
            .map_err(|e| ServerError::BackendInit { backend: path_display(&path_for_err), reason: e.to_string() })?
    }

    fn open_sync(id: &str, path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ServerError::BackendInit {
                backend: id.to_string(),
                reason: format!("mbtiles file not found: {}", path.display()),
            });
        }
        let pool = open_read_only_pool(path)?;
        let conn = pool.get().map_err(|e| ServerError::BackendInit { backend: id.to_string(), reason: e.to_string() })?;

        let read_meta = |key: &str| -> Option<String> {
            conn.query_row("SELECT value FROM metadata WHERE name = ?1", [key], |r| r.get::<_, String>(0)).ok()
        };

        let title = read_meta("name").unwrap_or_else(|| id.to_string());
        let format = read_meta("format")
            .and_then(|f| TileFormat::from_extension(&f))
            .ok_or_else(|| ServerError::BackendInit { backend: id.to_string(), reason: "missing or unknown metadata 'format'".into() })?;
        let min_zoom = read_meta("minzoom").and_then(|v| v.parse().ok()).unwrap_or(0);
        let max_zoom = read_meta("maxzoom").and_then(|v| v.parse().ok()).unwrap_or(22);
        let abstract_text = read_meta("description");

        let (geographical_bounds, projected_bounds) = match read_meta("bounds").and_then(|b| parse_bounds_csv(&b)) {
            Some(gb) => {
                let sw = crate::mercator::Bounds::new(
                    crate::mercator::lon_to_x(gb.min_lon),
                    crate::mercator::lat_to_y(gb.min_lat),
                    crate::mercator::lon_to_x(gb.max_lon),
                    crate::mercator::lat_to_y(gb.max_lat),
                );
                (Some(GeoBoundsDto::from(gb)), Some(sw))
            }
            None => (None, None),
        };

        let metadata = SourceMetadata {
            id: id.to_string(),
            source_type: SourceType::Mbtiles,
            title,
            abstract_text,
            format,
            content_type: format.content_type().to_string(),
            min_zoom,
            max_zoom,
            srs: "EPSG:3857".to_string(),
            geographical_bounds,
        };

        Ok(Self { pool, metadata, projected_bounds })
    }

    /// Used by the cache wrapper (C5) when laying out a fresh cache file.
    pub fn create_schema(conn: &rusqlite::Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS metadata (name TEXT, value TEXT);
             CREATE TABLE IF NOT EXISTS tiles (
                 zoom_level INTEGER, tile_column INTEGER, tile_row INTEGER, tile_data BLOB,
                 PRIMARY KEY (zoom_level, tile_column, tile_row)
             );",
        )
    }
}

#[async_trait]
impl TileSource for MbtilesSource {
    async fn get_tile(&self, x: u32, y: u32, z: u8) -> Result<Option<TileData>> {
        if z < self.metadata.min_zoom || z > self.metadata.max_zoom {
            return Ok(None);
        }
        let pool = self.pool.clone();
        let format = self.metadata.format;
        let tile_row = flip_y(y, z);
        let row: Option<(Vec<u8>, bool)> = tokio::task::spawn_blocking(move || -> Result<Option<(Vec<u8>, bool)>> {
            let conn = pool.get().map_err(|e| ServerError::Backend(e.to_string()))?;
            let data: Option<Vec<u8>> = conn
                .query_row(
                    "SELECT tile_data FROM tiles WHERE zoom_level = ?1 AND tile_column = ?2 AND tile_row = ?3",
                    rusqlite::params![z, x, tile_row],
                    |r| r.get(0),
                )
                .ok();
            Ok(data.map(|bytes| {
                let is_gzip = bytes.len() >= 2 && bytes[0] == 0x1f && bytes[1] == 0x8b;
                (bytes, is_gzip)
            }))
        })
        .await
        .map_err(|e| ServerError::Backend(e.to_string()))??;

        Ok(row.map(|(bytes, is_gzip)| {
            let data = Bytes::from(bytes);
            if is_gzip {
                TileData::gzip(data, format)
            } else {
                TileData::new(data, format)
            }
        }))
    }

    fn metadata(&self) -> &SourceMetadata {
        &self.metadata
    }

    fn projected_bounds(&self) -> Option<Bounds> {
        self.projected_bounds
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

fn parse_bounds_csv(s: &str) -> Option<GeoBounds> {
    let parts: Vec<f64> = s.split(',').filter_map(|p| p.trim().parse().ok()).collect();
    if parts.len() != 4 {
        return None;
    }
    Some(GeoBounds { min_lon: parts[0], min_lat: parts[1], max_lon: parts[2], max_lat: parts[3] })
}

fn path_display(p: &Path) -> String {
    p.display().to_string()
}

/// Convenience wrapper so other modules can build a source behind an `Arc`.
pub async fn open_arc(id: &str, path: &Path) -> Result<Arc<dyn TileSource>> {
    Ok(Arc::new(MbtilesSource::open(id, path).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn write_test_mbtiles(path: &Path) {
        let conn = Connection::open(path).unwrap();
        MbtilesSource::create_schema(&conn).unwrap();
        conn.execute("INSERT INTO metadata (name, value) VALUES ('name', 'world')", []).unwrap();
        conn.execute("INSERT INTO metadata (name, value) VALUES ('format', 'png')", []).unwrap();
        conn.execute("INSERT INTO metadata (name, value) VALUES ('minzoom', '0')", []).unwrap();
        conn.execute("INSERT INTO metadata (name, value) VALUES ('maxzoom', '0')", []).unwrap();
        conn.execute("INSERT INTO metadata (name, value) VALUES ('bounds', '-180,-85,180,85')", []).unwrap();
        conn.execute(
            "INSERT INTO tiles (zoom_level, tile_column, tile_row, tile_data) VALUES (0, 0, 0, ?1)",
            rusqlite::params![vec![1u8, 2, 3]],
        )
        .unwrap();
    }

    #[tokio::test]
    async fn reads_back_the_row_it_wrote_after_tms_flip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("world.mbtiles");
        write_test_mbtiles(&path);

        let source = MbtilesSource::open("world", &path).await.unwrap();
        // XYZ (0,0,0) maps to TMS row 0 at z=0, matching the row we inserted.
        let tile = source.get_tile(0, 0, 0).await.unwrap().unwrap();
        assert_eq!(tile.data.as_ref(), &[1, 2, 3]);
        assert!(!tile.gzip_encoded);
    }

    #[tokio::test]
    async fn missing_tile_is_ok_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("world.mbtiles");
        write_test_mbtiles(&path);

        let source = MbtilesSource::open("world", &path).await.unwrap();
        assert!(source.get_tile(5, 5, 3).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_file_is_a_backend_init_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.mbtiles");
        assert!(MbtilesSource::open("missing", &path).await.is_err());
    }
}
