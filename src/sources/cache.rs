//! Read-through MBTiles cache wrapper (C5, §4.4): wraps any other
//! [`TileSource`] and persists fetched tiles to a local MBTiles file,
//! single-flighting concurrent requests for the same tile.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex as AsyncMutex};

use crate::error::{Result, ServerError};
use crate::mercator::{flip_y, Bounds};
use crate::sources::mbtiles::{open_read_only_pool, MbtilesPool, MbtilesSource};
use crate::sources::{SourceMetadata, TileData, TileSource};

type PendingKey = (u8, u32, u32);

/// Outcome broadcast to every requester waiting on the same in-flight fetch.
/// `Result<TileData>` isn't `Clone`, so the payload is flattened to its parts.
#[derive(Clone)]
struct FetchOutcome {
    data: Option<Vec<u8>>,
    gzip_encoded: bool,
    error: Option<String>,
}

#[derive(Debug)]
pub struct CachedSource {
    inner: Arc<dyn TileSource>,
    cache_pool: MbtilesPool,
    write_lock: AsyncMutex<()>,
    pending: AsyncMutex<HashMap<PendingKey, broadcast::Sender<FetchOutcome>>>,
}

impl CachedSource {
    pub async fn wrap(inner: Arc<dyn TileSource>, dbfile: &Path) -> Result<Self> {
        let dbfile = dbfile.to_path_buf();
        ensure_schema(&dbfile).await?;
        let cache_pool = open_read_only_pool(&dbfile)?;
        Ok(Self { inner, cache_pool, write_lock: AsyncMutex::new(()), pending: AsyncMutex::new(HashMap::new()) })
    }

    async fn read_cache(&self, x: u32, y: u32, z: u8) -> Result<Option<(Vec<u8>, bool)>> {
        let pool = self.cache_pool.clone();
        let tile_row = flip_y(y, z);
        tokio::task::spawn_blocking(move || -> Result<Option<(Vec<u8>, bool)>> {
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
        .map_err(|e| ServerError::Backend(e.to_string()))?
    }

    async fn write_cache(&self, x: u32, y: u32, z: u8, bytes: Vec<u8>) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let pool = self.cache_pool.clone();
        let tile_row = flip_y(y, z);
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = pool.get().map_err(|e| ServerError::Backend(e.to_string()))?;
            conn.execute(
                "INSERT OR REPLACE INTO tiles (zoom_level, tile_column, tile_row, tile_data) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![z, x, tile_row, bytes],
            )
            .map_err(|e| ServerError::Backend(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| ServerError::Backend(e.to_string()))?
    }
}

async fn ensure_schema(dbfile: &Path) -> Result<()> {
    let dbfile = dbfile.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let conn = rusqlite::Connection::open(&dbfile)
            .map_err(|e| ServerError::BackendInit { backend: dbfile.display().to_string(), reason: e.to_string() })?;
        MbtilesSource::create_schema(&conn)
            .map_err(|e| ServerError::BackendInit { backend: dbfile.display().to_string(), reason: e.to_string() })?;
        Ok(())
    })
    .await
    .map_err(|e| ServerError::Backend(e.to_string()))?
}

#[async_trait]
impl TileSource for CachedSource {
    async fn get_tile(&self, x: u32, y: u32, z: u8) -> Result<Option<TileData>> {
        if let Some((bytes, is_gzip)) = self.read_cache(x, y, z).await? {
            let format = self.inner.metadata().format;
            let data = bytes::Bytes::from(bytes);
            return Ok(Some(if is_gzip { TileData::gzip(data, format) } else { TileData::new(data, format) }));
        }

        let key: PendingKey = (z, x, y);
        let mut rx = {
            let mut pending = self.pending.lock().await;
            if let Some(sender) = pending.get(&key) {
                sender.subscribe()
            } else {
                let (tx, rx) = broadcast::channel(1);
                pending.insert(key, tx);
                drop(pending);
                return self.fetch_and_broadcast(x, y, z, key).await;
            }
        };
        let outcome = rx.recv().await.map_err(|e| ServerError::Backend(e.to_string()))?;
        outcome_to_result(outcome, self.inner.metadata())
    }

    fn metadata(&self) -> &SourceMetadata {
        self.inner.metadata()
    }

    fn projected_bounds(&self) -> Option<Bounds> {
        self.inner.projected_bounds()
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl CachedSource {
    /// Performs the single owning fetch for `key`, writes the cache on
    /// success, then broadcasts the outcome to any requesters that joined
    /// while the fetch was in flight, and clears the pending slot.
    async fn fetch_and_broadcast(&self, x: u32, y: u32, z: u8, key: PendingKey) -> Result<Option<TileData>> {
        let result = self.inner.get_tile(x, y, z).await;

        let outcome = match &result {
            Ok(Some(tile)) => FetchOutcome { data: Some(tile.data.to_vec()), gzip_encoded: tile.gzip_encoded, error: None },
            Ok(None) => FetchOutcome { data: None, gzip_encoded: false, error: None },
            Err(e) => FetchOutcome { data: None, gzip_encoded: false, error: Some(e.to_string()) },
        };

        if let Ok(Some(tile)) = &result {
            let _ = self.write_cache(x, y, z, tile.data.to_vec()).await;
        }

        let mut pending = self.pending.lock().await;
        if let Some(sender) = pending.remove(&key) {
            let _ = sender.send(outcome);
        }
        drop(pending);

        result
    }
}

fn outcome_to_result(outcome: FetchOutcome, meta: &SourceMetadata) -> Result<Option<TileData>> {
    if let Some(err) = outcome.error {
        return Err(ServerError::Backend(err));
    }
    Ok(outcome.data.map(|bytes| {
        let data = bytes::Bytes::from(bytes);
        if outcome.gzip_encoded {
            TileData::gzip(data, meta.format)
        } else {
            TileData::new(data, meta.format)
        }
    }))
}

/// Convenience constructor taking a `dbfile` path string as found in config.
pub async fn wrap_with_dbfile(inner: Arc<dyn TileSource>, dbfile: &str) -> Result<Arc<dyn TileSource>> {
    let path = PathBuf::from(dbfile);
    Ok(Arc::new(CachedSource::wrap(inner, &path).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::{GeoBoundsDto, SourceType, TileFormat};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct CountingSource {
        metadata: SourceMetadata,
        hits: AtomicUsize,
    }

    #[async_trait]
    impl TileSource for CountingSource {
        async fn get_tile(&self, _x: u32, _y: u32, _z: u8) -> Result<Option<TileData>> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            Ok(Some(TileData::new(vec![9u8, 9, 9], TileFormat::Png)))
        }
        fn metadata(&self) -> &SourceMetadata {
            &self.metadata
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    fn test_metadata() -> SourceMetadata {
        SourceMetadata {
            id: "upstream".into(),
            source_type: SourceType::Xyz,
            title: "upstream".into(),
            abstract_text: None,
            format: TileFormat::Png,
            content_type: "image/png".into(),
            min_zoom: 0,
            max_zoom: 20,
            srs: "EPSG:3857".into(),
            geographical_bounds: None::<GeoBoundsDto>,
        }
    }

    #[tokio::test]
    async fn second_fetch_hits_cache_not_upstream() {
        let dir = tempfile::tempdir().unwrap();
        let dbfile = dir.path().join("cache.mbtiles");
        let inner = Arc::new(CountingSource { metadata: test_metadata(), hits: AtomicUsize::new(0) });
        let cached = CachedSource::wrap(inner.clone(), &dbfile).await.unwrap();

        let first = cached.get_tile(0, 0, 1).await.unwrap().unwrap();
        assert_eq!(first.data.as_ref(), &[9, 9, 9]);
        let second = cached.get_tile(0, 0, 1).await.unwrap().unwrap();
        assert_eq!(second.data.as_ref(), &[9, 9, 9]);

        assert_eq!(inner.hits.load(Ordering::SeqCst), 1);
    }
}
