//! PostGIS MVT source (C4f, §4.3): a fixed `{table, geometry, fields}`
//! config rendered through `ST_AsMVT`/`ST_AsMVTGeom`, served from a
//! version-gated connection pool.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod, Runtime, Timeouts};
use semver::Version;
use tokio_postgres::NoTls;

use crate::error::{Result, ServerError};
use crate::mercator::{flip_y, tile_bounds, Bounds};
use crate::sources::{PostgisTableConfig, SourceMetadata, TileData, TileFormat, TileSource};

/// Minimum server-side versions the query template relies on
/// (`ST_AsMVTGeom`'s 4-argument signature and `ST_TileEnvelope`).
const MINIMUM_POSTGRES_VERSION: (u32, u32) = (12, 0);
const MINIMUM_POSTGIS_VERSION: (u32, u32) = (3, 0);

#[derive(Debug)]
pub struct PostgisSource {
    pool: Pool,
    table: PostgisTableConfig,
    metadata: SourceMetadata,
}

impl PostgisSource {
    pub async fn connect(id: &str, connection_string: &str, table: PostgisTableConfig, metadata: SourceMetadata) -> Result<Self> {
        let pg_config: tokio_postgres::Config = connection_string
            .parse()
            .map_err(|e: tokio_postgres::Error| ServerError::BackendInit { backend: id.to_string(), reason: e.to_string() })?;

        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig { recycling_method: RecyclingMethod::Fast },
        );
        let pool = Pool::builder(manager)
            .timeouts(Timeouts {
                wait: Some(Duration::from_secs(15)),
                create: Some(Duration::from_secs(15)),
                recycle: Some(Duration::from_secs(15)),
            })
            .runtime(Runtime::Tokio1)
            .max_size(8)
            .build()
            .map_err(|e| ServerError::BackendInit { backend: id.to_string(), reason: e.to_string() })?;

        verify_server_versions(&pool, id).await?;

        Ok(Self { pool, table, metadata })
    }
}

async fn verify_server_versions(pool: &Pool, id: &str) -> Result<()> {
    let conn = pool.get().await.map_err(|e| ServerError::BackendInit { backend: id.to_string(), reason: e.to_string() })?;

    let pg_version_str: String = conn
        .query_one("SHOW server_version_num", &[])
        .await
        .map_err(|e| ServerError::BackendInit { backend: id.to_string(), reason: e.to_string() })?
        .get(0);
    let pg_version_num: u32 = pg_version_str
        .parse()
        .map_err(|_| ServerError::BackendInit { backend: id.to_string(), reason: "unparseable server_version_num".into() })?;
    let pg_major = pg_version_num / 10000;
    if pg_major < MINIMUM_POSTGRES_VERSION.0 {
        return Err(ServerError::BackendInit {
            backend: id.to_string(),
            reason: format!("PostgreSQL {pg_major} is older than the minimum supported {}", MINIMUM_POSTGRES_VERSION.0),
        });
    }

    let postgis_version_str: String = conn
        .query_one("SELECT PostGIS_Lib_Version()", &[])
        .await
        .map_err(|e| ServerError::BackendInit { backend: id.to_string(), reason: format!("PostGIS extension missing: {e}") })?
        .get(0);
    let postgis_version = parse_semver_prefix(&postgis_version_str)
        .ok_or_else(|| ServerError::BackendInit { backend: id.to_string(), reason: "unparseable PostGIS version".into() })?;
    let minimum = Version::new(MINIMUM_POSTGIS_VERSION.0 as u64, MINIMUM_POSTGIS_VERSION.1 as u64, 0);
    if postgis_version < minimum {
        return Err(ServerError::BackendInit {
            backend: id.to_string(),
            reason: format!("PostGIS {postgis_version} is older than the minimum supported {minimum}"),
        });
    }

    Ok(())
}

fn parse_semver_prefix(raw: &str) -> Option<Version> {
    let cleaned: String = raw.chars().take_while(|c| c.is_ascii_digit() || *c == '.').collect();
    let mut parts = cleaned.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let patch = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    Some(Version::new(major, minor, patch))
}

fn build_tile_query(table: &PostgisTableConfig, bounds: &Bounds) -> String {
    let fields = if table.fields.is_empty() {
        String::new()
    } else {
        format!(", {}", table.fields.join(", "))
    };
    format!(
        "WITH bounds AS (SELECT ST_MakeEnvelope({minx}, {miny}, {maxx}, {maxy}, 3857) AS geom), \
         mvtgeom AS (\
           SELECT ST_AsMVTGeom(ST_Transform(t.{geometry}, 3857), bounds.geom, 4096, 64, true) AS geom{fields} \
           FROM {table} t, bounds \
           WHERE ST_Intersects(t.{geometry}, ST_Transform(bounds.geom, ST_SRID(t.{geometry}))) \
         ) \
         SELECT ST_AsMVT(mvtgeom.*, '{table}', 4096, 'geom') AS mvt FROM mvtgeom",
        minx = bounds.left,
        miny = bounds.bottom,
        maxx = bounds.right,
        maxy = bounds.top,
        geometry = table.geometry,
        table = table.table,
        fields = fields,
    )
}

#[async_trait]
impl TileSource for PostgisSource {
    async fn get_tile(&self, x: u32, y: u32, z: u8) -> Result<Option<TileData>> {
        if z < self.metadata.min_zoom || z > self.metadata.max_zoom {
            return Ok(None);
        }
        let bounds = tile_bounds(x, flip_y(y, z), z);
        let query = build_tile_query(&self.table, &bounds);

        let conn = self.pool.get().await.map_err(|e| ServerError::Backend(e.to_string()))?;
        let row = conn.query_opt(&query, &[]).await.map_err(|e| ServerError::Backend(e.to_string()))?;
        let Some(row) = row else {
            return Ok(None);
        };
        // ST_AsMVT is an aggregate with no GROUP BY, so a tile with zero
        // intersecting features still returns one row with mvt = NULL rather
        // than zero rows.
        let bytes: Option<Vec<u8>> = row.get("mvt");
        let bytes = bytes.unwrap_or_default();
        Ok(Some(TileData::new(Bytes::from(bytes), TileFormat::Pbf)))
    }

    fn metadata(&self) -> &SourceMetadata {
        &self.metadata
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_postgis_version_strings() {
        assert_eq!(parse_semver_prefix("3.4 USE_GEOS=1 USE_PROJ=1"), Some(Version::new(3, 4, 0)));
        assert_eq!(parse_semver_prefix("3.2.1"), Some(Version::new(3, 2, 1)));
        assert_eq!(parse_semver_prefix("garbage"), None);
    }

    #[test]
    fn tile_query_embeds_bounds_and_table() {
        let table = PostgisTableConfig { table: "roads".into(), geometry: "geom".into(), fields: vec!["name".into()] };
        let bounds = Bounds::new(0.0, 0.0, 100.0, 100.0);
        let sql = build_tile_query(&table, &bounds);
        assert!(sql.contains("roads"));
        assert!(sql.contains(", name"));
        assert!(sql.contains("ST_AsMVT"));
    }
}
