//! Source registry (C3, §4.2): builds every configured [`TileSource`] and
//! exposes lookup by id. Startup policy follows `server.lenientStartup`: a
//! failing source is logged and excluded by default, or aborts the whole
//! process when strict mode is requested.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::config::Config;
use crate::error::{Result, ServerError};
use crate::sources::{
    cache, fs::FsSource, geotiff::GeoTiffSource, http_tile, mbtiles::MbtilesSource, wms_source::WmsTileSource,
    CacheConfig, SourceConfig, SourceMetadata, SourceType, TileFormat, TileSource,
};

#[derive(Debug)]
pub struct SourceManager {
    sources: HashMap<String, Arc<dyn TileSource>>,
}

impl SourceManager {
    pub async fn from_config(config: &Config) -> Result<Self> {
        let mut sources = HashMap::new();
        for source_config in &config.sources {
            match build_source(source_config, config.service.jpeg_quality).await {
                Ok(source) => {
                    sources.insert(source_config.id.clone(), source);
                }
                Err(e) => {
                    if config.server.lenient_startup {
                        tracing::warn!(source_id = %source_config.id, error = %e, "source init failed, excluding from registry");
                    } else {
                        return Err(e);
                    }
                }
            }
        }
        Ok(Self { sources })
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn TileSource>> {
        self.sources.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.sources.keys().map(|s| s.as_str()).collect()
    }

    pub fn all_metadata(&self) -> Vec<SourceMetadata> {
        self.sources.values().map(|s| s.metadata().clone()).collect()
    }

    pub fn exists(&self, id: &str) -> bool {
        self.sources.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

async fn build_source(config: &SourceConfig, service_jpeg_quality: u8) -> Result<Arc<dyn TileSource>> {
    let metadata = placeholder_metadata(config);

    let built: Arc<dyn TileSource> = match config.source_type {
        SourceType::Mbtiles => Arc::new(MbtilesSource::open(&config.id, Path::new(&config.location)).await?),
        SourceType::File => Arc::new(FsSource::new(config.location.clone(), config.tms, metadata)),
        SourceType::Xyz | SourceType::Tms => {
            let client = http_tile::build_client(config.request_timeout_secs)?;
            let tms = config.tms || matches!(config.source_type, SourceType::Tms);
            Arc::new(http_tile::HttpTileSource::new(client, config.location.clone(), tms, metadata))
        }
        SourceType::Wmts => {
            let client = http_tile::build_client(config.request_timeout_secs)?;
            Arc::new(
                http_tile::WmtsSource::new(client, config.location.clone(), config.capabilities_url.as_deref(), metadata)
                    .await?,
            )
        }
        SourceType::Wms => {
            let client = http_tile::build_client(config.request_timeout_secs)?;
            Arc::new(WmsTileSource::new(client, config.location.clone(), config.id.clone(), metadata))
        }
        SourceType::Geotiff => Arc::new(GeoTiffSource::open(&config.id, Path::new(&config.location), service_jpeg_quality).await?),
        SourceType::Postgis => {
            #[cfg(feature = "postgis")]
            {
                let table = config.postgis.clone().ok_or_else(|| ServerError::Config(format!("source '{}': missing 'postgis' table config", config.id)))?;
                let conn_str = config
                    .connection_string
                    .clone()
                    .ok_or_else(|| ServerError::Config(format!("source '{}': missing 'connectionString'", config.id)))?;
                Arc::new(crate::sources::postgis::PostgisSource::connect(&config.id, &conn_str, table, metadata).await?)
            }
            #[cfg(not(feature = "postgis"))]
            {
                return Err(ServerError::Config(format!("source '{}': postgis support not compiled in", config.id)));
            }
        }
    };

    let built: Arc<dyn TileSource> = match &config.cache {
        Some(CacheConfig::Mbtiles { dbfile }) => cache::wrap_with_dbfile(built, dbfile).await?,
        None => built,
    };

    Ok(built)
}

fn placeholder_metadata(config: &SourceConfig) -> SourceMetadata {
    let format = config.format.unwrap_or(TileFormat::Png);
    SourceMetadata {
        id: config.id.clone(),
        source_type: config.source_type,
        title: config.title.clone().unwrap_or_else(|| config.id.clone()),
        abstract_text: config.abstract_text.clone(),
        format,
        content_type: config.content_type.clone().unwrap_or_else(|| format.content_type().to_string()),
        min_zoom: config.min_zoom.unwrap_or(0),
        max_zoom: config.max_zoom.unwrap_or(22),
        srs: config.srs.clone().unwrap_or_else(|| "EPSG:3857".to_string()),
        geographical_bounds: None,
    }
}
