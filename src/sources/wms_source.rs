//! WMS-backed tile source (C4e, §4.3): synthesizes a `GetMap` request per
//! requested tile against an upstream WMS base URL.

use async_trait::async_trait;
use reqwest::Client;

use crate::error::{Result, ServerError};
use crate::mercator::tile_bounds;
use crate::sources::{SourceMetadata, TileData, TileSource};

#[derive(Debug)]
pub struct WmsTileSource {
    client: Client,
    base_url: String,
    layer_name: String,
    metadata: SourceMetadata,
}

impl WmsTileSource {
    pub fn new(client: Client, base_url: String, layer_name: String, metadata: SourceMetadata) -> Self {
        Self { client, base_url, layer_name, metadata }
    }
}

#[async_trait]
impl TileSource for WmsTileSource {
    async fn get_tile(&self, x: u32, y: u32, z: u8) -> Result<Option<TileData>> {
        if z < self.metadata.min_zoom || z > self.metadata.max_zoom {
            return Ok(None);
        }
        let bounds = tile_bounds(x, y, z);
        let format_param = match self.metadata.format {
            crate::sources::TileFormat::Png => "image/png",
            crate::sources::TileFormat::Jpg => "image/jpeg",
            crate::sources::TileFormat::Tiff => "image/tiff",
            other => return Err(ServerError::Protocol(format!("unsupported WMS source format {other:?}"))),
        };

        let separator = if self.base_url.contains('?') { "&" } else { "?" };
        let url = format!(
            "{base}{sep}SERVICE=WMS&VERSION=1.3.0&REQUEST=GetMap&LAYERS={layer}&STYLES=&CRS=EPSG:3857&\
             BBOX={minx},{miny},{maxx},{maxy}&WIDTH=256&HEIGHT=256&FORMAT={format}&TRANSPARENT=TRUE",
            base = self.base_url,
            sep = separator,
            layer = self.layer_name,
            minx = bounds.left,
            miny = bounds.bottom,
            maxx = bounds.right,
            maxy = bounds.top,
            format = format_param,
        );

        let resp = self.client.get(&url).send().await.map_err(|e| ServerError::Backend(e.to_string()))?;
        let status = resp.status();
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let bytes = resp.bytes().await.map_err(|e| ServerError::Backend(e.to_string()))?;

        if !status.is_success() || content_type.contains("xml") {
            return Err(ServerError::Backend(format!(
                "WMS GetMap failed for layer '{}': status {}",
                self.layer_name, status
            )));
        }

        Ok(Some(TileData::new(bytes, self.metadata.format)))
    }

    fn metadata(&self) -> &SourceMetadata {
        &self.metadata
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
