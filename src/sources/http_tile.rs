//! Remote HTTP XYZ/TMS (C4c) and WMTS (C4d) backends. Both share a single
//! connection-pooling client and URL-template substitution; WMTS adds an
//! optional capabilities probe at init.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use crate::error::{Result, ServerError};
use crate::mercator::flip_y;
use crate::sources::{SourceMetadata, TileData, TileSource};

const DEFAULT_TIMEOUT_SECS: u64 = 15;

pub fn build_client(timeout_secs: Option<u64>) -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS)))
        .pool_max_idle_per_host(8)
        .build()
        .map_err(|e| ServerError::Config(e.to_string()))
}

/// HTTP XYZ/TMS source (C4c). `tms` selects the Y convention on the wire.
#[derive(Debug)]
pub struct HttpTileSource {
    client: Client,
    url_template: String,
    tms: bool,
    metadata: SourceMetadata,
}

impl HttpTileSource {
    pub fn new(client: Client, url_template: String, tms: bool, metadata: SourceMetadata) -> Self {
        Self { client, url_template, tms, metadata }
    }
}

#[async_trait]
impl TileSource for HttpTileSource {
    async fn get_tile(&self, x: u32, y: u32, z: u8) -> Result<Option<TileData>> {
        if z < self.metadata.min_zoom || z > self.metadata.max_zoom {
            return Ok(None);
        }
        let row = if self.tms { flip_y(y, z) } else { y };
        let url = substitute_xyz(&self.url_template, z, x, row);
        fetch_tile(&self.client, &url, self.metadata.format).await
    }

    fn metadata(&self) -> &SourceMetadata {
        &self.metadata
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// WMTS source (C4d): REST or KVP URL template with `{TileMatrix}`,
/// `{TileRow}`, `{TileCol}`. A `capabilitiesurl`, when configured, is probed
/// once at init purely to validate reachability; its body isn't parsed.
#[derive(Debug)]
pub struct WmtsSource {
    client: Client,
    url_template: String,
    metadata: SourceMetadata,
}

impl WmtsSource {
    pub async fn new(
        client: Client,
        url_template: String,
        capabilities_url: Option<&str>,
        metadata: SourceMetadata,
    ) -> Result<Self> {
        if let Some(cap_url) = capabilities_url {
            let resp = client
                .get(cap_url)
                .send()
                .await
                .map_err(|e| ServerError::BackendInit { backend: metadata.id.clone(), reason: e.to_string() })?;
            if !resp.status().is_success() {
                return Err(ServerError::BackendInit {
                    backend: metadata.id.clone(),
                    reason: format!("GetCapabilities returned {}", resp.status()),
                });
            }
        }
        Ok(Self { client, url_template, metadata })
    }
}

#[async_trait]
impl TileSource for WmtsSource {
    async fn get_tile(&self, x: u32, y: u32, z: u8) -> Result<Option<TileData>> {
        if z < self.metadata.min_zoom || z > self.metadata.max_zoom {
            return Ok(None);
        }
        let url = substitute_wmts(&self.url_template, z, x, y);
        fetch_tile(&self.client, &url, self.metadata.format).await
    }

    fn metadata(&self) -> &SourceMetadata {
        &self.metadata
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

async fn fetch_tile(client: &Client, url: &str, format: crate::sources::TileFormat) -> Result<Option<TileData>> {
    let resp = client.get(url).send().await.map_err(|e| ServerError::Backend(e.to_string()))?;
    if resp.status() == reqwest::StatusCode::NOT_FOUND {
        return Ok(None);
    }
    if !resp.status().is_success() {
        return Err(ServerError::Backend(format!("upstream returned {}", resp.status())));
    }
    let bytes = resp.bytes().await.map_err(|e| ServerError::Backend(e.to_string()))?;
    Ok(Some(TileData::new(bytes, format)))
}

fn substitute_token(template: &str, replacements: &[(&str, String)]) -> String {
    let mut out = String::with_capacity(template.len());
    let chars: Vec<char> = template.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '{' {
            if let Some(end) = chars[i..].iter().position(|&c| c == '}') {
                let token: String = chars[i + 1..i + end].iter().collect();
                let lower = token.to_ascii_lowercase();
                if let Some((_, value)) = replacements.iter().find(|(name, _)| name.to_ascii_lowercase() == lower) {
                    out.push_str(value);
                    i += end + 1;
                    continue;
                }
            }
        }
        out.push(chars[i]);
        i += 1;
    }
    out
}

fn substitute_xyz(template: &str, z: u8, x: u32, y: u32) -> String {
    substitute_token(template, &[("x", x.to_string()), ("y", y.to_string()), ("z", z.to_string())])
}

fn substitute_wmts(template: &str, z: u8, x: u32, y: u32) -> String {
    substitute_token(
        template,
        &[("tilematrix", z.to_string()), ("tilerow", y.to_string()), ("tilecol", x.to_string())],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xyz_template_substitution_is_case_insensitive() {
        assert_eq!(substitute_xyz("https://example/{Z}/{x}/{Y}.png", 3, 1, 2), "https://example/3/1/2.png");
    }

    #[test]
    fn wmts_template_substitution() {
        assert_eq!(
            substitute_wmts("https://example/wmts/{TileMatrix}/{TileRow}/{TileCol}.png", 4, 5, 6),
            "https://example/wmts/4/6/5.png"
        );
    }
}
