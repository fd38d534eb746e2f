//! Local filesystem tree source (C4b, §4.3): `location` is a path template
//! containing `{z}`, `{x}`, `{y}` placeholders (case-insensitive).

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{Result, ServerError};
use crate::mercator::flip_y;
use crate::sources::{SourceMetadata, TileData, TileSource};

#[derive(Debug)]
pub struct FsSource {
    template: String,
    tms: bool,
    metadata: SourceMetadata,
}

impl FsSource {
    pub fn new(template: String, tms: bool, metadata: SourceMetadata) -> Self {
        Self { template, tms, metadata }
    }

    fn resolve_path(&self, x: u32, y: u32, z: u8) -> std::path::PathBuf {
        let row = if self.tms { flip_y(y, z) } else { y };
        let path = substitute_template(&self.template, z, x, row);
        std::path::PathBuf::from(path)
    }
}

/// Replaces `{z}`, `{x}`, `{y}` case-insensitively without touching any other
/// part of the template.
fn substitute_template(template: &str, z: u8, x: u32, y: u32) -> String {
    let mut out = String::with_capacity(template.len());
    let bytes = template.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            if let Some(end) = template[i..].find('}') {
                let token = &template[i + 1..i + end];
                match token.to_ascii_lowercase().as_str() {
                    "z" => {
                        out.push_str(&z.to_string());
                        i += end + 1;
                        continue;
                    }
                    "x" => {
                        out.push_str(&x.to_string());
                        i += end + 1;
                        continue;
                    }
                    "y" => {
                        out.push_str(&y.to_string());
                        i += end + 1;
                        continue;
                    }
                    _ => {}
                }
            }
        }
        out.push(template[i..].chars().next().unwrap());
        i += template[i..].chars().next().unwrap().len_utf8();
    }
    out
}

#[async_trait]
impl TileSource for FsSource {
    async fn get_tile(&self, x: u32, y: u32, z: u8) -> Result<Option<TileData>> {
        if z < self.metadata.min_zoom || z > self.metadata.max_zoom {
            return Ok(None);
        }
        let path = self.resolve_path(x, y, z);
        let format = self.metadata.format;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(TileData::new(Bytes::from(bytes), format))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ServerError::Io(e)),
        }
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
    fn substitutes_placeholders_case_insensitively() {
        let resolved = substitute_template("/tiles/{Z}/{X}/{y}.png", 4, 2, 1);
        assert_eq!(resolved, "/tiles/4/2/1.png");
    }

    #[test]
    fn leaves_unrelated_braces_alone() {
        let resolved = substitute_template("/tiles/{z}/oops{unknown}/{x}/{y}.png", 4, 2, 1);
        assert_eq!(resolved, "/tiles/4/oops{unknown}/2/1.png");
    }
}
