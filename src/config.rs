//! Configuration loading (C10, §4.10): JSON config with `${VAR}`/`$VAR`
//! environment-variable substitution applied before parsing, so secrets
//! never have to live in the file itself.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, ServerError};
use crate::sources::SourceConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub service: ServiceConfig,
    #[serde(default)]
    pub telemetry: Option<TelemetryConfig>,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_getmap_timeout_secs")]
    pub getmap_timeout_secs: u64,
    #[serde(default = "default_lenient_startup")]
    pub lenient_startup: bool,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_request_timeout_secs() -> u64 {
    15
}
fn default_getmap_timeout_secs() -> u64 {
    60
}
fn default_lenient_startup() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout_secs(),
            getmap_timeout_secs: default_getmap_timeout_secs(),
            lenient_startup: default_lenient_startup(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    #[serde(default = "default_title")]
    pub title: String,
    #[serde(default, rename = "abstract")]
    pub abstract_text: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

fn default_title() -> String {
    "Tile Map Service".to_string()
}
fn default_jpeg_quality() -> u8 {
    85
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryConfig {
    pub otlp_endpoint: Option<String>,
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

fn default_service_name() -> String {
    "tilemapd".to_string()
}

impl Config {
    fn substitute_env_vars(content: &str) -> String {
        shellexpand::env_with_context_no_errors(content, |var| std::env::var(var).ok()).to_string()
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(ServerError::Io)?;
        let substituted = Self::substitute_env_vars(&raw);
        let config: Config = serde_json::from_str(&substituted)
            .map_err(|e| ServerError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for source in &self.sources {
            if source.id.is_empty() {
                return Err(ServerError::Config("source id must not be empty".into()));
            }
            if !seen.insert(source.id.clone()) {
                return Err(ServerError::Config(format!("duplicate source id '{}'", source.id)));
            }
            if source.location.is_empty() {
                return Err(ServerError::Config(format!("source '{}': location must not be empty", source.id)));
            }
        }
        Ok(())
    }
}

pub fn default_config_path() -> PathBuf {
    PathBuf::from("config.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn minimal_config_round_trips_with_defaults() {
        let json = r#"{
            "service": {"title": "Test"},
            "sources": [
                {"id": "world", "type": "mbtiles", "location": "/tmp/world.mbtiles"}
            ]
        }"#;
        let file = write_temp_config(json);
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.server.port, 8080);
        assert!(config.server.lenient_startup);
        assert_eq!(config.sources.len(), 1);
        assert_eq!(config.sources[0].id, "world");
    }

    #[test]
    fn missing_required_service_field_is_a_config_error() {
        let json = r#"{ "sources": [] }"#;
        let file = write_temp_config(json);
        assert!(Config::from_file(file.path()).is_err());
    }

    #[test]
    fn duplicate_source_ids_are_rejected() {
        let json = r#"{
            "service": {"title": "Test"},
            "sources": [
                {"id": "dup", "type": "mbtiles", "location": "/a.mbtiles"},
                {"id": "dup", "type": "mbtiles", "location": "/b.mbtiles"}
            ]
        }"#;
        let file = write_temp_config(json);
        assert!(Config::from_file(file.path()).is_err());
    }

    #[test]
    fn env_var_substitution_applies_before_parsing() {
        std::env::set_var("TILESERVER_TEST_HOST", "10.0.0.5");
        let json = r#"{
            "server": {"host": "${TILESERVER_TEST_HOST}"},
            "service": {"title": "Test"},
            "sources": []
        }"#;
        let file = write_temp_config(json);
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.server.host, "10.0.0.5");
        std::env::remove_var("TILESERVER_TEST_HOST");
    }
}
