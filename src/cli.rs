use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "tilemapd")]
#[command(author, version, about = "Tile map server exposing TMS, WMTS and WMS over heterogeneous raster and vector backends", long_about = None)]
pub struct Cli {
    /// Path to the JSON configuration file
    #[arg(short, long, value_name = "FILE", env = "TILESERVER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address to bind to, overriding `server.host`/`server.port`
    #[arg(long, value_name = "HOST:PORT", env = "TILESERVER_BIND")]
    pub bind: Option<String>,

    /// Tracing filter directive, e.g. `info` or `tilemapd=debug,tower_http=warn`
    #[arg(long, env = "TILESERVER_LOG", default_value = "info")]
    pub log_level: String,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
