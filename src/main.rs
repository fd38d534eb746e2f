use std::sync::Arc;

use clap::Parser;
use tilemapd::cli::Cli;
use tilemapd::config::{default_config_path, Config};
use tilemapd::routes::{build_router, AppState};
use tilemapd::sources::SourceManager;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse_args();

    let env_filter = tracing_subscriber::EnvFilter::try_new(&cli.log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(env_filter).with(tracing_subscriber::fmt::layer());

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let config = Config::from_file(&config_path)?;

    let otel_layer = config.telemetry.as_ref().and_then(tilemapd::telemetry::init_telemetry);
    registry.with(otel_layer).init();

    let manager = SourceManager::from_config(&config).await?;
    tracing::info!(sources = manager.len(), "source registry initialized");

    let bind_addr = cli.bind.clone().unwrap_or_else(|| format!("{}:{}", config.server.host, config.server.port));
    let base_url = format!("http://{bind_addr}");

    let state = Arc::new(AppState { manager, config, base_url });
    let app = build_router(state)
        .layer(axum::middleware::from_fn(tilemapd::logging::request_logger))
        .layer(tower_http::compression::CompressionLayer::new());

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "listening");
    axum::serve(listener, app).await?;

    tilemapd::telemetry::shutdown_telemetry();
    Ok(())
}
