//! Protocol dispatchers (C9, §4.9/§6): routes TMS/XYZ/WMTS/WMS URLs to the
//! registry (C3) or the compositor (C6) and wires `/healthz`.

mod tms;
mod wms;
mod wmts;

use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;

use crate::config::Config;
use crate::sources::SourceManager;

pub struct AppState {
    pub manager: SourceManager,
    pub config: Config,
    pub base_url: String,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/tms/1.0.0", get(tms::service_capabilities))
        .route("/tms/1.0.0/{layer}", get(tms::layer_capabilities))
        .route("/tms/1.0.0/{layer}/{z}/{x}/{y}", get(tms::get_tile))
        .route("/xyz/{layer}/{z}/{x}/{y}", get(tms::get_tile_xyz))
        .route("/wmts", get(wmts::kvp_dispatch))
        .route("/wmts/tile/1.0.0/{layer}/{style}/{tilematrixset}/{z}/{y}/{x}", get(wmts::rest_tile))
        .route("/wms", get(wms::kvp_dispatch))
        .with_state(state)
}

async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let _ = &state.manager;
    axum::http::StatusCode::OK
}

/// Splits a `{z}/{x}/{y}.{ext}` style trailing path segment into its parts.
pub(crate) fn split_ext(segment: &str) -> (&str, Option<&str>) {
    match segment.rsplit_once('.') {
        Some((stem, ext)) => (stem, Some(ext)),
        None => (segment, None),
    }
}
