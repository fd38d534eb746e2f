//! TMS and XYZ tile dispatch (§4.9, §6). TMS `y` is TMS-addressed; XYZ `y`
//! is already slippy-addressed. Both flip to XYZ before calling the
//! registry, since every [`crate::sources::TileSource`] speaks XYZ.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::capabilities::{tms_layer_capabilities, tms_root_capabilities, LayerInfo};
use crate::error::ServerError;
use crate::mercator::flip_y;
use crate::routes::{split_ext, AppState};

pub async fn service_capabilities(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let metadata = state.manager.all_metadata();
    let layers: Vec<LayerInfo> = metadata.iter().map(LayerInfo::from_metadata).collect();
    let xml = tms_root_capabilities(&state.base_url, &layers);
    ([(header::CONTENT_TYPE, "text/xml")], xml)
}

pub async fn layer_capabilities(State(state): State<Arc<AppState>>, Path(layer): Path<String>) -> Response {
    let Some(source) = state.manager.get(&layer) else {
        return (StatusCode::NOT_FOUND, "unknown layer").into_response();
    };
    let metadata = source.metadata().clone();
    let info = LayerInfo::from_metadata(&metadata);
    let xml = tms_layer_capabilities(&state.base_url, &info);
    ([(header::CONTENT_TYPE, "text/xml")], xml).into_response()
}

pub async fn get_tile(
    State(state): State<Arc<AppState>>,
    Path((layer, z, x, y_with_ext)): Path<(String, u8, u32, String)>,
) -> Response {
    let (y_str, _ext) = split_ext(&y_with_ext);
    let Ok(tms_y) = y_str.parse::<u32>() else {
        return ServerError::Protocol("invalid y coordinate".into()).into_response();
    };
    let xyz_y = flip_y(tms_y, z);
    respond_with_tile(&state, &layer, x, xyz_y, z).await
}

pub async fn get_tile_xyz(
    State(state): State<Arc<AppState>>,
    Path((layer, z, x, y_with_ext)): Path<(String, u8, u32, String)>,
) -> Response {
    let (y_str, _ext) = split_ext(&y_with_ext);
    let Ok(y) = y_str.parse::<u32>() else {
        return ServerError::Protocol("invalid y coordinate".into()).into_response();
    };
    respond_with_tile(&state, &layer, x, y, z).await
}

async fn respond_with_tile(state: &AppState, layer: &str, x: u32, y: u32, z: u8) -> Response {
    let Some(source) = state.manager.get(layer) else {
        return (StatusCode::NOT_FOUND, "unknown layer").into_response();
    };
    match source.get_tile(x, y, z).await {
        Ok(Some(tile)) => {
            let mut response = (
                [(header::CONTENT_TYPE, tile.format.content_type())],
                tile.data,
            )
                .into_response();
            if tile.gzip_encoded {
                response.headers_mut().insert(header::CONTENT_ENCODING, header::HeaderValue::from_static("gzip"));
            }
            response.headers_mut().insert(header::CACHE_CONTROL, crate::cache_control::tile_cache_headers());
            response
        }
        Ok(None) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => e.into_response(),
    }
}
