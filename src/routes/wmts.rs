//! WMTS dispatch (§4.9, §6): KVP (`/wmts?...`) and RESTful
//! (`/wmts/tile/1.0.0/...`) tile access, plus `GetCapabilities`.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::capabilities::{wmts_capabilities, LayerInfo};
use crate::error::ServerError;
use crate::routes::{split_ext, AppState};

pub async fn kvp_dispatch(State(state): State<Arc<AppState>>, Query(params): Query<HashMap<String, String>>) -> Response {
    let request = get_ci(&params, "request").unwrap_or_default();
    match request.to_ascii_lowercase().as_str() {
        "getcapabilities" => {
            let metadata = state.manager.all_metadata();
            let layers: Vec<LayerInfo> = metadata.iter().map(LayerInfo::from_metadata).collect();
            let xml = wmts_capabilities(&state.base_url, &state.config.service.title, &layers);
            ([(header::CONTENT_TYPE, "text/xml")], xml).into_response()
        }
        "gettile" => {
            let Some(layer) = get_ci(&params, "layer") else {
                return ServerError::Protocol("LAYER is required".into()).into_response();
            };
            let Some(z) = get_ci(&params, "tilematrix").and_then(|v| v.parse::<u8>().ok()) else {
                return ServerError::Protocol("TILEMATRIX must be an integer".into()).into_response();
            };
            let Some(row) = get_ci(&params, "tilerow").and_then(|v| v.parse::<u32>().ok()) else {
                return ServerError::Protocol("TILEROW must be an integer".into()).into_response();
            };
            let Some(col) = get_ci(&params, "tilecol").and_then(|v| v.parse::<u32>().ok()) else {
                return ServerError::Protocol("TILECOL must be an integer".into()).into_response();
            };
            respond_with_tile(&state, &layer, col, row, z).await
        }
        other => ServerError::Protocol(format!("unsupported REQUEST '{other}'")).into_response(),
    }
}

pub async fn rest_tile(
    State(state): State<Arc<AppState>>,
    Path((layer, _style, _tilematrixset, z, y, x_with_ext)): Path<(String, String, String, u8, u32, String)>,
) -> Response {
    let (x_str, _ext) = split_ext(&x_with_ext);
    let Ok(x) = x_str.parse::<u32>() else {
        return ServerError::Protocol("invalid TileCol".into()).into_response();
    };
    respond_with_tile(&state, &layer, x, y, z).await
}

async fn respond_with_tile(state: &AppState, layer: &str, x: u32, y: u32, z: u8) -> Response {
    let Some(source) = state.manager.get(layer) else {
        return (StatusCode::NOT_FOUND, "unknown layer").into_response();
    };
    match source.get_tile(x, y, z).await {
        Ok(Some(tile)) => {
            let mut response = ([(header::CONTENT_TYPE, tile.format.content_type())], tile.data).into_response();
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

/// WMTS KVP parameter names are conventionally upper case but clients are
/// inconsistent; match case-insensitively rather than mandating one casing.
fn get_ci(params: &HashMap<String, String>, key: &str) -> Option<String> {
    params.iter().find(|(k, _)| k.eq_ignore_ascii_case(key)).map(|(_, v)| v.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_ci_matches_regardless_of_case() {
        let mut params = HashMap::new();
        params.insert("Layer".to_string(), "world".to_string());
        assert_eq!(get_ci(&params, "layer"), Some("world".to_string()));
        assert_eq!(get_ci(&params, "LAYER"), Some("world".to_string()));
    }
}
