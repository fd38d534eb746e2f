//! WMS `GetCapabilities`/`GetMap` dispatch (§4.9, §6). WMS errors are always
//! `200 OK` with an OGC `ServiceExceptionReport` body, never a 4xx/5xx -- the
//! one protocol where [`ServerError`] doesn't get to pick the status code.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};

use crate::capabilities::{wms_capabilities, LayerInfo};
use crate::compositor::{self, GetMapRequest};
use crate::error::ServerError;
use crate::mercator::Bounds;
use crate::routes::AppState;
use crate::sources::TileFormat;

pub async fn kvp_dispatch(State(state): State<Arc<AppState>>, Query(params): Query<HashMap<String, String>>) -> Response {
    let request = get_ci(&params, "request").unwrap_or_default();
    match request.to_ascii_lowercase().as_str() {
        "getcapabilities" => {
            let metadata = state.manager.all_metadata();
            let layers: Vec<LayerInfo> = metadata.iter().map(LayerInfo::from_metadata).collect();
            let xml = wms_capabilities(&state.base_url, &state.config.service.title, &layers);
            ([(header::CONTENT_TYPE, "text/xml")], xml).into_response()
        }
        "getmap" => get_map(&state, &params).await,
        other => wms_exception(&params, ServerError::Protocol(format!("unsupported REQUEST '{other}'"))),
    }
}

async fn get_map(state: &AppState, params: &HashMap<String, String>) -> Response {
    match build_get_map_request(params) {
        Ok(owned) => {
            let manager = &state.manager;
            let resolve = |id: &str| manager.get(id);
            let quality = state.config.service.jpeg_quality;
            match compositor::get_map(owned.as_borrowed(), resolve, quality).await {
                Ok(output) => ([(header::CONTENT_TYPE, output.content_type)], output.bytes).into_response(),
                Err(e) => wms_exception(params, e),
            }
        }
        Err(e) => wms_exception(params, e),
    }
}

fn wms_exception(params: &HashMap<String, String>, err: ServerError) -> Response {
    let content_type = match get_ci(params, "exceptions").as_deref() {
        Some("INIMAGE") | Some("BLANK") => "text/xml",
        _ => "application/vnd.ogc.se_xml",
    };
    ([(header::CONTENT_TYPE, content_type)], err.as_ogc_exception()).into_response()
}

/// Parses the OGC KVP parameters, swapping BBOX axis order for WMS 1.3.0
/// geographic CRSes (`CRS=EPSG:4326` is lat/lon; 1.1.1's `SRS` is always
/// lon/lat). Only EPSG:3857 and EPSG:4326 are accepted; 4326 requests are
/// reprojected into the 3857 canvas the compositor operates in.
fn build_get_map_request(params: &HashMap<String, String>) -> crate::error::Result<OwnedGetMapRequest> {
    let version = get_ci(params, "version").unwrap_or_else(|| "1.3.0".to_string());
    let crs_key = if version == "1.3.0" { "crs" } else { "srs" };
    let crs = get_ci(params, crs_key).ok_or_else(|| ServerError::Protocol(format!("{crs_key} is required").into()))?;

    let width = parse_required(params, "width")?;
    let height = parse_required(params, "height")?;
    let bbox_raw = get_ci(params, "bbox").ok_or_else(|| ServerError::Protocol("BBOX is required".into()))?;
    let parts: Vec<f64> = bbox_raw
        .split(',')
        .map(|p| p.trim().parse::<f64>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| ServerError::Protocol("BBOX must be four comma-separated numbers".into()))?;
    if parts.len() != 4 {
        return Err(ServerError::Protocol("BBOX must have exactly four values".into()));
    }
    let axis_swapped = version == "1.3.0" && crs.eq_ignore_ascii_case("epsg:4326");
    let (min_x, min_y, max_x, max_y) = if axis_swapped {
        (parts[1], parts[0], parts[3], parts[2])
    } else {
        (parts[0], parts[1], parts[2], parts[3])
    };

    let bbox = if crs.eq_ignore_ascii_case("epsg:4326") {
        Bounds::new(
            crate::mercator::lon_to_x(min_x),
            crate::mercator::lat_to_y(min_y),
            crate::mercator::lon_to_x(max_x),
            crate::mercator::lat_to_y(max_y),
        )
    } else if crs.eq_ignore_ascii_case("epsg:3857") {
        Bounds::new(min_x, min_y, max_x, max_y)
    } else {
        return Err(ServerError::Protocol(format!("unsupported {crs_key} '{crs}', only EPSG:3857/EPSG:4326 are supported")));
    };

    let layer_names: Vec<String> = get_ci(params, "layers")
        .ok_or_else(|| ServerError::Protocol("LAYERS is required".into()))?
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    let format_raw = get_ci(params, "format").unwrap_or_else(|| "image/png".to_string());
    let format = match format_raw.as_str() {
        "image/png" => TileFormat::Png,
        "image/jpeg" | "image/jpg" => TileFormat::Jpg,
        "image/tiff" => TileFormat::Tiff,
        other => return Err(ServerError::Protocol(format!("unsupported FORMAT '{other}'"))),
    };

    let transparent = get_ci(params, "transparent").map(|v| v.eq_ignore_ascii_case("true")).unwrap_or(false);
    let bgcolor = get_ci(params, "bgcolor");

    Ok(OwnedGetMapRequest { width, height, bbox, layer_names, format, transparent, bgcolor })
}

fn parse_required(params: &HashMap<String, String>, key: &str) -> crate::error::Result<u32> {
    get_ci(params, key)
        .ok_or_else(|| ServerError::Protocol(format!("{} is required", key.to_ascii_uppercase())))?
        .parse::<u32>()
        .map_err(|_| ServerError::Protocol(format!("{} must be a positive integer", key.to_ascii_uppercase())))
}

/// Owned counterpart of [`GetMapRequest`], which borrows `layer_names` and
/// `bgcolor` -- KVP parsing needs to own the strings it extracts from `params`.
struct OwnedGetMapRequest {
    width: u32,
    height: u32,
    bbox: Bounds,
    layer_names: Vec<String>,
    format: TileFormat,
    transparent: bool,
    bgcolor: Option<String>,
}

impl OwnedGetMapRequest {
    fn as_borrowed(&self) -> GetMapRequest<'_> {
        GetMapRequest {
            width: self.width,
            height: self.height,
            bbox: self.bbox,
            layer_names: &self.layer_names,
            format: self.format,
            transparent: self.transparent,
            bgcolor: self.bgcolor.as_deref(),
        }
    }
}

/// WMS KVP parameter names are conventionally upper case but clients send
/// all sorts of casing; match case-insensitively.
fn get_ci(params: &HashMap<String, String>, key: &str) -> Option<String> {
    params.iter().find(|(k, _)| k.eq_ignore_ascii_case(key)).map(|(_, v)| v.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kvp(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn parses_wms_1_3_0_with_lat_lon_axis_order() {
        let params = kvp(&[
            ("VERSION", "1.3.0"),
            ("CRS", "EPSG:4326"),
            ("BBOX", "-10,-20,10,20"),
            ("WIDTH", "256"),
            ("HEIGHT", "256"),
            ("LAYERS", "world"),
        ]);
        let req = build_get_map_request(&params).unwrap();
        // 1.3.0 + EPSG:4326 BBOX is lat,lon,lat,lon, so min_y(lat)=-10 maps to a lower mercator y
        // than the unswapped lon=-10 would.
        assert!(req.bbox.left < 0.0 && req.bbox.right > 0.0);
    }

    #[test]
    fn rejects_unsupported_crs() {
        let params = kvp(&[
            ("VERSION", "1.3.0"),
            ("CRS", "EPSG:2154"),
            ("BBOX", "0,0,1,1"),
            ("WIDTH", "256"),
            ("HEIGHT", "256"),
            ("LAYERS", "world"),
        ]);
        assert!(build_get_map_request(&params).is_err());
    }

    #[test]
    fn missing_layers_is_an_error() {
        let params = kvp(&[("VERSION", "1.1.1"), ("SRS", "EPSG:3857"), ("BBOX", "0,0,1,1"), ("WIDTH", "256"), ("HEIGHT", "256")]);
        assert!(build_get_map_request(&params).is_err());
    }
}
