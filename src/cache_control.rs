//! `Cache-Control` policy shared by the TMS, WMTS and WMS tile routes.

use axum::http::HeaderValue;

/// Cache-Control value attached to every successful tile response.
pub fn tile_cache_headers() -> HeaderValue {
    HeaderValue::from_static("public, max-age=86400, stale-while-revalidate=604800")
}
