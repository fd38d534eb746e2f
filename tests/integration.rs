//! End-to-end HTTP tests: boots a real router over a temporary MBTiles
//! source and drives it through TMS, XYZ, WMTS and WMS.

use std::io::Write as _;
use std::sync::Arc;

use axum_test::TestServer;
use rusqlite::Connection;
use tilemapd::config::Config;
use tilemapd::routes::{build_router, AppState};
use tilemapd::sources::SourceManager;

/// A 1x1 PNG, reused as tile payload across tests.
const PNG_1X1: &[u8] = &[
    0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0x00, 0x00, 0x0d, 0x49, 0x48, 0x44, 0x52, 0x00, 0x00, 0x00,
    0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1f, 0x15, 0xc4, 0x89, 0x00, 0x00, 0x00, 0x0a, 0x49,
    0x44, 0x41, 0x54, 0x78, 0x9c, 0x63, 0x00, 0x01, 0x00, 0x00, 0x05, 0x00, 0x01, 0x0d, 0x0a, 0x2d, 0xb4, 0x00, 0x00,
    0x00, 0x00, 0x49, 0x45, 0x4e, 0x44, 0xae, 0x42, 0x60, 0x82,
];

fn write_sample_mbtiles(path: &std::path::Path) {
    let conn = Connection::open(path).unwrap();
    conn.execute_batch(
        "CREATE TABLE metadata (name TEXT, value TEXT);
         CREATE TABLE tiles (zoom_level INTEGER, tile_column INTEGER, tile_row INTEGER, tile_data BLOB);",
    )
    .unwrap();
    for (name, value) in [
        ("name", "World"),
        ("format", "png"),
        ("minzoom", "0"),
        ("maxzoom", "2"),
        ("bounds", "-180,-85,180,85"),
    ] {
        conn.execute("INSERT INTO metadata (name, value) VALUES (?1, ?2)", rusqlite::params![name, value]).unwrap();
    }
    // zoom 0 has a single tile at (0, 0); TMS row == XYZ row at z=0.
    conn.execute(
        "INSERT INTO tiles (zoom_level, tile_column, tile_row, tile_data) VALUES (0, 0, 0, ?1)",
        rusqlite::params![PNG_1X1],
    )
    .unwrap();
}

async fn test_server() -> (TestServer, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mbtiles_path = dir.path().join("world.mbtiles");
    write_sample_mbtiles(&mbtiles_path);

    let config_json = format!(
        r#"{{
            "service": {{"title": "Test Service"}},
            "sources": [
                {{"id": "world", "type": "mbtiles", "location": "{}"}}
            ]
        }}"#,
        mbtiles_path.display().to_string().replace('\\', "\\\\")
    );
    let mut config_file = tempfile::NamedTempFile::new().unwrap();
    config_file.write_all(config_json.as_bytes()).unwrap();
    let config = Config::from_file(config_file.path()).unwrap();

    let manager = SourceManager::from_config(&config).await.unwrap();
    let state = Arc::new(AppState { manager, config, base_url: "http://localhost:8080".to_string() });
    let server = TestServer::new(build_router(state)).unwrap();
    (server, dir)
}

#[tokio::test]
async fn healthz_reports_ok() {
    let (server, _dir) = test_server().await;
    let response = server.get("/healthz").await;
    response.assert_status_ok();
}

#[tokio::test]
async fn tms_root_capabilities_lists_the_configured_layer() {
    let (server, _dir) = test_server().await;
    let response = server.get("/tms/1.0.0").await;
    response.assert_status_ok();
    let body = response.text();
    assert!(body.contains("world") || body.contains("World"));
}

#[tokio::test]
async fn xyz_tile_round_trips_the_stored_png() {
    let (server, _dir) = test_server().await;
    let response = server.get("/xyz/world/0/0/0").await;
    response.assert_status_ok();
    assert_eq!(response.as_bytes().as_ref(), PNG_1X1);
}

#[tokio::test]
async fn tms_tile_flips_y_before_looking_up_the_xyz_backed_store() {
    let (server, _dir) = test_server().await;
    // z=0 has only one tile, so TMS y=0 and XYZ y=0 are the same row.
    let response = server.get("/tms/1.0.0/world/0/0/0").await;
    response.assert_status_ok();
}

#[tokio::test]
async fn unknown_layer_is_not_found() {
    let (server, _dir) = test_server().await;
    let response = server.get("/xyz/nope/0/0/0").await;
    response.assert_status_not_found();
}

#[tokio::test]
async fn out_of_range_tile_is_no_content() {
    let (server, _dir) = test_server().await;
    let response = server.get("/xyz/world/0/5/5").await;
    response.assert_status(axum::http::StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn wmts_get_capabilities_returns_xml() {
    let (server, _dir) = test_server().await;
    let response = server.get("/wmts").add_query_param("SERVICE", "WMTS").add_query_param("REQUEST", "GetCapabilities").await;
    response.assert_status_ok();
    assert!(response.text().contains("Capabilities"));
}

#[tokio::test]
async fn wmts_get_tile_via_kvp() {
    let (server, _dir) = test_server().await;
    let response = server
        .get("/wmts")
        .add_query_param("REQUEST", "GetTile")
        .add_query_param("LAYER", "world")
        .add_query_param("TILEMATRIX", "0")
        .add_query_param("TILEROW", "0")
        .add_query_param("TILECOL", "0")
        .await;
    response.assert_status_ok();
}

#[tokio::test]
async fn wms_get_capabilities_returns_xml() {
    let (server, _dir) = test_server().await;
    let response = server.get("/wms").add_query_param("SERVICE", "WMS").add_query_param("REQUEST", "GetCapabilities").await;
    response.assert_status_ok();
    assert!(response.text().contains("WMS_Capabilities"));
}

#[tokio::test]
async fn wms_get_map_composites_the_source_into_an_image() {
    let (server, _dir) = test_server().await;
    let response = server
        .get("/wms")
        .add_query_param("REQUEST", "GetMap")
        .add_query_param("VERSION", "1.3.0")
        .add_query_param("CRS", "EPSG:3857")
        .add_query_param("BBOX", "-20037508,-20037508,20037508,20037508")
        .add_query_param("WIDTH", "64")
        .add_query_param("HEIGHT", "64")
        .add_query_param("LAYERS", "world")
        .add_query_param("FORMAT", "image/png")
        .await;
    response.assert_status_ok();
    assert!(!response.as_bytes().is_empty());
}

#[tokio::test]
async fn wms_get_map_with_bad_bbox_reports_an_ogc_exception() {
    let (server, _dir) = test_server().await;
    let response = server
        .get("/wms")
        .add_query_param("REQUEST", "GetMap")
        .add_query_param("VERSION", "1.3.0")
        .add_query_param("CRS", "EPSG:3857")
        .add_query_param("BBOX", "not,a,bbox")
        .add_query_param("WIDTH", "64")
        .add_query_param("HEIGHT", "64")
        .add_query_param("LAYERS", "world")
        .await;
    // WMS errors are always 200 with a ServiceExceptionReport body.
    response.assert_status_ok();
    assert!(response.text().contains("ServiceException"));
}
