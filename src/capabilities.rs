//! Capabilities model and XML generation (C8, §4.8): derives per-source
//! layer metadata and renders TMS/WMTS/WMS capabilities documents from it.

use std::fmt::Write as _;

use crate::sources::{SourceMetadata, TileFormat};

/// Scale denominators per zoom level for 256px tiles at 0.28mm/pixel (OGC).
const SCALE_DENOMINATORS_256: [f64; 23] = [
    559082264.02872,
    279541132.01436,
    139770566.00718,
    69885283.00359,
    34942641.501795,
    17471320.750897,
    8735660.3754487,
    4367830.1877244,
    2183915.0938622,
    1091957.5469311,
    545978.77346554,
    272989.38673277,
    136494.69336639,
    68247.346683193,
    34123.673341597,
    17061.836670798,
    8530.9183353991,
    4265.4591676996,
    2132.7295838498,
    1066.3647919249,
    533.18239596246,
    266.59119798123,
    133.29559899061,
];

/// A layer as exposed by the capabilities documents, §4.8.
pub struct LayerInfo<'a> {
    pub id: &'a str,
    pub title: &'a str,
    pub abstract_text: Option<&'a str>,
    pub formats: Vec<TileFormat>,
    pub min_zoom: u8,
    pub max_zoom: u8,
    pub bounds_wgs84: (f64, f64, f64, f64),
    pub supports_epsg4326: bool,
}

impl<'a> LayerInfo<'a> {
    pub fn from_metadata(meta: &'a SourceMetadata) -> Self {
        let bounds_wgs84 = meta
            .geographical_bounds
            .as_ref()
            .map(|b| (b.min_lon, b.min_lat, b.max_lon, b.max_lat))
            .unwrap_or((-180.0, -85.05112878, 180.0, 85.05112878));
        Self {
            id: &meta.id,
            title: &meta.title,
            abstract_text: meta.abstract_text.as_deref(),
            formats: vec![meta.format],
            min_zoom: meta.min_zoom,
            max_zoom: meta.max_zoom,
            bounds_wgs84,
            supports_epsg4326: true,
        }
    }
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;").replace('"', "&quot;")
}

/// TMS `GetCapabilities`-equivalent root document (`/tms/1.0.0`).
pub fn tms_root_capabilities(base_url: &str, layers: &[LayerInfo]) -> String {
    let mut xml = String::with_capacity(2048);
    xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<TileMapService version=\"1.0.0\">\n  <TileMaps>\n");
    for layer in layers {
        let _ = writeln!(
            xml,
            "    <TileMap title=\"{title}\" srs=\"EPSG:3857\" href=\"{base}/tms/1.0.0/{id}\"/>",
            title = xml_escape(layer.title),
            base = base_url,
            id = layer.id,
        );
    }
    xml.push_str("  </TileMaps>\n</TileMapService>\n");
    xml
}

/// TMS per-layer document (`/tms/1.0.0/{layer}`).
pub fn tms_layer_capabilities(base_url: &str, layer: &LayerInfo) -> String {
    let (min_lon, min_lat, max_lon, max_lat) = layer.bounds_wgs84;
    let mut xml = String::with_capacity(2048);
    let _ = write!(
        xml,
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <TileMap version=\"1.0.0\" tilemapservice=\"{base}/tms/1.0.0\">\n  \
         <Title>{title}</Title>\n  \
         <Abstract>{abstract}</Abstract>\n  \
         <SRS>EPSG:3857</SRS>\n  \
         <BoundingBox minx=\"{min_lon}\" miny=\"{min_lat}\" maxx=\"{max_lon}\" maxy=\"{max_lat}\"/>\n  \
         <TileFormat width=\"256\" height=\"256\" mime-type=\"{mime}\" extension=\"{ext}\"/>\n  \
         <TileSets profile=\"mercator\">\n",
        base = base_url,
        title = xml_escape(layer.title),
        abstract = xml_escape(layer.abstract_text.unwrap_or_default()),
        mime = layer.formats[0].content_type(),
        ext = format_extension(layer.formats[0]),
    );
    for z in layer.min_zoom..=layer.max_zoom {
        let scale = SCALE_DENOMINATORS_256.get(z as usize).copied().unwrap_or(0.0);
        let _ = writeln!(
            xml,
            "    <TileSet href=\"{base}/tms/1.0.0/{id}/{z}\" units-per-pixel=\"{upp}\" order=\"{z}\"/>",
            base = base_url,
            id = layer.id,
            upp = scale * 0.00028,
        );
    }
    xml.push_str("  </TileSets>\n</TileMap>\n");
    xml
}

fn format_extension(format: TileFormat) -> &'static str {
    match format {
        TileFormat::Png => "png",
        TileFormat::Jpg => "jpg",
        TileFormat::Pbf => "pbf",
        TileFormat::Webp => "webp",
        TileFormat::Tiff => "tif",
    }
}

/// WMTS `GetCapabilities` document, REST-only (`/wmts`).
pub fn wmts_capabilities(base_url: &str, service_title: &str, layers: &[LayerInfo]) -> String {
    let mut xml = String::with_capacity(8192);
    xml.push_str(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <Capabilities xmlns=\"http://www.opengis.net/wmts/1.0\" xmlns:ows=\"http://www.opengis.net/ows/1.1\" \
         xmlns:xlink=\"http://www.w3.org/1999/xlink\" version=\"1.0.0\">\n",
    );
    let _ = writeln!(xml, "  <ows:ServiceIdentification>\n    <ows:Title>{}</ows:Title>\n    <ows:ServiceType>OGC WMTS</ows:ServiceType>\n    <ows:ServiceTypeVersion>1.0.0</ows:ServiceTypeVersion>\n  </ows:ServiceIdentification>", xml_escape(service_title));
    xml.push_str("  <Contents>\n");
    for layer in layers {
        write_wmts_layer(&mut xml, base_url, layer);
    }
    write_tile_matrix_set(&mut xml, layers.iter().map(|l| l.max_zoom).max().unwrap_or(0));
    xml.push_str("  </Contents>\n</Capabilities>\n");
    xml
}

fn write_wmts_layer(xml: &mut String, base_url: &str, layer: &LayerInfo) {
    let (min_lon, min_lat, max_lon, max_lat) = layer.bounds_wgs84;
    let template = format!(
        "{base}/wmts/tile/1.0.0/{id}/default/GoogleMapsCompatible/{{TileMatrix}}/{{TileRow}}/{{TileCol}}.{ext}",
        base = base_url,
        id = layer.id,
        ext = format_extension(layer.formats[0]),
    );
    let _ = write!(
        xml,
        "    <Layer>\n      <ows:Title>{title}</ows:Title>\n      <ows:Identifier>{id}</ows:Identifier>\n      \
         <ows:WGS84BoundingBox>\n        <ows:LowerCorner>{min_lon} {min_lat}</ows:LowerCorner>\n        \
         <ows:UpperCorner>{max_lon} {max_lat}</ows:UpperCorner>\n      </ows:WGS84BoundingBox>\n      \
         <Style isDefault=\"true\"><ows:Identifier>default</ows:Identifier></Style>\n      \
         <Format>{mime}</Format>\n      \
         <TileMatrixSetLink><TileMatrixSet>GoogleMapsCompatible</TileMatrixSet></TileMatrixSetLink>\n      \
         <ResourceURL format=\"{mime}\" resourceType=\"tile\" template=\"{template}\"/>\n    </Layer>\n",
        title = xml_escape(layer.title),
        id = layer.id,
        mime = layer.formats[0].content_type(),
        template = template,
    );
}

fn write_tile_matrix_set(xml: &mut String, max_zoom: u8) {
    xml.push_str(
        "    <TileMatrixSet>\n      <ows:Identifier>GoogleMapsCompatible</ows:Identifier>\n      \
         <ows:SupportedCRS>urn:ogc:def:crs:EPSG::3857</ows:SupportedCRS>\n",
    );
    for (z, &scale) in SCALE_DENOMINATORS_256.iter().enumerate().take(max_zoom as usize + 1) {
        let matrix_size = 1u32 << z;
        let _ = write!(
            xml,
            "      <TileMatrix>\n        <ows:Identifier>{z}</ows:Identifier>\n        \
             <ScaleDenominator>{scale}</ScaleDenominator>\n        \
             <TopLeftCorner>-20037508.342789244 20037508.342789244</TopLeftCorner>\n        \
             <TileWidth>256</TileWidth>\n        <TileHeight>256</TileHeight>\n        \
             <MatrixWidth>{matrix_size}</MatrixWidth>\n        <MatrixHeight>{matrix_size}</MatrixHeight>\n      \
             </TileMatrix>\n",
        );
    }
    xml.push_str("    </TileMatrixSet>\n");
}

/// WMS `GetCapabilities` document (`/wms`), version 1.3.0.
pub fn wms_capabilities(base_url: &str, service_title: &str, layers: &[LayerInfo]) -> String {
    let mut xml = String::with_capacity(8192);
    let _ = write!(
        xml,
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <WMS_Capabilities version=\"1.3.0\" xmlns=\"http://www.opengis.net/wms\">\n  \
         <Service>\n    <Name>WMS</Name>\n    <Title>{title}</Title>\n  </Service>\n  \
         <Capability>\n    <Request>\n      <GetCapabilities/>\n      <GetMap/>\n    </Request>\n    <Layer>\n      \
         <Title>{title}</Title>\n      <CRS>EPSG:3857</CRS>\n      <CRS>EPSG:4326</CRS>\n",
        title = xml_escape(service_title),
    );
    for layer in layers {
        write_wms_layer(&mut xml, layer);
    }
    xml.push_str("    </Layer>\n  </Capability>\n</WMS_Capabilities>\n");
    xml
}

fn write_wms_layer(xml: &mut String, layer: &LayerInfo) {
    let (min_lon, min_lat, max_lon, max_lat) = layer.bounds_wgs84;
    let _ = write!(
        xml,
        "      <Layer queryable=\"0\">\n        <Name>{id}</Name>\n        <Title>{title}</Title>\n        \
         <CRS>EPSG:3857</CRS>\n        <CRS>EPSG:4326</CRS>\n        \
         <EX_GeographicBoundingBox>\n          <westBoundLongitude>{min_lon}</westBoundLongitude>\n          \
         <eastBoundLongitude>{max_lon}</eastBoundLongitude>\n          \
         <southBoundLatitude>{min_lat}</southBoundLatitude>\n          \
         <northBoundLatitude>{max_lat}</northBoundLatitude>\n        </EX_GeographicBoundingBox>\n      </Layer>\n",
        id = layer.id,
        title = xml_escape(layer.title),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::{GeoBoundsDto, SourceType};

    fn sample_metadata() -> SourceMetadata {
        SourceMetadata {
            id: "world".into(),
            source_type: SourceType::Mbtiles,
            title: "World <basemap>".into(),
            abstract_text: Some("A sample layer".into()),
            format: TileFormat::Png,
            content_type: "image/png".into(),
            min_zoom: 0,
            max_zoom: 5,
            srs: "EPSG:3857".into(),
            geographical_bounds: Some(GeoBoundsDto { min_lon: -180.0, min_lat: -85.0, max_lon: 180.0, max_lat: 85.0 }),
        }
    }

    #[test]
    fn tms_root_lists_every_layer() {
        let meta = sample_metadata();
        let layer = LayerInfo::from_metadata(&meta);
        let xml = tms_root_capabilities("http://localhost:8080", &[layer]);
        assert!(xml.contains("href=\"http://localhost:8080/tms/1.0.0/world\""));
    }

    #[test]
    fn xml_special_characters_are_escaped() {
        let meta = sample_metadata();
        let layer = LayerInfo::from_metadata(&meta);
        let xml = tms_layer_capabilities("http://localhost:8080", &layer);
        assert!(xml.contains("World &lt;basemap&gt;"));
    }

    #[test]
    fn wmts_capabilities_includes_tile_matrix_for_every_zoom() {
        let meta = sample_metadata();
        let layer = LayerInfo::from_metadata(&meta);
        let xml = wmts_capabilities("http://localhost:8080", "Test Service", &[layer]);
        for z in 0..=5 {
            assert!(xml.contains(&format!("<ows:Identifier>{z}</ows:Identifier>")));
        }
    }
}
