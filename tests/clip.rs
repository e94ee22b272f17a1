use std::fs;
use std::path::Path;

use assert_matches::assert_matches;
use camino::{Utf8Path, Utf8PathBuf};

use chelsa_download::aoi::{Aoi, Crs};
use chelsa_download::clip::{AoiClipper, ClipFailure, ClipOutcome, ClipRequest, ClipStage};
use chelsa_download::geotiff::{
    GDAL_METADATA, GDAL_NODATA, GEO_KEY_DIRECTORY, GeoKeys, GeoTiffReader, GeoTransform,
    MODEL_PIXEL_SCALE, MODEL_TIEPOINT, Raster, Window, write_geotiff_file,
};
use tiff::encoder::{TiffEncoder, colortype};
use tiff::tags::Tag;

const SOURCE_SENTINEL: f64 = -32768.0;
const NODATA: f64 = -9999.0;

/// 4x4 WGS84 raster at (10..14, 46..50), values 1..=16 row-major, with the
/// source sentinel at row 0, column 1.
fn write_source(path: &Path) {
    let mut data: Vec<f32> = (1..=16).map(|value| value as f32).collect();
    data[1] = SOURCE_SENTINEL as f32;
    let raster = Raster {
        width: 4,
        height: 4,
        data,
        transform: GeoTransform {
            origin_x: 10.0,
            origin_y: 50.0,
            pixel_width: 1.0,
            pixel_height: 1.0,
        },
        geo_keys: GeoKeys::for_crs(Crs::WGS84),
        nodata: Some(SOURCE_SENTINEL),
    };
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    write_geotiff_file(path, &raster).unwrap();
}

fn triangle_aoi() -> Aoi {
    Aoi::from_geojson(
        r#"{"type":"FeatureCollection","features":[{"type":"Feature","properties":{},
            "geometry":{"type":"Polygon","coordinates":[[[10,50],[12,50],[10,46],[10,50]]]}}]}"#,
    )
    .unwrap()
}

struct Fixture {
    _dir: tempfile::TempDir,
    cache: Utf8PathBuf,
    output: Utf8PathBuf,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let root = Utf8Path::from_path(dir.path()).unwrap().to_path_buf();
    let cache = root.join("cache/present/bio/CHELSA_bio1_1981-2010_V.2.1.tif");
    let output = root.join("out/bio01/CHELSA_bio1_1981-2010_V.2.1_AOI.tif");
    write_source(cache.as_std_path());
    Fixture {
        _dir: dir,
        cache,
        output,
    }
}

fn request<'a>(fixture: &'a Fixture, force: bool) -> ClipRequest<'a> {
    ClipRequest {
        cache_path: fixture.cache.as_std_path(),
        output_path: &fixture.output,
        nodata: NODATA,
        force,
    }
}

#[test]
fn masked_and_outside_pixels_become_configured_nodata() {
    let fixture = fixture();
    let clipper = AoiClipper::new(triangle_aoi());

    let outcome = clipper.clip(&request(&fixture, false)).unwrap();
    assert_matches!(outcome, ClipOutcome::Written { bytes } if bytes > 0);
    assert!(!fixture.cache.as_std_path().exists());

    let mut reader = GeoTiffReader::open(fixture.output.as_std_path()).unwrap();
    let info = reader.info().clone();
    assert_eq!((info.width, info.height), (2, 4));
    assert_eq!(info.nodata, Some(NODATA));
    assert_eq!(info.crs(), Some(Crs::WGS84));
    assert_eq!((info.transform.origin_x, info.transform.origin_y), (10.0, 50.0));

    let values = reader
        .read_window(Window {
            col_off: 0,
            row_off: 0,
            width: 2,
            height: 4,
        })
        .unwrap();
    assert!(values.iter().all(|&value| value != SOURCE_SENTINEL));
    assert_eq!(
        values,
        vec![1.0, NODATA, 5.0, NODATA, 9.0, NODATA, NODATA, NODATA]
    );
}

#[test]
fn second_clip_is_a_no_op() {
    let fixture = fixture();
    let clipper = AoiClipper::new(triangle_aoi());

    clipper.clip(&request(&fixture, false)).unwrap();
    let modified = fs::metadata(fixture.output.as_std_path())
        .unwrap()
        .modified()
        .unwrap();

    // The source is gone; a skip must not need it.
    let outcome = clipper.clip(&request(&fixture, false)).unwrap();
    assert_eq!(outcome, ClipOutcome::Skipped);
    let after = fs::metadata(fixture.output.as_std_path())
        .unwrap()
        .modified()
        .unwrap();
    assert_eq!(modified, after);
}

#[test]
fn force_rewrites_existing_output() {
    let fixture = fixture();
    fs::create_dir_all(fixture.output.parent().unwrap().as_std_path()).unwrap();
    fs::write(fixture.output.as_std_path(), b"stale output").unwrap();
    let clipper = AoiClipper::new(triangle_aoi());

    let outcome = clipper.clip(&request(&fixture, true)).unwrap();
    assert_matches!(outcome, ClipOutcome::Written { .. });
    assert!(GeoTiffReader::open(fixture.output.as_std_path()).is_ok());
}

#[test]
fn disjoint_aoi_keeps_cache_file() {
    let fixture = fixture();
    let far_away = Aoi::from_geojson(
        r#"{"type":"Polygon","coordinates":[[[100,0],[101,0],[101,1],[100,1],[100,0]]]}"#,
    )
    .unwrap();
    let clipper = AoiClipper::new(far_away);

    let failure = clipper.clip(&request(&fixture, false)).unwrap_err();
    assert_eq!(failure, ClipFailure::OutsideExtent);
    assert!(fixture.cache.as_std_path().exists());
    assert!(!fixture.output.as_std_path().exists());
}

#[test]
fn corrupt_source_keeps_cache_file() {
    let fixture = fixture();
    fs::write(fixture.cache.as_std_path(), b"not a tiff").unwrap();
    let clipper = AoiClipper::new(triangle_aoi());

    let failure = clipper.clip(&request(&fixture, false)).unwrap_err();
    assert_matches!(failure, ClipFailure::CorruptSource(_));
    assert!(fixture.cache.as_std_path().exists());
    assert!(!fixture.output.as_std_path().exists());
}

fn read_all(path: &Utf8Path) -> (u32, u32, Vec<f64>) {
    let mut reader = GeoTiffReader::open(path.as_std_path()).unwrap();
    let (width, height) = (reader.info().width, reader.info().height);
    let values = reader
        .read_window(Window {
            col_off: 0,
            row_off: 0,
            width,
            height,
        })
        .unwrap();
    (width, height, values)
}

/// Box around the whole fixture raster, with corners given in `crs`.
fn covering_aoi_in(crs: Crs) -> Aoi {
    let corners = [(9.0, 45.0), (15.0, 45.0), (15.0, 51.0), (9.0, 51.0), (9.0, 45.0)];
    let ring: Vec<String> = corners
        .iter()
        .map(|&(lon, lat)| {
            let (x, y) = Crs::WGS84.transform(crs, lon, lat).unwrap();
            format!("[{x},{y}]")
        })
        .collect();
    Aoi::from_geojson(&format!(
        r#"{{"type":"FeatureCollection",
            "crs":{{"type":"name","properties":{{"name":"urn:ogc:def:crs:EPSG::{}"}}}},
            "features":[{{"type":"Feature","properties":{{}},
            "geometry":{{"type":"Polygon","coordinates":[[{}]]}}}}]}}"#,
        crs.epsg(),
        ring.join(",")
    ))
    .unwrap()
}

#[test]
fn projected_aoi_is_reprojected_to_raster_crs() {
    let fixture = fixture();
    let utm = Crs::from_epsg(32633);
    let aoi = covering_aoi_in(utm);
    assert_eq!(aoi.crs(), utm);
    let clipper = AoiClipper::new(aoi);

    let outcome = clipper.clip(&request(&fixture, false)).unwrap();
    assert_matches!(outcome, ClipOutcome::Written { .. });

    let (width, height, values) = read_all(&fixture.output);
    assert_eq!((width, height), (4, 4));
    let mut expected: Vec<f64> = (1..=16).map(f64::from).collect();
    expected[1] = NODATA;
    assert_eq!(values, expected);
}

/// 2x2 UInt16 raster storing Kelvin * 10 with a GDAL scale/offset to Celsius
/// and 65535 as its sentinel.
fn write_scaled_u16_source(path: &Path, values: &[u16]) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    let file = fs::File::create(path).unwrap();
    let mut encoder = TiffEncoder::new(file).unwrap();
    let mut image = encoder.new_image::<colortype::Gray16>(2, 2).unwrap();
    let directory = image.encoder();
    directory
        .write_tag(Tag::Unknown(MODEL_PIXEL_SCALE), &[1.0f64, 1.0, 0.0][..])
        .unwrap();
    directory
        .write_tag(
            Tag::Unknown(MODEL_TIEPOINT),
            &[0.0f64, 0.0, 0.0, 10.0, 50.0, 0.0][..],
        )
        .unwrap();
    directory
        .write_tag(
            Tag::Unknown(GEO_KEY_DIRECTORY),
            &GeoKeys::for_crs(Crs::WGS84).directory[..],
        )
        .unwrap();
    directory
        .write_tag(Tag::Unknown(GDAL_NODATA), "65535")
        .unwrap();
    directory
        .write_tag(
            Tag::Unknown(GDAL_METADATA),
            r#"<GDALMetadata>
  <Item name="SCALE" sample="0" role="scale">0.1</Item>
  <Item name="OFFSET" sample="0" role="offset">-273.15</Item>
</GDALMetadata>"#,
        )
        .unwrap();
    image.write_data(values).unwrap();
}

#[test]
fn integer_source_is_scaled_and_sentinel_checked_on_raw_values() {
    let fixture = fixture();
    let raw = [2932u16, 65535, 2731, 3032];
    write_scaled_u16_source(fixture.cache.as_std_path(), &raw);
    let clipper = AoiClipper::new(covering_aoi_in(Crs::WGS84));

    clipper.clip(&request(&fixture, false)).unwrap();

    let (width, height, values) = read_all(&fixture.output);
    assert_eq!((width, height), (2, 2));
    assert_eq!(values[1], NODATA);
    for (index, celsius) in [(0, 20.05), (2, -0.05), (3, 30.05)] {
        assert!(
            (values[index] - celsius).abs() < 1e-3,
            "pixel {index}: {} != {celsius}",
            values[index]
        );
    }
}
