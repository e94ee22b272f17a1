use std::fs::File;
use std::io::{BufReader, BufWriter, Seek, Write};
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;
use tiff::ColorType;
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::encoder::TiffEncoder;
use tiff::encoder::compression::{CompressionAlgorithm, Deflate, DeflateLevel};
use tiff::tags::{CompressionMethod, PhotometricInterpretation, SampleFormat, Tag};

use crate::aoi::{Bounds, Crs};

pub const MODEL_PIXEL_SCALE: u16 = 33550;
pub const MODEL_TIEPOINT: u16 = 33922;
pub const MODEL_TRANSFORMATION: u16 = 34264;
pub const GEO_KEY_DIRECTORY: u16 = 34735;
pub const GEO_DOUBLE_PARAMS: u16 = 34736;
pub const GEO_ASCII_PARAMS: u16 = 34737;
pub const GDAL_METADATA: u16 = 42112;
pub const GDAL_NODATA: u16 = 42113;

const KEY_MODEL_TYPE: u16 = 1024;
const KEY_RASTER_TYPE: u16 = 1025;
const KEY_GEOGRAPHIC_TYPE: u16 = 2048;
const KEY_PROJECTED_TYPE: u16 = 3072;
const RASTER_PIXEL_IS_AREA: u16 = 1;
const RASTER_PIXEL_IS_POINT: u16 = 2;
const USER_DEFINED: u16 = 32767;

const OUTPUT_TILE_SIZE: u32 = 256;
const DECODE_LIMIT: usize = 1024 * 1024 * 1024;

static GDAL_ITEM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<Item\s+([^>]*)>\s*([^<]*?)\s*</Item>"#).unwrap()
});
static GDAL_ROLE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"role="([a-z]+)""#).unwrap());

#[derive(Debug, Error)]
pub enum RasterError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TIFF error: {0}")]
    Tiff(#[from] tiff::TiffError),

    #[error("invalid GeoTIFF: {0}")]
    Invalid(String),

    #[error("unsupported raster: {0}")]
    Unsupported(String),
}

/// Affine transform of a north-up raster, anchored at the outer corner of
/// the top-left pixel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoTransform {
    pub origin_x: f64,
    pub origin_y: f64,
    pub pixel_width: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    pub fn pixel_center(&self, col: u32, row: u32) -> (f64, f64) {
        (
            self.origin_x + (f64::from(col) + 0.5) * self.pixel_width,
            self.origin_y - (f64::from(row) + 0.5) * self.pixel_height,
        )
    }

    pub fn world_to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        (
            (x - self.origin_x) / self.pixel_width,
            (self.origin_y - y) / self.pixel_height,
        )
    }

    pub fn bounds(&self, width: u32, height: u32) -> Bounds {
        Bounds {
            min_x: self.origin_x,
            min_y: self.origin_y - f64::from(height) * self.pixel_height,
            max_x: self.origin_x + f64::from(width) * self.pixel_width,
            max_y: self.origin_y,
        }
    }

    pub fn shifted(&self, col: u32, row: u32) -> GeoTransform {
        GeoTransform {
            origin_x: self.origin_x + f64::from(col) * self.pixel_width,
            origin_y: self.origin_y - f64::from(row) * self.pixel_height,
            ..*self
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct GeoKeys {
    pub directory: Vec<u16>,
    pub doubles: Option<Vec<f64>>,
    pub ascii: Option<String>,
}

impl GeoKeys {
    pub fn for_crs(crs: Crs) -> Self {
        let (model_type, crs_key) = if crs.is_geographic() {
            (2, KEY_GEOGRAPHIC_TYPE)
        } else {
            (1, KEY_PROJECTED_TYPE)
        };
        let code = u16::try_from(crs.epsg()).unwrap_or(USER_DEFINED);
        Self {
            directory: vec![
                1, 1, 0, 3,
                KEY_MODEL_TYPE, 0, 1, model_type,
                KEY_RASTER_TYPE, 0, 1, RASTER_PIXEL_IS_AREA,
                crs_key, 0, 1, code,
            ],
            doubles: None,
            ascii: None,
        }
    }

    pub fn value(&self, key: u16) -> Option<u16> {
        self.entries()
            .find(|entry| entry[0] == key && entry[1] == 0)
            .map(|entry| entry[3])
    }

    pub fn crs(&self) -> Option<Crs> {
        [KEY_PROJECTED_TYPE, KEY_GEOGRAPHIC_TYPE]
            .into_iter()
            .filter_map(|key| self.value(key))
            .find(|code| *code != 0)
            .map(|code| Crs::from_epsg(u32::from(code)))
    }

    fn entries(&self) -> impl Iterator<Item = &[u16]> {
        self.directory.get(4..).unwrap_or_default().chunks_exact(4)
    }

    /// Copy with the raster type forced to PixelIsArea, matching a
    /// corner-anchored transform.
    fn with_pixel_is_area(&self) -> Self {
        let mut keys = self.clone();
        if keys.directory.len() < 4 {
            return keys;
        }
        let mut found = false;
        for entry in keys.directory[4..].chunks_exact_mut(4) {
            if entry[0] == KEY_RASTER_TYPE {
                entry[1] = 0;
                entry[2] = 1;
                entry[3] = RASTER_PIXEL_IS_AREA;
                found = true;
            }
        }
        if !found {
            let position = 4 + keys
                .entries()
                .take_while(|entry| entry[0] < KEY_RASTER_TYPE)
                .count()
                * 4;
            keys.directory
                .splice(position..position, [KEY_RASTER_TYPE, 0, 1, RASTER_PIXEL_IS_AREA]);
            keys.directory[3] += 1;
        }
        keys
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RasterInfo {
    pub width: u32,
    pub height: u32,
    pub transform: GeoTransform,
    pub geo_keys: Option<GeoKeys>,
    pub nodata: Option<f64>,
    pub scale: Option<f64>,
    pub offset: Option<f64>,
}

impl RasterInfo {
    pub fn crs(&self) -> Option<Crs> {
        self.geo_keys.as_ref().and_then(GeoKeys::crs)
    }

    pub fn bounds(&self) -> Bounds {
        self.transform.bounds(self.width, self.height)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub col_off: u32,
    pub row_off: u32,
    pub width: u32,
    pub height: u32,
}

pub struct GeoTiffReader {
    decoder: Decoder<BufReader<File>>,
    info: RasterInfo,
}

impl GeoTiffReader {
    pub fn open(path: &Path) -> Result<Self, RasterError> {
        let file = File::open(path)?;
        let mut limits = Limits::default();
        limits.decoding_buffer_size = DECODE_LIMIT;
        limits.intermediate_buffer_size = DECODE_LIMIT;
        limits.ifd_value_size = DECODE_LIMIT;
        let mut decoder = Decoder::new(BufReader::new(file))?.with_limits(limits);

        match decoder.colortype()? {
            ColorType::Gray(_) => {}
            other => {
                return Err(RasterError::Unsupported(format!(
                    "expected a single-band raster, found {other:?}"
                )));
            }
        }

        let (width, height) = decoder.dimensions()?;
        let geo_keys = read_geo_keys(&mut decoder)?;
        let pixel_is_point = geo_keys
            .as_ref()
            .and_then(|keys| keys.value(KEY_RASTER_TYPE))
            == Some(RASTER_PIXEL_IS_POINT);
        let transform = read_transform(&mut decoder, pixel_is_point)?;
        let nodata = decoder
            .get_tag_ascii_string(tag(GDAL_NODATA))
            .ok()
            .and_then(|value| value.trim().trim_end_matches('\0').parse().ok());
        let (scale, offset) = decoder
            .get_tag_ascii_string(tag(GDAL_METADATA))
            .map(|xml| parse_scale_offset(&xml))
            .unwrap_or((None, None));

        Ok(Self {
            decoder,
            info: RasterInfo {
                width,
                height,
                transform,
                geo_keys,
                nodata,
                scale,
                offset,
            },
        })
    }

    pub fn info(&self) -> &RasterInfo {
        &self.info
    }

    /// Read `window` as row-major f64 values, decoding only the strips or
    /// tiles it touches.
    pub fn read_window(&mut self, window: Window) -> Result<Vec<f64>, RasterError> {
        let fits = window.width > 0
            && window.height > 0
            && window.col_off + window.width <= self.info.width
            && window.row_off + window.height <= self.info.height;
        if !fits {
            return Err(RasterError::Invalid(format!(
                "window {window:?} outside {}x{} raster",
                self.info.width, self.info.height
            )));
        }

        let (chunk_width, chunk_height) = self.decoder.chunk_dimensions();
        if chunk_width == 0 || chunk_height == 0 {
            return Err(RasterError::Invalid("zero-sized chunks".to_string()));
        }
        let chunks_across = self.info.width.div_ceil(chunk_width);
        let out_width = window.width as usize;
        let mut out = vec![f64::NAN; out_width * window.height as usize];

        let first_chunk_row = window.row_off / chunk_height;
        let last_chunk_row = (window.row_off + window.height - 1) / chunk_height;
        let first_chunk_col = window.col_off / chunk_width;
        let last_chunk_col = (window.col_off + window.width - 1) / chunk_width;

        for chunk_row in first_chunk_row..=last_chunk_row {
            for chunk_col in first_chunk_col..=last_chunk_col {
                let index = chunk_row * chunks_across + chunk_col;
                let (data_width, data_height) = self.decoder.chunk_data_dimensions(index);
                let values = to_f64(self.decoder.read_chunk(index)?);
                let chunk_x = chunk_col * chunk_width;
                let chunk_y = chunk_row * chunk_height;

                let row_start = window.row_off.max(chunk_y);
                let row_end = (window.row_off + window.height).min(chunk_y + data_height);
                let col_start = window.col_off.max(chunk_x);
                let col_end = (window.col_off + window.width).min(chunk_x + data_width);
                if row_start >= row_end || col_start >= col_end {
                    continue;
                }
                let span = (col_end - col_start) as usize;
                for row in row_start..row_end {
                    let src = ((row - chunk_y) * data_width + (col_start - chunk_x)) as usize;
                    let dst = (row - window.row_off) as usize * out_width
                        + (col_start - window.col_off) as usize;
                    let source = values.get(src..src + span).ok_or_else(|| {
                        RasterError::Invalid(format!("chunk {index} shorter than its dimensions"))
                    })?;
                    out[dst..dst + span].copy_from_slice(source);
                }
            }
        }
        Ok(out)
    }
}

fn tag(code: u16) -> Tag {
    Tag::from_u16_exhaustive(code)
}

fn read_geo_keys<R: std::io::Read + Seek>(
    decoder: &mut Decoder<R>,
) -> Result<Option<GeoKeys>, RasterError> {
    let Ok(directory) = decoder.get_tag_u16_vec(tag(GEO_KEY_DIRECTORY)) else {
        return Ok(None);
    };
    if directory.len() < 4 || directory.len() < 4 + usize::from(directory[3]) * 4 {
        return Err(RasterError::Invalid("truncated GeoKey directory".to_string()));
    }
    Ok(Some(GeoKeys {
        directory,
        doubles: decoder.get_tag_f64_vec(tag(GEO_DOUBLE_PARAMS)).ok(),
        ascii: decoder.get_tag_ascii_string(tag(GEO_ASCII_PARAMS)).ok(),
    }))
}

fn read_transform<R: std::io::Read + Seek>(
    decoder: &mut Decoder<R>,
    pixel_is_point: bool,
) -> Result<GeoTransform, RasterError> {
    let scale = decoder.get_tag_f64_vec(tag(MODEL_PIXEL_SCALE)).ok();
    let tiepoint = decoder.get_tag_f64_vec(tag(MODEL_TIEPOINT)).ok();
    let mut transform = match (scale, tiepoint) {
        (Some(scale), Some(tie)) if scale.len() >= 2 && tie.len() >= 6 => GeoTransform {
            origin_x: tie[3] - tie[0] * scale[0],
            origin_y: tie[4] + tie[1] * scale[1],
            pixel_width: scale[0],
            pixel_height: scale[1],
        },
        _ => {
            let matrix = decoder
                .get_tag_f64_vec(tag(MODEL_TRANSFORMATION))
                .map_err(|_| RasterError::Invalid("no georeferencing tags".to_string()))?;
            if matrix.len() < 8 {
                return Err(RasterError::Invalid("short ModelTransformation".to_string()));
            }
            if matrix[1] != 0.0 || matrix[4] != 0.0 {
                return Err(RasterError::Unsupported("rotated raster".to_string()));
            }
            GeoTransform {
                origin_x: matrix[3],
                origin_y: matrix[7],
                pixel_width: matrix[0],
                pixel_height: -matrix[5],
            }
        }
    };
    if !(transform.pixel_width > 0.0 && transform.pixel_height > 0.0) {
        return Err(RasterError::Unsupported(
            "only north-up rasters with positive pixel size are supported".to_string(),
        ));
    }
    if pixel_is_point {
        transform.origin_x -= transform.pixel_width / 2.0;
        transform.origin_y += transform.pixel_height / 2.0;
    }
    Ok(transform)
}

pub fn parse_scale_offset(xml: &str) -> (Option<f64>, Option<f64>) {
    let mut scale = None;
    let mut offset = None;
    for caps in GDAL_ITEM.captures_iter(xml) {
        let Some(role) = GDAL_ROLE.captures(&caps[1]) else {
            continue;
        };
        let value = caps[2].trim().parse::<f64>().ok();
        match &role[1] {
            "scale" => scale = value,
            "offset" => offset = value,
            _ => {}
        }
    }
    (scale, offset)
}

fn to_f64(result: DecodingResult) -> Vec<f64> {
    match result {
        DecodingResult::F32(data) => data.into_iter().map(f64::from).collect(),
        DecodingResult::F64(data) => data,
        DecodingResult::I8(data) => data.into_iter().map(f64::from).collect(),
        DecodingResult::I16(data) => data.into_iter().map(f64::from).collect(),
        DecodingResult::I32(data) => data.into_iter().map(f64::from).collect(),
        DecodingResult::I64(data) => data.into_iter().map(|v| v as f64).collect(),
        DecodingResult::U8(data) => data.into_iter().map(f64::from).collect(),
        DecodingResult::U16(data) => data.into_iter().map(f64::from).collect(),
        DecodingResult::U32(data) => data.into_iter().map(f64::from).collect(),
        DecodingResult::U64(data) => data.into_iter().map(|v| v as f64).collect(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Raster {
    pub width: u32,
    pub height: u32,
    pub data: Vec<f32>,
    pub transform: GeoTransform,
    pub geo_keys: GeoKeys,
    pub nodata: Option<f64>,
}

pub fn write_geotiff<W: Write + Seek>(writer: W, raster: &Raster) -> Result<(), RasterError> {
    let expected = raster.width as usize * raster.height as usize;
    if raster.data.len() != expected || expected == 0 {
        return Err(RasterError::Invalid(format!(
            "raster data has {} values, expected {expected}",
            raster.data.len()
        )));
    }

    let mut encoder = TiffEncoder::new(writer)?;
    let mut directory = encoder.new_directory()?;
    let tiles_across = raster.width.div_ceil(OUTPUT_TILE_SIZE);
    let tiles_down = raster.height.div_ceil(OUTPUT_TILE_SIZE);
    let fill = raster.nodata.map_or(0.0, |nodata| nodata as f32);

    let mut offsets = Vec::with_capacity((tiles_across * tiles_down) as usize);
    let mut byte_counts = Vec::with_capacity(offsets.capacity());
    for tile_row in 0..tiles_down {
        for tile_col in 0..tiles_across {
            let bytes = encode_tile(raster, tile_col, tile_row, fill)?;
            let offset = directory.write_data(&bytes[..])?;
            offsets.push(u32::try_from(offset).map_err(|_| {
                RasterError::Unsupported("output exceeds the classic TIFF size limit".to_string())
            })?);
            byte_counts.push(u32::try_from(bytes.len()).map_err(|_| {
                RasterError::Unsupported("tile exceeds the classic TIFF size limit".to_string())
            })?);
        }
    }

    directory.write_tag(Tag::ImageWidth, raster.width)?;
    directory.write_tag(Tag::ImageLength, raster.height)?;
    directory.write_tag(Tag::BitsPerSample, 32u16)?;
    directory.write_tag(Tag::Compression, CompressionMethod::Deflate.to_u16())?;
    directory.write_tag(
        Tag::PhotometricInterpretation,
        PhotometricInterpretation::BlackIsZero.to_u16(),
    )?;
    directory.write_tag(Tag::SamplesPerPixel, 1u16)?;
    directory.write_tag(Tag::SampleFormat, SampleFormat::IEEEFP.to_u16())?;
    directory.write_tag(Tag::TileWidth, OUTPUT_TILE_SIZE)?;
    directory.write_tag(Tag::TileLength, OUTPUT_TILE_SIZE)?;
    directory.write_tag(Tag::TileOffsets, &offsets[..])?;
    directory.write_tag(Tag::TileByteCounts, &byte_counts[..])?;

    let transform = &raster.transform;
    let keys = raster.geo_keys.with_pixel_is_area();
    directory.write_tag(
        Tag::Unknown(MODEL_PIXEL_SCALE),
        &[transform.pixel_width, transform.pixel_height, 0.0][..],
    )?;
    directory.write_tag(
        Tag::Unknown(MODEL_TIEPOINT),
        &[0.0, 0.0, 0.0, transform.origin_x, transform.origin_y, 0.0][..],
    )?;
    directory.write_tag(Tag::Unknown(GEO_KEY_DIRECTORY), &keys.directory[..])?;
    if let Some(doubles) = &keys.doubles {
        directory.write_tag(Tag::Unknown(GEO_DOUBLE_PARAMS), &doubles[..])?;
    }
    if let Some(ascii) = &keys.ascii {
        directory.write_tag(Tag::Unknown(GEO_ASCII_PARAMS), ascii.as_str())?;
    }
    if let Some(nodata) = raster.nodata {
        directory.write_tag(Tag::Unknown(GDAL_NODATA), format_nodata(nodata).as_str())?;
    }

    directory.finish()?;
    Ok(())
}

// Edge tiles are padded to full size with `fill`; samples use the writer's
// native byte order, which is also the order of the TIFF header.
fn encode_tile(
    raster: &Raster,
    tile_col: u32,
    tile_row: u32,
    fill: f32,
) -> Result<Vec<u8>, RasterError> {
    let size = OUTPUT_TILE_SIZE as usize;
    let x0 = (tile_col * OUTPUT_TILE_SIZE) as usize;
    let y0 = (tile_row * OUTPUT_TILE_SIZE) as usize;
    let width = raster.width as usize;
    let cols = size.min(width - x0);
    let rows = size.min(raster.height as usize - y0);

    let mut samples = vec![fill; size * size];
    for row in 0..rows {
        let src = (y0 + row) * width + x0;
        samples[row * size..row * size + cols].copy_from_slice(&raster.data[src..src + cols]);
    }
    let raw: Vec<u8> = samples.iter().flat_map(|value| value.to_ne_bytes()).collect();

    let mut compressed = Vec::new();
    Deflate::with_level(DeflateLevel::Balanced).write_to(&mut compressed, &raw)?;
    Ok(compressed)
}

pub fn write_geotiff_file(path: &Path, raster: &Raster) -> Result<(), RasterError> {
    let mut writer = BufWriter::new(File::create(path)?);
    write_geotiff(&mut writer, raster)?;
    let file = writer.into_inner().map_err(|err| err.into_error())?;
    file.sync_all()?;
    Ok(())
}

fn format_nodata(value: f64) -> String {
    if value.is_nan() {
        "nan".to_string()
    } else if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_raster() -> Raster {
        Raster {
            width: 4,
            height: 3,
            data: (0..12).map(|v| v as f32).collect(),
            transform: GeoTransform {
                origin_x: 10.0,
                origin_y: 50.0,
                pixel_width: 0.5,
                pixel_height: 0.5,
            },
            geo_keys: GeoKeys::for_crs(Crs::WGS84),
            nodata: Some(-9999.0),
        }
    }

    #[test]
    fn write_then_read_window() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.tif");
        write_geotiff_file(&path, &sample_raster()).unwrap();

        let mut reader = GeoTiffReader::open(&path).unwrap();
        let info = reader.info().clone();
        assert_eq!((info.width, info.height), (4, 3));
        assert_eq!(info.transform, sample_raster().transform);
        assert_eq!(info.crs(), Some(Crs::WGS84));
        assert_eq!(info.nodata, Some(-9999.0));

        let window = reader
            .read_window(Window {
                col_off: 1,
                row_off: 1,
                width: 2,
                height: 2,
            })
            .unwrap();
        assert_eq!(window, vec![5.0, 6.0, 9.0, 10.0]);
    }

    #[test]
    fn output_is_tiled_across_tile_edges() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiled.tif");
        let (width, height) = (300u32, 260u32);
        let raster = Raster {
            width,
            height,
            data: (0..width * height).map(|v| v as f32).collect(),
            ..sample_raster()
        };
        write_geotiff_file(&path, &raster).unwrap();

        let decoder = Decoder::new(BufReader::new(File::open(&path).unwrap())).unwrap();
        assert_eq!(decoder.chunk_dimensions(), (256, 256));
        assert_eq!(decoder.chunk_data_dimensions(3), (44, 4));

        let mut reader = GeoTiffReader::open(&path).unwrap();
        let window = reader
            .read_window(Window {
                col_off: 254,
                row_off: 255,
                width: 4,
                height: 2,
            })
            .unwrap();
        let expected: Vec<f64> = [255u32, 256]
            .iter()
            .flat_map(|row| (254..258).map(move |col| f64::from(row * width + col)))
            .collect();
        assert_eq!(window, expected);
    }

    #[test]
    fn gdal_metadata_scale_offset() {
        let xml = r#"<GDALMetadata>
  <Item name="OFFSET" sample="0" role="offset">-273.15</Item>
  <Item name="SCALE" sample="0" role="scale">0.1</Item>
</GDALMetadata>"#;
        assert_eq!(parse_scale_offset(xml), (Some(0.1), Some(-273.15)));
        assert_eq!(parse_scale_offset("<GDALMetadata/>"), (None, None));
    }

    #[test]
    fn raster_type_forced_to_area() {
        let keys = GeoKeys {
            directory: vec![1, 1, 0, 2, 1024, 0, 1, 2, 2048, 0, 1, 4326],
            doubles: None,
            ascii: None,
        };
        let normalized = keys.with_pixel_is_area();
        assert_eq!(normalized.directory[3], 3);
        assert_eq!(normalized.value(KEY_RASTER_TYPE), Some(RASTER_PIXEL_IS_AREA));
        assert_eq!(normalized.crs(), Some(Crs::WGS84));
    }

    #[test]
    fn pixel_geometry() {
        let transform = sample_raster().transform;
        assert_eq!(transform.pixel_center(0, 0), (10.25, 49.75));
        assert_eq!(transform.world_to_pixel(11.0, 49.0), (2.0, 2.0));
        assert_eq!(transform.shifted(2, 1).origin_x, 11.0);
    }
}
