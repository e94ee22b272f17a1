use std::fs;
use std::path::Path;

use camino::Utf8Path;
use serde::Serialize;
use tempfile::Builder;
use thiserror::Error;
use tracing::{debug, warn};

use crate::aoi::{Aoi, Crs};
use crate::error::ChelsaError;
use crate::geotiff::{self, GeoKeys, GeoTiffReader, Raster, RasterError, Window};

pub const DEFAULT_RASTER_CRS: Crs = Crs::WGS84;

#[derive(Debug, Clone)]
pub struct ClipRequest<'a> {
    pub cache_path: &'a Path,
    pub output_path: &'a Utf8Path,
    pub nodata: f64,
    pub force: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipOutcome {
    Written { bytes: u64 },
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[serde(tag = "reason", content = "message", rename_all = "snake_case")]
pub enum ClipFailure {
    #[error("corrupt or unreadable source: {0}")]
    CorruptSource(String),

    #[error("AOI does not overlap the raster extent")]
    OutsideExtent,

    #[error("{0}")]
    UnsupportedCrs(String),

    #[error("failed to write output: {0}")]
    Write(String),
}

impl From<RasterError> for ClipFailure {
    fn from(err: RasterError) -> Self {
        ClipFailure::CorruptSource(err.to_string())
    }
}

pub trait ClipStage: Send + Sync {
    fn clip(&self, request: &ClipRequest<'_>) -> Result<ClipOutcome, ClipFailure>;
}

pub struct AoiClipper {
    aoi: Aoi,
}

impl AoiClipper {
    pub fn new(aoi: Aoi) -> Self {
        Self { aoi }
    }

    fn clip_to_raster(&self, request: &ClipRequest<'_>) -> Result<Raster, ClipFailure> {
        let mut reader = GeoTiffReader::open(request.cache_path)?;
        let info = reader.info().clone();
        let raster_crs = match info.crs() {
            Some(crs) => crs,
            None => {
                debug!(
                    path = %request.cache_path.display(),
                    "raster has no CRS, assuming {DEFAULT_RASTER_CRS}"
                );
                DEFAULT_RASTER_CRS
            }
        };
        let aoi = self.aoi.to_crs(raster_crs).map_err(|err| match err {
            ChelsaError::UnsupportedCrs { from, to } => {
                ClipFailure::UnsupportedCrs(format!("cannot reproject AOI from {from} to {to}"))
            }
            other => ClipFailure::UnsupportedCrs(other.to_string()),
        })?;

        let overlap = aoi
            .bounds()
            .and_then(|bounds| bounds.intersection(&info.bounds()))
            .ok_or(ClipFailure::OutsideExtent)?;
        let top_left = info.transform.world_to_pixel(overlap.min_x, overlap.max_y);
        let bottom_right = info.transform.world_to_pixel(overlap.max_x, overlap.min_y);
        let window = pixel_window(top_left, bottom_right, info.width, info.height)
            .ok_or(ClipFailure::OutsideExtent)?;

        let source = reader.read_window(window)?;
        let transform = info.transform.shifted(window.col_off, window.row_off);
        let scale = info.scale.unwrap_or(1.0);
        let offset = info.offset.unwrap_or(0.0);
        let source_nodata = info.nodata;
        let nodata = request.nodata;

        let mut data = Vec::with_capacity(source.len());
        for row in 0..window.height {
            let (_, y) = transform.pixel_center(0, row);
            let spans = aoi.row_spans(y);
            let start = row as usize * window.width as usize;
            let row_values = &source[start..start + window.width as usize];
            for (col, &raw) in row_values.iter().enumerate() {
                let masked = raw.is_nan() || source_nodata.is_some_and(|sentinel| raw == sentinel);
                let (x, _) = transform.pixel_center(col as u32, row);
                let inside = spans.iter().any(|&(start, end)| x >= start && x < end);
                let value = if masked || !inside {
                    nodata
                } else {
                    raw * scale + offset
                };
                data.push(value as f32);
            }
        }

        Ok(Raster {
            width: window.width,
            height: window.height,
            data,
            transform,
            geo_keys: info
                .geo_keys
                .clone()
                .unwrap_or_else(|| GeoKeys::for_crs(raster_crs)),
            nodata: Some(nodata),
        })
    }

    fn write_output(&self, output_path: &Utf8Path, raster: &Raster) -> Result<u64, ClipFailure> {
        let write_err = |err: &dyn std::fmt::Display| ClipFailure::Write(format!("{output_path}: {err}"));
        let parent = output_path
            .parent()
            .ok_or_else(|| ClipFailure::Write(format!("invalid output path {output_path}")))?;
        fs::create_dir_all(parent.as_std_path()).map_err(|err| write_err(&err))?;
        let temp = Builder::new()
            .prefix(".chelsa-clip")
            .suffix(".tif")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| write_err(&err))?;
        geotiff::write_geotiff_file(temp.path(), raster).map_err(|err| write_err(&err))?;

        if output_path.as_std_path().exists() {
            fs::remove_file(output_path.as_std_path()).map_err(|err| write_err(&err))?;
        }
        let file = temp
            .persist(output_path.as_std_path())
            .map_err(|err| write_err(&err.error))?;
        let bytes = file.metadata().map(|meta| meta.len()).unwrap_or(0);
        Ok(bytes)
    }
}

impl ClipStage for AoiClipper {
    fn clip(&self, request: &ClipRequest<'_>) -> Result<ClipOutcome, ClipFailure> {
        if !request.force && output_satisfied(request.output_path) {
            return Ok(ClipOutcome::Skipped);
        }
        let raster = self.clip_to_raster(request)?;
        let bytes = self.write_output(request.output_path, &raster)?;
        if let Err(err) = fs::remove_file(request.cache_path) {
            warn!(path = %request.cache_path.display(), "failed to remove cache file: {err}");
        }
        debug!(output = %request.output_path, bytes, "clipped output written");
        Ok(ClipOutcome::Written { bytes })
    }
}

pub fn output_satisfied(path: &Utf8Path) -> bool {
    fs::metadata(path.as_std_path())
        .map(|meta| meta.is_file() && meta.len() > 0)
        .unwrap_or(false)
}

fn pixel_window(
    top_left: (f64, f64),
    bottom_right: (f64, f64),
    width: u32,
    height: u32,
) -> Option<Window> {
    let clamp = |value: f64, max: u32| value.clamp(0.0, f64::from(max)) as u32;
    let col_start = clamp(top_left.0.floor(), width);
    let row_start = clamp(top_left.1.floor(), height);
    let col_end = clamp(bottom_right.0.ceil(), width);
    let row_end = clamp(bottom_right.1.ceil(), height);
    (col_end > col_start && row_end > row_start).then_some(Window {
        col_off: col_start,
        row_off: row_start,
        width: col_end - col_start,
        height: row_end - row_start,
    })
}
