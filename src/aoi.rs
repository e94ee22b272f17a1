use std::fmt;
use std::fs;

use camino::Utf8Path;
use proj4rs::proj::Proj;
use serde_json::Value;

use crate::error::ChelsaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Crs(u32);

impl Crs {
    pub const WGS84: Crs = Crs(4326);
    pub const WEB_MERCATOR: Crs = Crs(3857);

    pub fn from_epsg(code: u32) -> Self {
        // 900913 is the legacy alias of web mercator
        match code {
            900913 | 3785 | 102100 => Crs::WEB_MERCATOR,
            code => Crs(code),
        }
    }

    pub fn epsg(self) -> u32 {
        self.0
    }

    pub fn is_geographic(self) -> bool {
        self == Crs::WGS84 || self.proj().is_ok_and(|proj| proj.is_latlong())
    }

    pub fn parse_name(name: &str) -> Option<Self> {
        let upper = name.trim().to_ascii_uppercase();
        if upper.ends_with("CRS84") {
            return Some(Crs::WGS84);
        }
        let digits: String = upper
            .chars()
            .rev()
            .take_while(|ch| ch.is_ascii_digit())
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        if !upper.contains("EPSG") || digits.is_empty() {
            return None;
        }
        digits.parse().ok().map(Crs::from_epsg)
    }

    fn proj(self) -> Result<Proj, String> {
        let code = u16::try_from(self.0).map_err(|_| format!("{self} is not a known EPSG code"))?;
        Proj::from_epsg_code(code).map_err(|err| format!("{self}: {err}"))
    }

    pub fn transform(self, target: Crs, x: f64, y: f64) -> Result<(f64, f64), ChelsaError> {
        CrsTransform::new(self, target)?.apply(x, y)
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EPSG:{}", self.0)
    }
}

pub struct CrsTransform {
    from: Crs,
    to: Crs,
    projections: Option<(Proj, Proj)>,
}

impl CrsTransform {
    pub fn new(from: Crs, to: Crs) -> Result<Self, ChelsaError> {
        if from == to {
            return Ok(Self {
                from,
                to,
                projections: None,
            });
        }
        let unsupported = |_| ChelsaError::UnsupportedCrs {
            from: from.to_string(),
            to: to.to_string(),
        };
        let source = from.proj().map_err(unsupported)?;
        let target = to.proj().map_err(unsupported)?;
        Ok(Self {
            from,
            to,
            projections: Some((source, target)),
        })
    }

    pub fn apply(&self, x: f64, y: f64) -> Result<(f64, f64), ChelsaError> {
        let Some((source, target)) = &self.projections else {
            return Ok((x, y));
        };
        let mut point = if source.is_latlong() {
            (x.to_radians(), y.to_radians(), 0.0)
        } else {
            (x, y, 0.0)
        };
        proj4rs::transform::transform(source, target, &mut point).map_err(|err| {
            ChelsaError::Reprojection(format!("({x}, {y}) from {} to {}: {err}", self.from, self.to))
        })?;
        let (out_x, out_y) = if target.is_latlong() {
            (point.0.to_degrees(), point.1.to_degrees())
        } else {
            (point.0, point.1)
        };
        if !(out_x.is_finite() && out_y.is_finite()) {
            return Err(ChelsaError::Reprojection(format!(
                "({x}, {y}) has no finite position in {}",
                self.to
            )));
        }
        Ok((out_x, out_y))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Bounds {
    pub fn intersection(&self, other: &Bounds) -> Option<Bounds> {
        let bounds = Bounds {
            min_x: self.min_x.max(other.min_x),
            min_y: self.min_y.max(other.min_y),
            max_x: self.max_x.min(other.max_x),
            max_y: self.max_y.min(other.max_y),
        };
        (bounds.min_x < bounds.max_x && bounds.min_y < bounds.max_y).then_some(bounds)
    }

    fn extend(&mut self, x: f64, y: f64) {
        self.min_x = self.min_x.min(x);
        self.min_y = self.min_y.min(y);
        self.max_x = self.max_x.max(x);
        self.max_y = self.max_y.max(y);
    }
}

type Ring = Vec<[f64; 2]>;

#[derive(Debug, Clone, PartialEq)]
pub struct Polygon {
    pub rings: Vec<Ring>,
}

impl Polygon {
    fn row_crossings(&self, y: f64, out: &mut Vec<f64>) {
        for ring in &self.rings {
            for (index, a) in ring.iter().enumerate() {
                let b = ring[(index + 1) % ring.len()];
                // half-open so a vertex on the scanline is counted once
                if (a[1] <= y) != (b[1] <= y) {
                    out.push(a[0] + (y - a[1]) * (b[0] - a[0]) / (b[1] - a[1]));
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Aoi {
    crs: Crs,
    polygons: Vec<Polygon>,
}

impl Aoi {
    /// Load a GeoJSON geometry, Feature or FeatureCollection. Coordinates are
    /// WGS84 unless a legacy `crs` member names another EPSG code.
    pub fn load(path: &Utf8Path) -> Result<Self, ChelsaError> {
        let aoi_err = |message: String| ChelsaError::Aoi {
            path: path.to_string(),
            message,
        };
        let content = fs::read_to_string(path.as_std_path()).map_err(|err| aoi_err(err.to_string()))?;
        Self::from_geojson(&content).map_err(aoi_err)
    }

    pub fn from_geojson(content: &str) -> Result<Self, String> {
        let value: Value = serde_json::from_str(content).map_err(|err| err.to_string())?;
        let crs = match value.pointer("/crs/properties/name").and_then(Value::as_str) {
            Some(name) => Crs::parse_name(name).ok_or_else(|| format!("unrecognised crs {name}"))?,
            None => Crs::WGS84,
        };
        let mut polygons = Vec::new();
        collect_polygons(&value, &mut polygons)?;
        if polygons.is_empty() {
            return Err("no polygon geometry found".to_string());
        }
        Ok(Self { crs, polygons })
    }

    pub fn crs(&self) -> Crs {
        self.crs
    }

    pub fn bounds(&self) -> Option<Bounds> {
        let mut points = self
            .polygons
            .iter()
            .flat_map(|polygon| polygon.rings.iter().flatten());
        let first = points.next()?;
        let mut bounds = Bounds {
            min_x: first[0],
            min_y: first[1],
            max_x: first[0],
            max_y: first[1],
        };
        for point in points {
            bounds.extend(point[0], point[1]);
        }
        Some(bounds)
    }

    pub fn to_crs(&self, target: Crs) -> Result<Aoi, ChelsaError> {
        if target == self.crs {
            return Ok(self.clone());
        }
        let transform = CrsTransform::new(self.crs, target)?;
        let polygons = self
            .polygons
            .iter()
            .map(|polygon| {
                let rings = polygon
                    .rings
                    .iter()
                    .map(|ring| {
                        ring.iter()
                            .map(|point| transform.apply(point[0], point[1]).map(|(x, y)| [x, y]))
                            .collect::<Result<Ring, _>>()
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Polygon { rings })
            })
            .collect::<Result<Vec<_>, ChelsaError>>()?;
        Ok(Aoi {
            crs: target,
            polygons,
        })
    }

    /// Intervals of x inside the AOI along the horizontal line at `y`,
    /// sorted and non-overlapping.
    pub fn row_spans(&self, y: f64) -> Vec<(f64, f64)> {
        let mut spans = Vec::new();
        let mut crossings = Vec::new();
        for polygon in &self.polygons {
            crossings.clear();
            polygon.row_crossings(y, &mut crossings);
            crossings.sort_by(f64::total_cmp);
            spans.extend(crossings.chunks_exact(2).map(|pair| (pair[0], pair[1])));
        }
        spans.sort_by(|a, b| a.0.total_cmp(&b.0));

        let mut merged: Vec<(f64, f64)> = Vec::with_capacity(spans.len());
        for (start, end) in spans {
            match merged.last_mut() {
                Some(last) if start <= last.1 => last.1 = last.1.max(end),
                _ => merged.push((start, end)),
            }
        }
        merged
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        self.row_spans(y)
            .iter()
            .any(|&(start, end)| x >= start && x < end)
    }
}

fn collect_polygons(value: &Value, out: &mut Vec<Polygon>) -> Result<(), String> {
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| "GeoJSON object without type".to_string())?;
    match kind {
        "FeatureCollection" => {
            let features = value
                .get("features")
                .and_then(Value::as_array)
                .ok_or_else(|| "FeatureCollection without features".to_string())?;
            for feature in features {
                collect_polygons(feature, out)?;
            }
        }
        "Feature" => match value.get("geometry") {
            Some(Value::Null) | None => {}
            Some(geometry) => collect_polygons(geometry, out)?,
        },
        "GeometryCollection" => {
            let geometries = value
                .get("geometries")
                .and_then(Value::as_array)
                .ok_or_else(|| "GeometryCollection without geometries".to_string())?;
            for geometry in geometries {
                collect_polygons(geometry, out)?;
            }
        }
        "Polygon" => out.push(parse_polygon(coordinates(value)?)?),
        "MultiPolygon" => {
            let polygons = coordinates(value)?
                .as_array()
                .ok_or_else(|| "MultiPolygon coordinates must be an array".to_string())?;
            for polygon in polygons {
                out.push(parse_polygon(polygon)?);
            }
        }
        other => return Err(format!("unsupported geometry type {other}")),
    }
    Ok(())
}

fn coordinates(value: &Value) -> Result<&Value, String> {
    value
        .get("coordinates")
        .ok_or_else(|| "geometry without coordinates".to_string())
}

fn parse_polygon(value: &Value) -> Result<Polygon, String> {
    let rings = value
        .as_array()
        .ok_or_else(|| "polygon coordinates must be an array of rings".to_string())?
        .iter()
        .map(parse_ring)
        .collect::<Result<Vec<_>, _>>()?;
    if rings.is_empty() {
        return Err("polygon without rings".to_string());
    }
    Ok(Polygon { rings })
}

fn parse_ring(value: &Value) -> Result<Ring, String> {
    let mut ring = value
        .as_array()
        .ok_or_else(|| "ring must be an array of positions".to_string())?
        .iter()
        .map(|position| match position.as_array().map(Vec::as_slice) {
            Some([x, y, ..]) => match (x.as_f64(), y.as_f64()) {
                (Some(x), Some(y)) => Ok([x, y]),
                _ => Err("non-numeric coordinate".to_string()),
            },
            _ => Err("position needs at least two coordinates".to_string()),
        })
        .collect::<Result<Ring, _>>()?;
    if ring.len() > 1 && ring.first() == ring.last() {
        ring.pop();
    }
    if ring.len() < 3 {
        return Err("ring needs at least three distinct positions".to_string());
    }
    Ok(ring)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SQUARE_WITH_HOLE: &str = r#"{
        "type": "FeatureCollection",
        "features": [{
            "type": "Feature",
            "properties": {},
            "geometry": {
                "type": "Polygon",
                "coordinates": [
                    [[0, 0], [10, 0], [10, 10], [0, 10], [0, 0]],
                    [[4, 4], [6, 4], [6, 6], [4, 6], [4, 4]]
                ]
            }
        }]
    }"#;

    #[test]
    fn point_in_polygon_honours_holes() {
        let aoi = Aoi::from_geojson(SQUARE_WITH_HOLE).unwrap();
        assert_eq!(aoi.crs(), Crs::WGS84);
        assert!(aoi.contains(1.0, 1.0));
        assert!(!aoi.contains(5.0, 5.0));
        assert!(!aoi.contains(11.0, 5.0));
        assert_eq!(
            aoi.bounds(),
            Some(Bounds {
                min_x: 0.0,
                min_y: 0.0,
                max_x: 10.0,
                max_y: 10.0
            })
        );
    }

    #[test]
    fn utm_round_trip() {
        let utm = Crs::from_epsg(32633);
        assert!(!utm.is_geographic());
        let (x, y) = Crs::WGS84.transform(utm, 15.0, 0.0).unwrap();
        assert!((x - 500_000.0).abs() < 1e-3);
        assert!(y.abs() < 1e-3);

        let (x, y) = Crs::WGS84.transform(utm, 12.5, 47.25).unwrap();
        let (lon, lat) = utm.transform(Crs::WGS84, x, y).unwrap();
        assert!((lon - 12.5).abs() < 1e-7);
        assert!((lat - 47.25).abs() < 1e-7);
    }

    #[test]
    fn unknown_epsg_code_is_unsupported() {
        let err = Crs::WGS84.transform(Crs::from_epsg(1), 0.0, 0.0).unwrap_err();
        assert!(matches!(err, ChelsaError::UnsupportedCrs { .. }));
        assert!(CrsTransform::new(Crs::from_epsg(70_000), Crs::WGS84).is_err());
    }

    #[test]
    fn crs_names() {
        assert_eq!(Crs::parse_name("urn:ogc:def:crs:OGC:1.3:CRS84"), Some(Crs::WGS84));
        assert_eq!(Crs::parse_name("urn:ogc:def:crs:EPSG::3857"), Some(Crs::WEB_MERCATOR));
        assert_eq!(Crs::parse_name("EPSG:900913"), Some(Crs::WEB_MERCATOR));
        assert_eq!(Crs::parse_name("local"), None);
    }

    #[test]
    fn rejects_non_polygon_input() {
        assert!(Aoi::from_geojson(r#"{"type":"Point","coordinates":[0,0]}"#).is_err());
        assert!(Aoi::from_geojson(r#"{"type":"FeatureCollection","features":[]}"#).is_err());
    }
}
