//! Point decoding and quadkey tile geometry.
//!
//! Outage markers arrive as Google encoded polylines (latitude first on the
//! wire) and tiles are addressed by Bing-style quadkeys. Coordinates are always
//! carried in named-field structs so that longitude/latitude order never has to
//! be inferred from tuple position.

use crate::errors::HarvestError;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;

/// Deepest quadkey level accepted; tile x/y must fit in a `u32`.
pub const MAX_LEVEL: usize = 31;

/// A decoded marker position in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    pub lon: f64,
    pub lat: f64,
}

/// A tile corner as reported by [`QuadKey::corner`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatLon {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anchor {
    SouthWest,
    NorthEast,
}

/// Path in the map's quadtree, one digit (0-3) per level.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct QuadKey(String);

impl QuadKey {
    pub fn level(&self) -> usize {
        self.0.len()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The four quadrants of this tile, in digit order (NW, NE, SW, SE).
    pub fn children(&self) -> [QuadKey; 4] {
        ['0', '1', '2', '3'].map(|digit| {
            let mut key = self.0.clone();
            key.push(digit);
            QuadKey(key)
        })
    }

    /// Tile column and row at this key's level.
    pub fn tile_xy(&self) -> (u32, u32) {
        self.0.bytes().fold((0u32, 0u32), |(x, y), digit| {
            let d = u32::from(digit - b'0');
            ((x << 1) | (d & 1), (y << 1) | ((d >> 1) & 1))
        })
    }

    pub fn corner(&self, anchor: Anchor) -> LatLon {
        let (x, y) = self.tile_xy();
        let (x, y) = match anchor {
            Anchor::SouthWest => (f64::from(x), f64::from(y) + 1.0),
            Anchor::NorthEast => (f64::from(x) + 1.0, f64::from(y)),
        };
        let n = (1u64 << self.level()) as f64;
        LatLon {
            lat: (PI * (1.0 - 2.0 * y / n)).sinh().atan().to_degrees(),
            lon: x / n * 360.0 - 180.0,
        }
    }
}

impl FromStr for QuadKey {
    type Err = HarvestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let valid = !s.is_empty()
            && s.len() <= MAX_LEVEL
            && s.bytes().all(|b| matches!(b, b'0'..=b'3'));
        if valid {
            Ok(QuadKey(s.to_string()))
        } else {
            Err(HarvestError::InvalidQuadKey(s.to_string()))
        }
    }
}

impl TryFrom<String> for QuadKey {
    type Error = HarvestError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<QuadKey> for String {
    fn from(value: QuadKey) -> Self {
        value.0
    }
}

impl fmt::Display for QuadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Decode every point of an encoded polyline at `precision` decimal digits.
pub fn decode_polyline(encoded: &str, precision: u32) -> Result<Vec<GeoPoint>, HarvestError> {
    let factor = 10f64.powi(precision as i32);
    let bytes = encoded.as_bytes();
    let mut pos = 0;
    let (mut lat, mut lon) = (0i64, 0i64);
    let mut points = Vec::new();

    while pos < bytes.len() {
        lat = accumulate(lat, next_delta(bytes, &mut pos, encoded)?, encoded)?;
        if pos >= bytes.len() {
            return Err(HarvestError::MalformedGeometry(format!(
                "`{encoded}` ends after a latitude"
            )));
        }
        lon = accumulate(lon, next_delta(bytes, &mut pos, encoded)?, encoded)?;
        points.push(GeoPoint {
            lon: lon as f64 / factor,
            lat: lat as f64 / factor,
        });
    }
    Ok(points)
}

fn accumulate(total: i64, delta: i64, encoded: &str) -> Result<i64, HarvestError> {
    total.checked_add(delta).ok_or_else(|| {
        HarvestError::MalformedGeometry(format!("`{encoded}` overflows the coordinate range"))
    })
}

fn next_delta(bytes: &[u8], pos: &mut usize, encoded: &str) -> Result<i64, HarvestError> {
    let mut result = 0i64;
    let mut shift = 0u32;
    loop {
        let Some(&byte) = bytes.get(*pos) else {
            return Err(HarvestError::MalformedGeometry(format!(
                "`{encoded}` is truncated"
            )));
        };
        if !(63..=126).contains(&byte) || shift > 58 {
            return Err(HarvestError::MalformedGeometry(format!(
                "`{encoded}` has an invalid character at offset {pos}",
                pos = *pos
            )));
        }
        *pos += 1;
        let chunk = i64::from(byte - 63);
        result |= (chunk & 0x1f) << shift;
        shift += 5;
        if chunk & 0x20 == 0 {
            break;
        }
    }
    Ok(if result & 1 == 1 {
        !(result >> 1)
    } else {
        result >> 1
    })
}

/// Decode an encoded polyline that must hold exactly one point.
pub fn decode_point(encoded: &str, precision: u32) -> Result<GeoPoint, HarvestError> {
    let mut points = decode_polyline(encoded, precision)?;
    match points.len() {
        1 => Ok(points.remove(0)),
        n => Err(HarvestError::MalformedGeometry(format!(
            "expected a single point in `{encoded}`, decoded {n}"
        ))),
    }
}

/// Whether `point` lies inside `tile`, edges included.
pub fn point_in_tile(point: GeoPoint, tile: &QuadKey) -> bool {
    let sw = tile.corner(Anchor::SouthWest);
    let ne = tile.corner(Anchor::NorthEast);
    (sw.lon..=ne.lon).contains(&point.lon) && (sw.lat..=ne.lat).contains(&point.lat)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> QuadKey {
        s.parse().expect("valid quadkey")
    }

    fn center(tile: &QuadKey) -> GeoPoint {
        let sw = tile.corner(Anchor::SouthWest);
        let ne = tile.corner(Anchor::NorthEast);
        GeoPoint {
            lon: (sw.lon + ne.lon) / 2.0,
            lat: (sw.lat + ne.lat) / 2.0,
        }
    }

    #[test]
    fn test_decode_point_single() {
        let p = decode_point("_p~iF~ps|U", 5).expect("single point");
        assert!((p.lat - 38.5).abs() < 1e-9);
        assert!((p.lon - -120.2).abs() < 1e-9);
    }

    #[test]
    fn test_decode_point_respects_precision() {
        let p = decode_point("_p~iF~ps|U", 6).expect("single point");
        assert!((p.lat - 3.85).abs() < 1e-9);
        assert!((p.lon - -12.02).abs() < 1e-9);
    }

    #[test]
    fn test_decode_point_rejects_multiple_points() {
        let err = decode_point("_p~iF~ps|U_ulLnnqC_mqNvxq`@", 5).unwrap_err();
        assert!(matches!(err, HarvestError::MalformedGeometry(_)));
    }

    #[test]
    fn test_decode_point_rejects_empty() {
        let err = decode_point("", 5).unwrap_err();
        assert!(matches!(err, HarvestError::MalformedGeometry(_)));
    }

    #[test]
    fn test_decode_point_rejects_truncated_input() {
        // Latitude only
        assert!(matches!(
            decode_point("_p~iF", 5),
            Err(HarvestError::MalformedGeometry(_))
        ));
        // Continuation bit set on the last byte
        assert!(matches!(
            decode_point("_p~iF~ps|", 5),
            Err(HarvestError::MalformedGeometry(_))
        ));
        assert!(matches!(
            decode_point("_p~iF ps|U", 5),
            Err(HarvestError::MalformedGeometry(_))
        ));
    }

    #[test]
    fn test_decode_rejects_overflowing_coordinates() {
        // Each chunk is a maximal delta; the running sums leave the i64 range
        let encoded = "~~~~~~~~~~~^".repeat(40);
        assert!(matches!(
            decode_polyline(&encoded, 5),
            Err(HarvestError::MalformedGeometry(_))
        ));
        assert!(matches!(
            decode_point(&encoded, 5),
            Err(HarvestError::MalformedGeometry(_))
        ));
    }

    #[test]
    fn test_decode_polyline_accumulates_deltas() {
        let points = decode_polyline("_p~iF~ps|U_ulLnnqC_mqNvxq`@", 5).expect("valid polyline");
        assert_eq!(points.len(), 3);
        assert!((points[2].lat - 43.252).abs() < 1e-9);
        assert!((points[2].lon - -126.453).abs() < 1e-9);
    }

    #[test]
    fn test_quadkey_parse() {
        assert_eq!(key("03201011").level(), 8);
        assert!("".parse::<QuadKey>().is_err());
        assert!("0124".parse::<QuadKey>().is_err());
        assert!("0".repeat(MAX_LEVEL + 1).parse::<QuadKey>().is_err());
    }

    #[test]
    fn test_quadkey_children() {
        let children = key("032").children();
        let names: Vec<&str> = children.iter().map(QuadKey::as_str).collect();
        assert_eq!(names, ["0320", "0321", "0322", "0323"]);
    }

    #[test]
    fn test_tile_xy() {
        assert_eq!(key("0").tile_xy(), (0, 0));
        assert_eq!(key("3").tile_xy(), (1, 1));
        assert_eq!(key("213").tile_xy(), (3, 5));
    }

    #[test]
    fn test_corner_of_level_one_tile() {
        let sw = key("0").corner(Anchor::SouthWest);
        let ne = key("0").corner(Anchor::NorthEast);
        assert!((sw.lon - -180.0).abs() < 1e-9);
        assert!(sw.lat.abs() < 1e-9);
        assert!(ne.lon.abs() < 1e-9);
        assert!((ne.lat - 85.051_128_78).abs() < 1e-6);
    }

    #[test]
    fn test_point_in_tile_includes_edges() {
        let tile = key("03201011");
        let sw = tile.corner(Anchor::SouthWest);
        let ne = tile.corner(Anchor::NorthEast);
        assert!(point_in_tile(GeoPoint { lon: sw.lon, lat: sw.lat }, &tile));
        assert!(point_in_tile(GeoPoint { lon: ne.lon, lat: ne.lat }, &tile));
        assert!(point_in_tile(GeoPoint { lon: sw.lon, lat: ne.lat }, &tile));
        assert!(!point_in_tile(
            GeoPoint {
                lon: ne.lon + 1e-6,
                lat: ne.lat
            },
            &tile
        ));
    }

    #[test]
    fn test_nyc_point_in_configured_tile() {
        // Midtown Manhattan
        let p = GeoPoint {
            lon: -73.9855,
            lat: 40.7580,
        };
        assert!(point_in_tile(p, &key("03201011")));
        assert!(!point_in_tile(p, &key("03201010")));
    }

    #[test]
    fn test_interior_point_in_exactly_one_child() {
        let parent = key("03201011");
        for child in parent.children() {
            let p = center(&child);
            assert!(point_in_tile(p, &parent));
            let hits: Vec<_> = parent
                .children()
                .into_iter()
                .filter(|c| point_in_tile(p, c))
                .collect();
            assert_eq!(hits, vec![child.clone()]);
        }
    }

    #[test]
    fn test_shared_edge_point_in_two_children() {
        let parent = key("0");
        let edge = key("00").corner(Anchor::NorthEast).lon;
        let p = GeoPoint {
            lon: edge,
            lat: center(&key("00")).lat,
        };
        let hits = parent
            .children()
            .into_iter()
            .filter(|c| point_in_tile(p, c))
            .count();
        assert_eq!(hits, 2);
    }

    #[test]
    fn test_quadkey_serde_validates() {
        let parsed: QuadKey = serde_json::from_str("\"0320\"").expect("valid");
        assert_eq!(parsed, key("0320"));
        assert!(serde_json::from_str::<QuadKey>("\"0329\"").is_err());
    }
}
