// Geo Search
// Geohash encoding and radius search across a cell and its neighbors with resumable state

use crate::db::catalog::Catalog;
use crate::db::request::{CompareOp, QueryOptions};
use crate::db::traits::{DbError, DbResult, Record};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const BASE32: &[u8] = b"0123456789bcdefghjkmnpqrstuvwxyz";

/// Mean earth radius in km
pub const EARTH_RADIUS_KM: f64 = 6371.0;

const KM_PER_DEGREE: f64 = EARTH_RADIUS_KM * std::f64::consts::PI / 180.0;

pub const MAX_PRECISION: usize = 12;

/// Geohash of a point with `precision` characters
pub fn encode(latitude: f64, longitude: f64, precision: usize) -> String {
    let precision = precision.clamp(1, MAX_PRECISION);
    let (mut lat_lo, mut lat_hi) = (-90.0, 90.0);
    let (mut lon_lo, mut lon_hi) = (-180.0, 180.0);
    let mut hash = String::with_capacity(precision);
    let mut even = true;
    let mut bits = 0u8;
    let mut idx = 0usize;

    while hash.len() < precision {
        if even {
            let mid = (lon_lo + lon_hi) / 2.0;
            if longitude >= mid {
                idx = idx * 2 + 1;
                lon_lo = mid;
            } else {
                idx *= 2;
                lon_hi = mid;
            }
        } else {
            let mid = (lat_lo + lat_hi) / 2.0;
            if latitude >= mid {
                idx = idx * 2 + 1;
                lat_lo = mid;
            } else {
                idx *= 2;
                lat_hi = mid;
            }
        }
        even = !even;
        bits += 1;
        if bits == 5 {
            hash.push(BASE32[idx] as char);
            bits = 0;
            idx = 0;
        }
    }
    hash
}

/// Decoded cell: center and half extents in degrees
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoCell {
    pub latitude: f64,
    pub longitude: f64,
    pub lat_err: f64,
    pub lon_err: f64,
}

pub fn decode(hash: &str) -> DbResult<GeoCell> {
    let (mut lat_lo, mut lat_hi) = (-90.0, 90.0);
    let (mut lon_lo, mut lon_hi) = (-180.0, 180.0);
    let mut even = true;
    for c in hash.bytes() {
        let idx = BASE32
            .iter()
            .position(|b| *b == c.to_ascii_lowercase())
            .ok_or_else(|| DbError::Validation(format!("invalid geohash {}", hash)))?;
        for shift in (0..5).rev() {
            let bit = (idx >> shift) & 1 == 1;
            if even {
                let mid = (lon_lo + lon_hi) / 2.0;
                if bit {
                    lon_lo = mid;
                } else {
                    lon_hi = mid;
                }
            } else {
                let mid = (lat_lo + lat_hi) / 2.0;
                if bit {
                    lat_lo = mid;
                } else {
                    lat_hi = mid;
                }
            }
            even = !even;
        }
    }
    Ok(GeoCell {
        latitude: (lat_lo + lat_hi) / 2.0,
        longitude: (lon_lo + lon_hi) / 2.0,
        lat_err: (lat_hi - lat_lo) / 2.0,
        lon_err: (lon_hi - lon_lo) / 2.0,
    })
}

/// The eight surrounding cells of the same precision, without duplicates near the poles
pub fn neighbors(hash: &str) -> DbResult<Vec<String>> {
    let cell = decode(hash)?;
    let mut out: Vec<String> = Vec::with_capacity(8);
    for (dlat, dlon) in [(1, 0), (1, 1), (0, 1), (-1, 1), (-1, 0), (-1, -1), (0, -1), (1, -1)] {
        let lat = cell.latitude + dlat as f64 * cell.lat_err * 2.0;
        if !(-90.0..=90.0).contains(&lat) {
            continue;
        }
        let mut lon = cell.longitude + dlon as f64 * cell.lon_err * 2.0;
        if lon > 180.0 {
            lon -= 360.0;
        } else if lon < -180.0 {
            lon += 360.0;
        }
        let neighbor = encode(lat, lon, hash.len());
        if neighbor != hash && !out.contains(&neighbor) {
            out.push(neighbor);
        }
    }
    Ok(out)
}

/// Great-circle distance in km
pub fn distance_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (p1, p2) = (lat1.to_radians(), lat2.to_radians());
    let dp = (lat2 - lat1).to_radians();
    let dl = (lon2 - lon1).to_radians();
    let a = (dp / 2.0).sin().powi(2) + p1.cos() * p2.cos() * (dl / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().atan2((1.0 - a).sqrt())
}

/// Cell height and width in km at `latitude`
fn cell_size_km(precision: usize, latitude: f64) -> (f64, f64) {
    let bits = precision as i32 * 5;
    let lon_bits = (bits + 1) / 2;
    let lat_bits = bits / 2;
    let height = 180.0 / 2f64.powi(lat_bits) * KM_PER_DEGREE;
    let width = 360.0 / 2f64.powi(lon_bits) * KM_PER_DEGREE * latitude.to_radians().cos().abs();
    (height, width)
}

/// Longest geohash whose cells are at least `distance` km on each side at `latitude`,
/// so the cell and its neighbors cover the whole radius
pub fn precision_for_distance(distance: f64, latitude: f64) -> usize {
    (1..=MAX_PRECISION)
        .take_while(|p| {
            let (height, width) = cell_size_km(*p, latitude);
            height.min(width) >= distance
        })
        .last()
        .unwrap_or(1)
}

/// Position of a radius search between pages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoState {
    /// Prefix currently being read
    pub geohash: String,
    /// Prefixes still to read, in order
    pub neighbors: Vec<String>,
    /// Token inside the current prefix
    pub start: Option<Value>,
}

impl GeoState {
    /// Opaque token form for callers that round-trip it through a client
    pub fn to_token(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn from_token(token: &Value) -> DbResult<Self> {
        Ok(serde_json::from_value(token.clone())?)
    }
}

#[derive(Debug, Clone)]
pub struct GeoOptions {
    pub latitude: f64,
    pub longitude: f64,
    /// Radius in km
    pub distance: f64,
    /// Smallest cell size to search, in km
    pub min_distance: f64,
    /// Report distances rounded to this many km, rows beyond the radius after rounding are dropped
    pub round: Option<f64>,
    pub geohash_column: String,
    pub latitude_column: String,
    pub longitude_column: String,
    /// Rows per call
    pub count: usize,
    pub options: QueryOptions,
    /// Resume from a previous call
    pub start: Option<GeoState>,
}

impl GeoOptions {
    pub fn new(latitude: f64, longitude: f64, distance: f64) -> Self {
        Self {
            latitude,
            longitude,
            distance,
            min_distance: 0.0,
            round: None,
            geohash_column: "geohash".to_string(),
            latitude_column: "latitude".to_string(),
            longitude_column: "longitude".to_string(),
            count: 10,
            options: QueryOptions::default(),
            start: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GeoResult {
    /// Matching rows with a `distance` field in km
    pub rows: Vec<Record>,
    /// None once every cell is exhausted
    pub next: Option<GeoState>,
}

fn coordinate(row: &Record, column: &str) -> Option<f64> {
    match row.get(column)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

impl Catalog {
    /// Rows within `distance` km of a point, read cell by cell
    pub async fn search_geo(&self, table: &str, query: Record, opts: GeoOptions) -> DbResult<GeoResult> {
        let mut state = match opts.start.clone() {
            Some(state) => state,
            None => {
                let precision = precision_for_distance(opts.distance.max(opts.min_distance), opts.latitude);
                let geohash = encode(opts.latitude, opts.longitude, precision);
                GeoState {
                    neighbors: neighbors(&geohash)?,
                    geohash,
                    start: None,
                }
            }
        };

        let count = opts.count.max(1);
        let mut rows = Vec::new();
        let mut exhausted = false;
        while rows.len() < count {
            let mut condition = query.clone();
            condition.insert(opts.geohash_column.clone(), Value::String(state.geohash.clone()));
            let options = opts
                .options
                .clone()
                .with_op(&opts.geohash_column, CompareOp::BeginsWith)
                .with_count(count - rows.len())
                .with_start(state.start.take());
            let res = self.select(table, condition, options).await?;

            for mut row in res.rows {
                let (Some(lat), Some(lon)) = (
                    coordinate(&row, &opts.latitude_column),
                    coordinate(&row, &opts.longitude_column),
                ) else {
                    continue;
                };
                let mut distance = distance_km(opts.latitude, opts.longitude, lat, lon);
                if distance > opts.distance {
                    continue;
                }
                if let Some(round) = opts.round.filter(|r| *r > 0.0) {
                    distance = (distance / round).round() * round;
                    if distance > opts.distance {
                        continue;
                    }
                }
                row.insert(
                    "distance".to_string(),
                    serde_json::Number::from_f64(distance).map_or(Value::Null, Value::Number),
                );
                rows.push(row);
            }

            state.start = res.info.next_token;
            if state.start.is_none() {
                if state.neighbors.is_empty() {
                    exhausted = true;
                    break;
                }
                state.geohash = state.neighbors.remove(0);
            }
        }

        tracing::debug!(table, rows = rows.len(), geohash = %state.geohash, exhausted, "Geo search page");
        Ok(GeoResult {
            rows,
            next: (!exhausted).then_some(state),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_known_value() {
        assert_eq!(encode(57.64911, 10.40744, 11), "u4pruydqqvj");
        assert_eq!(encode(37.0, -122.0, 5), &encode(37.0, -122.0, 12)[..5]);
    }

    #[test]
    fn test_decode_contains_point() {
        let cell = decode("u4pruydqqvj").unwrap();
        assert!((cell.latitude - 57.64911).abs() < 1e-4);
        assert!((cell.longitude - 10.40744).abs() < 1e-4);
        assert!(decode("abc").is_err());
    }

    #[test]
    fn test_neighbors_are_adjacent() {
        let hash = encode(37.0, -122.0, 5);
        let around = neighbors(&hash).unwrap();
        assert_eq!(around.len(), 8);
        let cell = decode(&hash).unwrap();
        for n in &around {
            let other = decode(n).unwrap();
            assert!((other.latitude - cell.latitude).abs() <= cell.lat_err * 2.0 + 1e-9);
        }
    }

    #[test]
    fn test_distance() {
        let d = distance_km(37.0, -122.0, 37.0 + 5.0 / KM_PER_DEGREE, -122.0);
        assert!((d - 5.0).abs() < 1e-6);
        assert_eq!(distance_km(1.0, 1.0, 1.0, 1.0), 0.0);
    }

    #[test]
    fn test_precision_covers_radius() {
        let p = precision_for_distance(5.0, 37.0);
        assert_eq!(p, 4);
        let (height, width) = cell_size_km(p, 37.0);
        assert!(height >= 5.0 && width >= 5.0);
        let (height, _) = cell_size_km(p + 1, 37.0);
        assert!(height < 5.0);
        assert_eq!(precision_for_distance(10_000.0, 0.0), 1);
    }

    #[test]
    fn test_state_token_roundtrip() {
        let state = GeoState {
            geohash: "9q9".to_string(),
            neighbors: vec!["9qc".to_string()],
            start: Some(Value::from(4)),
        };
        assert_eq!(GeoState::from_token(&state.to_token()).unwrap(), state);
    }
}
