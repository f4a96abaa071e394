//! Encoded polyline codec (Google's scheme).
//!
//! Each coordinate is stored as the delta from the previous one, scaled by
//! `10^precision`, zig-zag encoded and split into 5-bit groups. Every group is
//! offset by 63 so the result is printable ASCII; a set `0x20` bit marks that
//! another group follows. Pairs are stored latitude first, but the decoder
//! yields `(lon, lat)` to match the GeoJSON order the map layers expect.

use serde::{Deserialize, Serialize};

use crate::error::PolylineError;

/// Google's default: five decimal places.
pub const DEFAULT_PRECISION: u32 = 5;

/// `(longitude, latitude)` in degrees.
pub type LonLat = (f64, f64);

/// What to do with input that ends in the middle of a group or a pair.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum TruncationPolicy {
    /// Keep every complete pair decoded before the damage.
    #[default]
    Lenient,
    /// Reject the whole input.
    Strict,
}

/// Decodes with the default precision, keeping whatever prefix is well formed.
pub fn decode(encoded: &str) -> Vec<LonLat> {
    match decode_with(encoded, DEFAULT_PRECISION, TruncationPolicy::Lenient) {
        Ok(points) => points,
        // Lenient decoding never reports errors.
        Err(_) => Vec::new(),
    }
}

pub fn decode_with(encoded: &str, precision: u32, policy: TruncationPolicy) -> Result<Vec<LonLat>, PolylineError> {
    let factor = 10f64.powi(precision as i32);
    let bytes = encoded.as_bytes();
    let mut points = Vec::with_capacity(bytes.len() / 4);
    let mut index = 0;
    let mut lat: i64 = 0;
    let mut lon: i64 = 0;

    while index < bytes.len() {
        let pair = next_delta(bytes, &mut index).and_then(|dlat| next_delta(bytes, &mut index).map(|dlon| (dlat, dlon)));
        match pair {
            Ok((dlat, dlon)) => {
                lat += dlat;
                lon += dlon;
                points.push((lon as f64 / factor, lat as f64 / factor));
            }
            Err(err) => {
                return match policy {
                    TruncationPolicy::Strict => Err(err),
                    TruncationPolicy::Lenient => {
                        log::warn!("polyline decoding stopped after {} points: {err}", points.len());
                        Ok(points)
                    }
                };
            }
        }
    }

    Ok(points)
}

fn next_delta(bytes: &[u8], index: &mut usize) -> Result<i64, PolylineError> {
    let mut result: i64 = 0;
    let mut shift = 0;
    loop {
        let Some(&byte) = bytes.get(*index) else {
            return Err(PolylineError::Truncated { offset: *index });
        };
        if !(63..=126).contains(&byte) {
            return Err(PolylineError::InvalidByte { offset: *index, byte });
        }
        if shift > 35 {
            return Err(PolylineError::Overflow { offset: *index });
        }
        let chunk = (byte - 63) as i64;
        *index += 1;
        result |= (chunk & 0x1f) << shift;
        shift += 5;
        if chunk < 0x20 {
            break;
        }
    }
    // zig-zag
    Ok(if result & 1 != 0 { !(result >> 1) } else { result >> 1 })
}

/// Encodes `(lon, lat)` pairs; the inverse of [`decode_with`].
pub fn encode(points: &[LonLat], precision: u32) -> String {
    let factor = 10f64.powi(precision as i32);
    let mut out = String::with_capacity(points.len() * 8);
    let mut prev_lat: i64 = 0;
    let mut prev_lon: i64 = 0;
    for &(lon, lat) in points {
        let lat = (lat * factor).round() as i64;
        let lon = (lon * factor).round() as i64;
        push_delta(&mut out, lat - prev_lat);
        push_delta(&mut out, lon - prev_lon);
        prev_lat = lat;
        prev_lon = lon;
    }
    out
}

fn push_delta(out: &mut String, delta: i64) {
    let mut value = if delta < 0 { !(delta << 1) } else { delta << 1 };
    while value >= 0x20 {
        out.push((((value & 0x1f) | 0x20) as u8 + 63) as char);
        value >>= 5;
    }
    out.push((value as u8 + 63) as char);
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    // Example from Google's polyline documentation.
    const GOOGLE_SAMPLE: &str = "_p~iF~ps|U_ulLnnqC_mqNvxq`@";

    #[test]
    fn decodes_reference_sample() {
        let points = decode(GOOGLE_SAMPLE);
        let expected = [(-120.2, 38.5), (-120.95, 40.7), (-126.453, 43.252)];
        assert_eq!(points.len(), expected.len());
        for (got, want) in points.iter().zip(expected) {
            assert_abs_diff_eq!(got.0, want.0, epsilon = 1e-5);
            assert_abs_diff_eq!(got.1, want.1, epsilon = 1e-5);
        }
    }

    #[test]
    fn empty_input_is_empty() {
        assert!(decode("").is_empty());
        assert_eq!(decode_with("", 5, TruncationPolicy::Strict), Ok(Vec::new()));
    }

    #[test]
    fn encoder_matches_reference() {
        let points = [(-120.2, 38.5), (-120.95, 40.7), (-126.453, 43.252)];
        assert_eq!(encode(&points, DEFAULT_PRECISION), GOOGLE_SAMPLE);
    }

    #[test]
    fn round_trip_within_precision() {
        let route = [
            (1.521_234, 42.506_789),
            (1.530_001, 42.499_999),
            (-0.000_04, -0.000_06),
            (179.999_99, -85.0),
            (-179.999_99, 85.0),
        ];
        for precision in [5, 6] {
            let decoded = decode_with(&encode(&route, precision), precision, TruncationPolicy::Strict).unwrap();
            assert_eq!(decoded.len(), route.len());
            for (got, want) in decoded.iter().zip(route) {
                assert_abs_diff_eq!(got.0, want.0, epsilon = 1e-5);
                assert_abs_diff_eq!(got.1, want.1, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn round_trip_over_generated_routes() {
        // xorshift64, fixed seed so failures reproduce.
        let mut state = 0x9e37_79b9_7f4a_7c15u64;
        let mut next = move || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state >> 11) as f64 / (1u64 << 53) as f64
        };
        for len in [1, 2, 17, 64] {
            for _ in 0..25 {
                let route: Vec<LonLat> = (0..len)
                    .map(|_| (next() * 360.0 - 180.0, next() * 170.0 - 85.0))
                    .collect();
                for precision in [5, 6] {
                    let encoded = encode(&route, precision);
                    let decoded = decode_with(&encoded, precision, TruncationPolicy::Strict).unwrap();
                    assert_eq!(decoded.len(), route.len());
                    for (got, want) in decoded.iter().zip(&route) {
                        assert_abs_diff_eq!(got.0, want.0, epsilon = 1e-5);
                        assert_abs_diff_eq!(got.1, want.1, epsilon = 1e-5);
                    }
                }
            }
        }
    }

    #[test]
    fn truncated_input_keeps_complete_pairs() {
        // Drop the last byte so the final longitude is cut mid-group.
        let cut = &GOOGLE_SAMPLE[..GOOGLE_SAMPLE.len() - 1];
        let points = decode(cut);
        assert_eq!(points.len(), 2);
        assert!(matches!(
            decode_with(cut, 5, TruncationPolicy::Strict),
            Err(PolylineError::Truncated { .. })
        ));
    }

    #[test]
    fn invalid_bytes() {
        assert_eq!(
            decode_with("_p~iF~ps|U \n", 5, TruncationPolicy::Strict),
            Err(PolylineError::InvalidByte { offset: 10, byte: b' ' })
        );
        assert_eq!(decode("_p~iF~ps|U \n").len(), 1);
        assert!(decode("\u{e9}").is_empty());
    }

    #[test]
    fn decode_is_pure() {
        assert_eq!(decode(GOOGLE_SAMPLE), decode(GOOGLE_SAMPLE));
    }
}
