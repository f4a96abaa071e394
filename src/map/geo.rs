use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

/// Latitude limit of the square Web Mercator world.
pub const MAX_LATITUDE: f64 = 85.051_128_779_806_59;

#[derive(Debug, Default, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct Coordinate {
    latitude: f64,
    longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    /// True when either axis moved by more than `epsilon` degrees.
    pub fn differs_from(&self, other: &Coordinate, epsilon: f64) -> bool {
        (self.latitude - other.latitude).abs() > epsilon
            || (self.longitude - other.longitude).abs() > epsilon
    }

    /// Position in the unit Web Mercator square, `(0, 0)` at the north-west corner.
    pub fn to_mercator(&self) -> [f64; 2] {
        [lng_x(self.longitude), lat_y(self.latitude)]
    }

    pub fn from_mercator(x: f64, y: f64) -> Self {
        Self {
            latitude: y_lat(y),
            longitude: x_lng(x),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct GeoBounds {
    south: f64, // minimum latitude
    west: f64,  // minimum longitude
    north: f64, // maximum latitude
    east: f64,  // maximum longitude
}

impl GeoBounds {
    pub fn new(south: f64, west: f64, north: f64, east: f64) -> Self {
        Self {
            south,
            west,
            north,
            east,
        }
    }

    pub fn south(&self) -> f64 {
        self.south
    }

    pub fn west(&self) -> f64 {
        self.west
    }

    pub fn north(&self) -> f64 {
        self.north
    }

    pub fn east(&self) -> f64 {
        self.east
    }

    pub fn center(&self) -> Coordinate {
        Coordinate {
            latitude: (self.south + self.north) / 2.0,
            longitude: (self.west + self.east) / 2.0,
        }
    }

    pub fn contains(&self, coordinate: &Coordinate) -> bool {
        let lat_ok = coordinate.latitude >= self.south && coordinate.latitude <= self.north;
        let lon_ok = if self.crosses_antimeridian() {
            coordinate.longitude >= self.west || coordinate.longitude <= self.east
        } else {
            coordinate.longitude >= self.west && coordinate.longitude <= self.east
        };
        lat_ok && lon_ok
    }

    pub fn crosses_antimeridian(&self) -> bool {
        self.west > self.east
    }

    /// Normalises the box into one or two boxes that never cross the 180th meridian.
    ///
    /// Longitudes are wrapped into `[-180, 180]` and latitudes clamped to the
    /// Mercator limits; a box spanning 360 degrees or more becomes the whole world.
    pub fn split_antimeridian(&self) -> Vec<GeoBounds> {
        let south = self.south.clamp(-90.0, 90.0);
        let north = self.north.clamp(-90.0, 90.0);
        if self.east - self.west >= 360.0 {
            return vec![GeoBounds::new(south, -180.0, north, 180.0)];
        }
        let west = wrap_longitude(self.west);
        let east = wrap_longitude(self.east);
        if west > east {
            vec![
                GeoBounds::new(south, west, north, 180.0),
                GeoBounds::new(south, -180.0, north, east),
            ]
        } else {
            vec![GeoBounds::new(south, west, north, east)]
        }
    }

    pub fn all_x_y_zoom(&self, zoom: u32) -> Vec<(u32, u32)> {
        let mut tiles = Vec::new();
        let n = 2u32.pow(zoom);

        // Get tile coordinates for the two opposite corners
        let (min_x, min_y) = latlng_to_tile_coords(self.north, self.west, zoom);
        let (max_x, max_y) = latlng_to_tile_coords(self.south, self.east, zoom);

        // Handle wrap-around at 180/-180 degrees longitude
        if self.crosses_antimeridian() {
            for x in min_x..n {
                for y in min_y..=max_y {
                    tiles.push((x, y));
                }
            }
            for x in 0..=max_x {
                for y in min_y..=max_y {
                    tiles.push((x, y));
                }
            }
        } else {
            for x in min_x..=max_x {
                for y in min_y..=max_y {
                    tiles.push((x, y));
                }
            }
        }

        tiles
    }
}

pub fn wrap_longitude(lon: f64) -> f64 {
    if (-180.0..=180.0).contains(&lon) {
        return lon;
    }
    ((lon + 180.0).rem_euclid(360.0)) - 180.0
}

/// Longitude to unit Mercator x.
pub fn lng_x(lng: f64) -> f64 {
    lng / 360.0 + 0.5
}

/// Latitude to unit Mercator y, clamped to the square world.
pub fn lat_y(lat: f64) -> f64 {
    let sin = lat.to_radians().sin();
    let y = 0.5 - 0.25 * ((1.0 + sin) / (1.0 - sin)).ln() / PI;
    y.clamp(0.0, 1.0)
}

pub fn x_lng(x: f64) -> f64 {
    (x - 0.5) * 360.0
}

pub fn y_lat(y: f64) -> f64 {
    let y2 = (180.0 - y * 360.0).to_radians();
    360.0 * y2.exp().atan() / PI - 90.0
}

/// Convert a latitude and longitude to tile x, y coordinates for a given zoom.
/// Uses the Web Mercator projection.
pub fn latlng_to_tile_coords(lat: f64, lon: f64, zoom: u32) -> (u32, u32) {
    let n = 2.0_f64.powi(zoom as i32);
    let max_index = (n - 1.0).max(0.0);
    let x_tile = (lng_x(wrap_longitude(lon)) * n).floor().clamp(0.0, max_index) as u32;
    let y_tile = (lat_y(lat.clamp(-MAX_LATITUDE, MAX_LATITUDE)) * n).floor().clamp(0.0, max_index) as u32;
    (x_tile, y_tile)
}

/// Convert tile x, y, zoom into geographical bounds (GeoBounds)
pub fn tile_coords_to_geo_bounds(x: u32, y: u32, zoom: u32) -> GeoBounds {
    let n = 2.0_f64.powi(zoom as i32);

    // Longitudes:
    let west = x as f64 / n * 360.0 - 180.0;
    let east = (x as f64 + 1.0) / n * 360.0 - 180.0;

    // For latitudes, we use the inverse of the Mercator projection.
    let north = (PI * (1.0 - 2.0 * y as f64 / n)).sinh().atan().to_degrees();
    let south = (PI * (1.0 - 2.0 * (y as f64 + 1.0) / n)).sinh().atan().to_degrees();

    GeoBounds {
        south,
        west,
        north,
        east,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn mercator_round_trip() {
        let c = Coordinate::new(42.5, 1.52);
        let [x, y] = c.to_mercator();
        let back = Coordinate::from_mercator(x, y);
        assert_abs_diff_eq!(back.latitude(), 42.5, epsilon = 1e-9);
        assert_abs_diff_eq!(back.longitude(), 1.52, epsilon = 1e-9);
    }

    #[test]
    fn antimeridian_split() {
        let bounds = GeoBounds::new(-10.0, 170.0, 10.0, -170.0);
        let parts = bounds.split_antimeridian();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].east(), 180.0);
        assert_eq!(parts[1].west(), -180.0);
        assert!(bounds.contains(&Coordinate::new(0.0, 175.0)));
        assert!(bounds.contains(&Coordinate::new(0.0, -175.0)));
        assert!(!bounds.contains(&Coordinate::new(0.0, 0.0)));
    }

    #[test]
    fn tile_bounds_contain_their_corner() {
        let (x, y) = latlng_to_tile_coords(42.5, 1.52, 10);
        let tile = tile_coords_to_geo_bounds(x, y, 10);
        assert!(tile.contains(&Coordinate::new(42.5, 1.52)));
    }

    #[test]
    fn epsilon_comparison() {
        let a = Coordinate::new(42.5, 1.52);
        assert!(!a.differs_from(&Coordinate::new(42.500_005, 1.52), 1e-5));
        assert!(a.differs_from(&Coordinate::new(42.5, 1.520_02), 1e-5));
    }
}
