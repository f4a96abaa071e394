use egui::{pos2, Pos2, Vec2};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

use super::geo::{wrap_longitude, Coordinate, GeoBounds, MAX_LATITUDE};

pub const MIN_ZOOM: f64 = 0.0;
pub const MAX_ZOOM: f64 = 20.0;

/// The visible map region: a center, a fractional zoom and a screen size.
///
/// Screen positions are relative to the top-left corner of the map rect.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Viewport {
    center: Coordinate,
    zoom: f64,
    size: Vec2,
    tile_size: f64,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            center: Coordinate::new(42.5, 1.52),
            zoom: 8.0,
            size: Vec2::new(1024.0, 768.0),
            tile_size: 512.0,
        }
    }
}

impl Viewport {
    pub fn new(center: Coordinate, zoom: f64, size: Vec2) -> Self {
        Self {
            center,
            zoom: zoom.clamp(MIN_ZOOM, MAX_ZOOM),
            size,
            ..Default::default()
        }
    }

    pub fn with_tile_size(mut self, tile_size: f64) -> Self {
        self.tile_size = tile_size;
        self
    }

    pub fn center(&self) -> Coordinate {
        self.center
    }

    pub fn zoom(&self) -> f64 {
        self.zoom
    }

    pub fn size(&self) -> Vec2 {
        self.size
    }

    pub fn tile_size(&self) -> f64 {
        self.tile_size
    }

    pub fn set_size(&mut self, size: Vec2) {
        self.size = size;
    }

    pub fn set_center(&mut self, center: Coordinate) {
        let latitude = center.latitude().clamp(-MAX_LATITUDE, MAX_LATITUDE);
        self.center = Coordinate::new(latitude, wrap_longitude(center.longitude()));
    }

    pub fn set_zoom(&mut self, zoom: f64) {
        self.zoom = zoom.clamp(MIN_ZOOM, MAX_ZOOM);
    }

    /// Width of the whole world in screen pixels at the current zoom.
    pub fn world_size(&self) -> f64 {
        self.tile_size * 2.0_f64.powf(self.zoom)
    }

    pub fn project(&self, coordinate: &Coordinate) -> Pos2 {
        let world = self.world_size();
        let [cx, cy] = self.center.to_mercator();
        let [x, y] = coordinate.to_mercator();
        pos2(
            ((x - cx) * world + self.size.x as f64 / 2.0) as f32,
            ((y - cy) * world + self.size.y as f64 / 2.0) as f32,
        )
    }

    pub fn unproject(&self, pos: Pos2) -> Coordinate {
        let world = self.world_size();
        let [cx, cy] = self.center.to_mercator();
        let x = cx + (pos.x as f64 - self.size.x as f64 / 2.0) / world;
        let y = cy + (pos.y as f64 - self.size.y as f64 / 2.0) / world;
        Coordinate::from_mercator(x, y.clamp(0.0, 1.0))
    }

    /// Geographic bounds of the screen rect. West may exceed east when the
    /// view straddles the antimeridian.
    pub fn bounds(&self) -> GeoBounds {
        let nw = self.unproject(pos2(0.0, 0.0));
        let se = self.unproject(pos2(self.size.x, self.size.y));
        if self.world_size() <= self.size.x as f64 {
            return GeoBounds::new(se.latitude(), -180.0, nw.latitude(), 180.0);
        }
        GeoBounds::new(
            se.latitude(),
            wrap_longitude(nw.longitude()),
            nw.latitude(),
            wrap_longitude(se.longitude()),
        )
    }

    /// Moves the map so that content follows a pointer drag of `delta` pixels.
    pub fn pan_by(&mut self, delta: Vec2) {
        let middle = pos2(self.size.x / 2.0, self.size.y / 2.0);
        let target = self.unproject(middle - delta);
        self.set_center(target);
    }

    /// Zooms by `delta` levels keeping the coordinate under `anchor` fixed on screen.
    pub fn zoom_around(&mut self, delta: f64, anchor: Pos2) {
        let fixed = self.unproject(anchor);
        self.set_zoom(self.zoom + delta);
        let drifted = self.project(&fixed);
        self.pan_by(anchor - drifted);
    }
}

/// The host viewport's pan, scroll-zoom and double-click-zoom controls.
///
/// Acquired by a drag session entering `dragging` and released on every exit
/// path. The counters let callers check that every acquire was matched.
#[derive(Debug, Default, Clone)]
pub struct InteractionLock {
    held_by: Option<String>,
    acquired: u64,
    released: u64,
}

impl InteractionLock {
    /// Disables the controls on behalf of `owner`. Returns false if someone already holds them.
    pub fn acquire(&mut self, owner: &str) -> bool {
        if self.held_by.is_some() {
            return false;
        }
        self.held_by = Some(owner.to_string());
        self.acquired += 1;
        log::debug!("viewport controls disabled by {owner}");
        true
    }

    /// Re-enables the controls if `owner` holds them.
    pub fn release(&mut self, owner: &str) -> bool {
        match &self.held_by {
            Some(holder) if holder == owner => {
                self.held_by = None;
                self.released += 1;
                log::debug!("viewport controls re-enabled by {owner}");
                true
            }
            _ => false,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.held_by.is_some()
    }

    pub fn holder(&self) -> Option<&str> {
        self.held_by.as_deref()
    }

    pub fn pan_enabled(&self) -> bool {
        !self.is_locked()
    }

    pub fn scroll_zoom_enabled(&self) -> bool {
        !self.is_locked()
    }

    pub fn double_click_zoom_enabled(&self) -> bool {
        !self.is_locked()
    }

    pub fn acquire_count(&self) -> u64 {
        self.acquired
    }

    pub fn release_count(&self) -> u64 {
        self.released
    }
}

/// An animated transition of the viewport to a target center and zoom.
#[derive(Debug, Clone)]
pub struct FlyTo {
    from: Coordinate,
    from_zoom: f64,
    to: Coordinate,
    to_zoom: f64,
    started: Instant,
    duration: Duration,
}

impl FlyTo {
    pub fn new(viewport: &Viewport, to: Coordinate, to_zoom: f64, now: Instant, duration: Duration) -> Self {
        Self {
            from: viewport.center(),
            from_zoom: viewport.zoom(),
            to,
            to_zoom: to_zoom.clamp(MIN_ZOOM, MAX_ZOOM),
            started: now,
            duration,
        }
    }

    pub fn target(&self) -> (Coordinate, f64) {
        (self.to, self.to_zoom)
    }

    /// Applies the animation frame for `now`. Returns true once the target is reached.
    pub fn step(&self, viewport: &mut Viewport, now: Instant) -> bool {
        let t = if self.duration.is_zero() {
            1.0
        } else {
            (now.saturating_duration_since(self.started).as_secs_f64() / self.duration.as_secs_f64()).min(1.0)
        };
        let eased = if t < 0.5 {
            4.0 * t * t * t
        } else {
            1.0 - (-2.0 * t + 2.0).powi(3) / 2.0
        };
        let [ax, ay] = self.from.to_mercator();
        let [bx, by] = self.to.to_mercator();
        viewport.set_center(Coordinate::from_mercator(ax + (bx - ax) * eased, ay + (by - ay) * eased));
        viewport.set_zoom(self.from_zoom + (self.to_zoom - self.from_zoom) * eased);
        t >= 1.0
    }
}
