//! Pin glyphs for individual markers.
//!
//! A glyph is a list of egui shapes in a local frame whose origin is the top
//! left corner of its bounding box. `anchor` is the pin tip, the point that
//! sits on the entity's coordinate.

use std::num::NonZeroUsize;

use egui::{pos2, vec2, Color32, Pos2, Shape, Stroke, Vec2};
use lru::LruCache;
use serde::{Deserialize, Serialize};

use crate::config::GlyphConfig;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum GlyphStyle {
    #[default]
    Teardrop,
    Lollipop,
    Diamond,
}

impl GlyphStyle {
    pub const ALL: [GlyphStyle; 3] = [GlyphStyle::Teardrop, GlyphStyle::Lollipop, GlyphStyle::Diamond];

    pub fn label(&self) -> &'static str {
        match self {
            GlyphStyle::Teardrop => "Teardrop",
            GlyphStyle::Lollipop => "Lollipop",
            GlyphStyle::Diamond => "Diamond",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BadgeLabel {
    pub center: Pos2,
    pub radius: f32,
    pub text: String,
    pub text_color: Color32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Glyph {
    pub shapes: Vec<Shape>,
    pub size: Vec2,
    pub anchor: Pos2,
    /// Center and radius of the pin head; pulse and grab rings are drawn around it.
    pub head: (Pos2, f32),
    /// Text is laid out by the painter, which owns the fonts.
    pub badge: Option<BadgeLabel>,
}

impl Glyph {
    /// Shapes moved so the anchor lands on `tip`.
    pub fn placed_at(&self, tip: Pos2) -> Vec<Shape> {
        let offset = tip - self.anchor;
        self.shapes
            .iter()
            .cloned()
            .map(|mut shape| {
                shape.translate(offset);
                shape
            })
            .collect()
    }

    pub fn rect_at(&self, tip: Pos2) -> egui::Rect {
        egui::Rect::from_min_size(tip - self.anchor.to_vec2(), self.size)
    }
}

/// Pin size for `zoom`: grows linearly with zoom and is clamped to the configured range.
pub fn marker_size(zoom: f64, config: &GlyphConfig) -> Vec2 {
    let scale = 1.0 + config.zoom_step * (zoom - config.base_zoom) as f32;
    let width = (config.base_size * scale).clamp(config.min_size, config.max_size);
    vec2(width, width * 1.3)
}

pub fn badge_visible(zoom: f64, badge: Option<f64>, config: &GlyphConfig) -> bool {
    badge.is_some() && zoom >= config.reveal_zoom
}

pub fn format_badge(value: f64) -> String {
    format!("{:.0}%", value)
}

/// Glyph for a marker at `zoom`, with a badge when `badge` is set and the zoom reveals it.
pub fn render(style: GlyphStyle, color: Color32, zoom: f64, badge: Option<f64>, config: &GlyphConfig) -> Glyph {
    let size = marker_size(zoom, config);
    let badge_text = badge.filter(|_| badge_visible(zoom, badge, config)).map(format_badge);
    render_sized(style, color, size, badge_text, config.badge_growth)
}

pub fn render_sized(style: GlyphStyle, color: Color32, size: Vec2, badge: Option<String>, badge_growth: f32) -> Glyph {
    let growth = if badge.is_some() { badge_growth } else { 0.0 };
    let total = size + vec2(growth, growth);
    // The pin sits in the lower part of the box, centered; the badge uses the extra top-right space.
    let origin = vec2(growth / 2.0, growth);
    let outline = Stroke::new(1.5, Color32::WHITE);
    let (w, h) = (size.x, size.y);
    let at = |x: f32, y: f32| pos2(x, y) + origin;

    let mut shapes = Vec::with_capacity(4);
    let head = match style {
        GlyphStyle::Teardrop => {
            let r = w / 2.0;
            let center = at(w / 2.0, r);
            shapes.push(Shape::convex_polygon(
                vec![at(w / 2.0 - r * 0.8, r * 1.6), at(w / 2.0, h), at(w / 2.0 + r * 0.8, r * 1.6)],
                color,
                outline,
            ));
            shapes.push(Shape::circle_filled(center, r, color));
            shapes.push(Shape::circle_stroke(center, r, outline));
            shapes.push(Shape::circle_filled(center, r * 0.38, Color32::WHITE));
            (center, r)
        }
        GlyphStyle::Lollipop => {
            let r = w / 2.0 * 0.85;
            let center = at(w / 2.0, r + w * 0.075);
            shapes.push(Shape::line_segment([center, at(w / 2.0, h)], Stroke::new((w * 0.12).max(2.0), color)));
            shapes.push(Shape::circle_filled(center, r, color));
            shapes.push(Shape::circle_stroke(center, r, outline));
            (center, r)
        }
        GlyphStyle::Diamond => {
            let mid = h * 0.42;
            shapes.push(Shape::convex_polygon(
                vec![at(w / 2.0, 0.0), at(w, mid), at(w / 2.0, h), at(0.0, mid)],
                color,
                outline,
            ));
            let center = at(w / 2.0, mid);
            shapes.push(Shape::circle_filled(center, w * 0.16, Color32::WHITE));
            (center, w / 2.0)
        }
    };

    let badge = badge.map(|text| {
        let radius = (growth * 0.9).max(7.0);
        let center = pos2(total.x - radius * 0.8, radius * 0.8);
        shapes.push(Shape::circle_filled(center, radius, Color32::from_rgb(33, 33, 33)));
        shapes.push(Shape::circle_stroke(center, radius, Stroke::new(1.0, Color32::WHITE)));
        BadgeLabel {
            center,
            radius,
            text,
            text_color: Color32::WHITE,
        }
    });

    Glyph {
        shapes,
        size: total,
        anchor: at(w / 2.0, h),
        head,
        badge,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct GlyphKey {
    style: GlyphStyle,
    color: [u8; 4],
    // quarter-pixel steps
    width: u32,
    height: u32,
    badge: Option<String>,
}

/// Rendered glyphs keyed by everything that affects their geometry.
pub struct GlyphCache {
    cache: LruCache<GlyphKey, Glyph>,
}

impl GlyphCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: LruCache::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)),
        }
    }

    pub fn get(&mut self, style: GlyphStyle, color: Color32, zoom: f64, badge: Option<f64>, config: &GlyphConfig) -> Glyph {
        let size = marker_size(zoom, config);
        let badge_text = badge.filter(|_| badge_visible(zoom, badge, config)).map(format_badge);
        let key = GlyphKey {
            style,
            color: color.to_array(),
            width: (size.x * 4.0).round() as u32,
            height: (size.y * 4.0).round() as u32,
            badge: badge_text.clone(),
        };
        self.cache
            .get_or_insert(key, || render_sized(style, color, size, badge_text, config.badge_growth))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }
}

impl Default for GlyphCache {
    fn default() -> Self {
        Self::new(256)
    }
}
