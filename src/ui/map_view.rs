use std::collections::BTreeMap;

use egui::epaint::{Color32, Pos2, Rect, Shape, Stroke};
use egui::{vec2, Align2, FontId, Response, Sense, Ui, Vec2, Widget};
use lru::LruCache;
use tokio::time::Instant;

use bizmap::map::layers::{BaseStyle, LayerId, LayerOp, LayerSpec, PaintValue};
use bizmap::map::map_tile::{visible_tiles, MapTile, TileKey};
use bizmap::markers::popup::{PopupAction, PopupKind};
use bizmap::{MapOrchestrator, MarkerView};

const MOUSE: u64 = 0;

/// The layers the viewer currently renders, kept in sync by applying [`LayerOp`]s.
#[derive(Debug, Default)]
pub struct RenderedLayers {
    style: BaseStyle,
    layers: BTreeMap<LayerId, LayerSpec>,
}

impl RenderedLayers {
    pub fn apply(&mut self, ops: Vec<LayerOp>) {
        for op in ops {
            match op {
                LayerOp::SetStyle(style) => {
                    self.style = style;
                    self.layers.clear();
                }
                LayerOp::AddLayer(id, spec) => {
                    self.layers.insert(id, spec);
                }
                LayerOp::RemoveLayer(id) => {
                    self.layers.remove(&id);
                }
                LayerOp::SetPaint(id, key, value) => {
                    if let Some(layer) = self.layers.get_mut(&id) {
                        layer.paint.insert(key, value);
                    }
                }
                LayerOp::SetVisibility(id, visible) => {
                    if let Some(layer) = self.layers.get_mut(&id) {
                        layer.visible = visible;
                    }
                }
            }
        }
    }

    pub fn style(&self) -> BaseStyle {
        self.style
    }

    fn shown(&self, id: LayerId) -> Option<&LayerSpec> {
        self.layers.get(&id).filter(|l| l.visible)
    }

    fn number(&self, id: LayerId, key: &str, default: f64) -> f64 {
        match self.layers.get(&id).and_then(|l| l.paint.get(key)) {
            Some(PaintValue::Number(n)) => *n,
            _ => default,
        }
    }

    fn color(&self, id: LayerId, key: &str, default: Color32) -> Color32 {
        match self.layers.get(&id).and_then(|l| l.paint.get(key)) {
            Some(PaintValue::Color(c)) => *c,
            _ => default,
        }
    }
}

pub struct MapView<'a> {
    id: egui::Id,
    orchestrator: &'a mut MapOrchestrator,
    layers: &'a RenderedLayers,
    tile_cache: &'a mut LruCache<TileKey, MapTile>,
    missing_tiles: &'a mut Vec<TileKey>,
    viewport_size: Vec2,
}

impl<'a> MapView<'a> {
    pub fn new(
        id_source: impl std::hash::Hash,
        orchestrator: &'a mut MapOrchestrator,
        layers: &'a RenderedLayers,
        tile_cache: &'a mut LruCache<TileKey, MapTile>,
        missing_tiles: &'a mut Vec<TileKey>,
    ) -> Self {
        Self {
            id: egui::Id::new(id_source),
            orchestrator,
            layers,
            tile_cache,
            missing_tiles,
            viewport_size: Vec2::new(1024.0, 768.0),
        }
    }

    pub fn viewport_size(mut self, size: Vec2) -> Self {
        self.viewport_size = size;
        self
    }
}

impl<'a> Widget for MapView<'a> {
    fn ui(self, ui: &mut Ui) -> Response {
        let MapView {
            id,
            orchestrator,
            layers,
            tile_cache,
            missing_tiles,
            viewport_size,
        } = self;
        let now = Instant::now();

        let (rect, response) = ui.allocate_exact_size(viewport_size, Sense::click_and_drag());
        if orchestrator.viewport().size() != rect.size() {
            orchestrator.viewport_changed(rect.size());
        }
        let origin = rect.min.to_vec2();
        let painter = ui.painter().with_clip_rect(rect);
        painter.rect_filled(rect, 0.0, Color32::from_gray(40));

        // Interactions, in local coordinates.
        let views = orchestrator.marker_views();
        let pointer = response.hover_pos().map(|p| p - origin);
        let hit = pointer.and_then(|p| hit_test(&views, p));

        let (pressed, released, latest) = ui.input(|i| {
            (
                i.pointer.primary_pressed(),
                i.pointer.primary_released(),
                i.pointer.latest_pos().map(|p| p - origin),
            )
        });
        if let Some(pos) = latest {
            if pressed {
                if let Some(Hit::Marker(entity_id)) = &hit {
                    orchestrator.pointer_down(entity_id, MOUSE, pos, now);
                }
            }
            orchestrator.pointer_move(MOUSE, pos, now);
            if released {
                orchestrator.pointer_up(MOUSE, pos, now);
            }
        } else {
            orchestrator.pointer_leave(MOUSE, now);
        }

        if response.dragged() {
            orchestrator.pan_by(response.drag_delta());
        }
        let anchor = pointer.unwrap_or((rect.size() / 2.0).to_pos2());
        let zoom_delta = ui.input(|i| i.zoom_delta()) - 1.0;
        let scroll = ui.input(|i| i.smooth_scroll_delta).y;
        if zoom_delta.abs() > f32::EPSILON {
            orchestrator.scroll_zoom(zoom_delta.clamp(-1.0, 1.0) as f64, anchor);
        } else if scroll.abs() > f32::EPSILON && response.hovered() {
            orchestrator.scroll_zoom((scroll / 10.0).tanh() as f64, anchor);
        }
        if response.double_clicked() {
            orchestrator.double_click_zoom(anchor);
        } else if response.clicked() {
            match &hit {
                Some(Hit::Marker(entity_id)) => orchestrator.click_marker(entity_id, now),
                Some(Hit::Cluster(cluster)) => {
                    orchestrator.click_cluster(*cluster, now);
                }
                None => orchestrator.base_map_click(now),
            }
        }

        let hover_key = id.with("hovered");
        let previous = ui.data_mut(|d| d.get_temp::<Option<String>>(hover_key)).flatten();
        let current = match &hit {
            Some(Hit::Marker(entity_id)) => Some(entity_id.clone()),
            _ => None,
        };
        if previous != current {
            if let Some(previous) = &previous {
                orchestrator.hover_leave(previous, now);
            }
            if let Some(current) = &current {
                orchestrator.hover_enter(current, now);
            }
            ui.data_mut(|d| d.insert_temp(hover_key, current));
        }

        // Base map
        for (key, tile_rect) in visible_tiles(orchestrator.viewport(), layers.style()) {
            let tile_rect = tile_rect.translate(origin);
            if let Some(tile) = tile_cache.get_mut(&key) {
                let texture = tile.texture(ui.ctx());
                let uv = Rect::from_min_max(Pos2::ZERO, Pos2::new(1.0, 1.0));
                painter.image(texture.id(), tile_rect, uv, Color32::WHITE);
            } else {
                missing_tiles.push(key);
                painter.rect_filled(tile_rect.shrink(0.5), 0.0, Color32::from_gray(70));
            }
        }

        let viewport = orchestrator.viewport().clone();
        let to_screen = |c: &bizmap::Coordinate| viewport.project(c) + origin;

        if layers.shown(LayerId::Route).is_some() {
            let width = layers.number(LayerId::Route, "width", 4.0) as f32;
            let color = layers.color(LayerId::Route, "color", Color32::BLUE);
            let points: Vec<Pos2> = orchestrator.route().iter().map(&to_screen).collect();
            if points.len() > 1 {
                painter.add(Shape::line(points, Stroke::new(width, color)));
            }
        }
        if layers.shown(LayerId::Waypoints).is_some() {
            let color = layers.color(LayerId::Waypoints, "color", Color32::BLUE);
            for (n, waypoint) in orchestrator.waypoints().iter().enumerate() {
                let at = to_screen(waypoint);
                painter.circle(at, 9.0, color, Stroke::new(1.5, Color32::WHITE));
                painter.text(at, Align2::CENTER_CENTER, (n + 1).to_string(), FontId::proportional(11.0), Color32::WHITE);
            }
        }

        // Markers
        let extrusion = layers.shown(LayerId::Extrusion).is_some().then(|| {
            (
                layers.number(LayerId::Extrusion, "opacity", 0.6) as f32,
                layers.number(LayerId::Extrusion, "height_multiplier", 1.0) as f32,
            )
        });
        let time = ui.input(|i| i.time) as f32;
        if layers.shown(LayerId::Markers).is_some() {
            for view in &views {
                match view {
                    MarkerView::Cluster { position, count, .. } => {
                        let at = *position + origin;
                        let radius = 14.0 + (*count as f32).log10() * 6.0;
                        painter.circle(at, radius, Color32::from_rgb(0x19, 0x76, 0xd2), Stroke::new(2.0, Color32::WHITE));
                        painter.text(at, Align2::CENTER_CENTER, count.to_string(), FontId::proportional(13.0), Color32::WHITE);
                    }
                    MarkerView::Marker {
                        position,
                        glyph,
                        pulsing,
                        grabbed,
                        ..
                    } => {
                        let tip = *position + origin;
                        if let Some((opacity, height)) = extrusion {
                            let column = Rect::from_min_max(tip - vec2(3.0, 18.0 * height), tip + vec2(3.0, 0.0));
                            painter.rect_filled(column, 1.0, Color32::from_black_alpha((opacity * 255.0) as u8));
                        }
                        let (head, head_radius) = glyph.head;
                        let head = head + (tip - glyph.anchor);
                        if *pulsing {
                            let phase = (time * 2.0).fract();
                            let alpha = ((1.0 - phase) * 200.0) as u8;
                            painter.circle_stroke(
                                head,
                                head_radius + 4.0 + phase * 14.0,
                                Stroke::new(2.0, Color32::from_rgba_unmultiplied(255, 193, 7, alpha)),
                            );
                        }
                        painter.extend(glyph.placed_at(tip));
                        if let Some(badge) = &glyph.badge {
                            let center = badge.center + (tip - glyph.anchor);
                            painter.text(center, Align2::CENTER_CENTER, &badge.text, FontId::proportional(9.0), badge.text_color);
                        }
                        if *grabbed {
                            painter.circle_stroke(head, head_radius + 3.0, Stroke::new(2.0, Color32::from_rgb(255, 193, 7)));
                        }
                    }
                }
            }
        }

        draw_popups(ui, orchestrator, &views, origin, now);

        response
    }
}

enum Hit {
    Marker(String),
    Cluster(bizmap::map::cluster::ClusterId),
}

/// Topmost marker or cluster under `pos`. Later views draw on top.
fn hit_test(views: &[MarkerView], pos: Pos2) -> Option<Hit> {
    views.iter().rev().find_map(|view| match view {
        MarkerView::Marker {
            entity_id, position, glyph, ..
        } => glyph
            .rect_at(*position)
            .contains(pos)
            .then(|| Hit::Marker(entity_id.clone())),
        MarkerView::Cluster { id, position, count } => {
            let radius = 14.0 + (*count as f32).log10() * 6.0;
            (position.distance(pos) <= radius).then_some(Hit::Cluster(*id))
        }
    })
}

fn draw_popups(ui: &mut Ui, orchestrator: &mut MapOrchestrator, views: &[MarkerView], origin: Vec2, now: Instant) {
    let mut close = false;
    let mut photos = None;
    for popup in orchestrator.visible_popups() {
        let Some(content) = orchestrator.popup_content(&popup.entity_id) else {
            continue;
        };
        let Some((tip, height)) = views.iter().find_map(|v| match v {
            MarkerView::Marker {
                entity_id, position, glyph, ..
            } if *entity_id == popup.entity_id => Some((*position + origin, glyph.size.y)),
            _ => None,
        }) else {
            continue;
        };
        let persistent = popup.kind == PopupKind::Persistent;
        egui::Area::new(egui::Id::new(("popup", &popup.entity_id, persistent)))
            .fixed_pos(tip - vec2(0.0, height + 8.0))
            .pivot(Align2::CENTER_BOTTOM)
            .order(egui::Order::Foreground)
            .interactable(persistent && !popup.closing)
            .show(ui.ctx(), |ui| {
                if popup.closing {
                    ui.set_opacity(0.4);
                }
                egui::Frame::popup(ui.style()).show(ui, |ui| {
                    ui.set_max_width(260.0);
                    ui.horizontal(|ui| {
                        ui.strong(content.title.as_str());
                        if persistent && ui.small_button("✕").clicked() {
                            close = true;
                        }
                    });
                    if let Some(breakdown) = &content.affiliations {
                        ui.separator();
                        for row in &breakdown.rows {
                            ui.horizontal(|ui| {
                                let color = row.color.unwrap_or(Color32::GRAY);
                                let (swatch, _) = ui.allocate_exact_size(vec2(10.0, 10.0), Sense::hover());
                                ui.painter().rect_filled(swatch, 2.0, color);
                                ui.label(format!("{} {:.0}%", row.bank_name, row.percentage));
                            });
                        }
                        ui.label(format!("Total {:.0}%", breakdown.total));
                    }
                    ui.separator();
                    egui::Grid::new(("popup_fields", &popup.entity_id)).show(ui, |ui| {
                        for (label, value) in &content.fields {
                            ui.label(label.as_str());
                            ui.label(value.as_str());
                            ui.end_row();
                        }
                    });
                    if persistent {
                        for action in &content.actions {
                            match action {
                                PopupAction::OpenPhotos => {
                                    if ui.button("Photos").clicked() {
                                        photos = Some(popup.entity_id.clone());
                                    }
                                }
                            }
                        }
                    }
                });
            });
    }
    if let Some(entity_id) = photos {
        orchestrator.open_photos(&entity_id, now);
    } else if close {
        orchestrator.close_popup(now);
    }
}
