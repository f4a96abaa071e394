//! Declarative layer state for the rendering engine.
//!
//! [`desired`] computes the layers and paint values the current settings call
//! for. [`AppliedLayers::reconcile`] diffs that against what the engine holds
//! and returns only the operations needed to get there. A base style swap
//! drops every custom layer on the engine side, so the applied set is cleared
//! and everything is re-added in the same pass.

use std::collections::BTreeMap;

use egui::Color32;
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum BaseStyle {
    #[default]
    Streets,
    Light,
    Dark,
    Satellite,
}

impl BaseStyle {
    pub const ALL: [BaseStyle; 4] = [BaseStyle::Streets, BaseStyle::Light, BaseStyle::Dark, BaseStyle::Satellite];

    pub fn label(&self) -> &'static str {
        match self {
            BaseStyle::Streets => "Streets",
            BaseStyle::Light => "Light",
            BaseStyle::Dark => "Dark",
            BaseStyle::Satellite => "Satellite",
        }
    }

    /// Raster tile URL with `{z}`, `{x}` and `{y}` placeholders.
    pub fn url_template(&self) -> &'static str {
        match self {
            BaseStyle::Streets => "https://tile.openstreetmap.org/{z}/{x}/{y}.png",
            BaseStyle::Light => "https://a.basemaps.cartocdn.com/light_all/{z}/{x}/{y}.png",
            BaseStyle::Dark => "https://a.basemaps.cartocdn.com/dark_all/{z}/{x}/{y}.png",
            BaseStyle::Satellite => {
                "https://server.arcgisonline.com/ArcGIS/rest/services/World_Imagery/MapServer/tile/{z}/{y}/{x}"
            }
        }
    }

    pub fn tile_url(&self, z: u32, x: u32, y: u32) -> String {
        self.url_template()
            .replace("{z}", &z.to_string())
            .replace("{x}", &x.to_string())
            .replace("{y}", &y.to_string())
    }

    pub fn max_zoom(&self) -> u32 {
        match self {
            BaseStyle::Satellite => 18,
            _ => 19,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LayerConfig {
    pub base_style: BaseStyle,
    pub show_3d: bool,
    pub extrusion_opacity: f64,
    pub height_multiplier: f64,
    pub show_markers: bool,
    pub show_route: bool,
    pub show_waypoints: bool,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            base_style: BaseStyle::default(),
            show_3d: false,
            extrusion_opacity: 0.6,
            height_multiplier: 1.0,
            show_markers: true,
            show_route: true,
            show_waypoints: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LayerId {
    Extrusion,
    Route,
    Waypoints,
    Markers,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PaintValue {
    Number(f64),
    Color(Color32),
}

#[derive(Debug, Clone, PartialEq)]
pub struct LayerSpec {
    pub visible: bool,
    pub paint: BTreeMap<&'static str, PaintValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DesiredLayers {
    pub style: BaseStyle,
    pub layers: BTreeMap<LayerId, LayerSpec>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LayerOp {
    SetStyle(BaseStyle),
    AddLayer(LayerId, LayerSpec),
    RemoveLayer(LayerId),
    SetPaint(LayerId, &'static str, PaintValue),
    SetVisibility(LayerId, bool),
}

pub const ROUTE_COLOR: Color32 = Color32::from_rgb(0x1e, 0x88, 0xe5);

/// Layers implied by `config`. Route and waypoint layers only exist when there is something to draw.
pub fn desired(config: &LayerConfig, has_route: bool, has_waypoints: bool) -> DesiredLayers {
    let mut layers = BTreeMap::new();
    if config.show_3d {
        layers.insert(
            LayerId::Extrusion,
            LayerSpec {
                visible: true,
                paint: BTreeMap::from([
                    ("opacity", PaintValue::Number(config.extrusion_opacity.clamp(0.0, 1.0))),
                    ("height_multiplier", PaintValue::Number(config.height_multiplier.max(0.0))),
                ]),
            },
        );
    }
    if has_route {
        layers.insert(
            LayerId::Route,
            LayerSpec {
                visible: config.show_route,
                paint: BTreeMap::from([("color", PaintValue::Color(ROUTE_COLOR)), ("width", PaintValue::Number(4.0))]),
            },
        );
    }
    if has_waypoints {
        layers.insert(
            LayerId::Waypoints,
            LayerSpec {
                visible: config.show_waypoints,
                paint: BTreeMap::from([("color", PaintValue::Color(ROUTE_COLOR))]),
            },
        );
    }
    layers.insert(
        LayerId::Markers,
        LayerSpec {
            visible: config.show_markers,
            paint: BTreeMap::new(),
        },
    );
    DesiredLayers {
        style: config.base_style,
        layers,
    }
}

/// What the rendering engine currently holds.
#[derive(Debug, Default, Clone)]
pub struct AppliedLayers {
    style: Option<BaseStyle>,
    layers: BTreeMap<LayerId, LayerSpec>,
}

impl AppliedLayers {
    pub fn style(&self) -> Option<BaseStyle> {
        self.style
    }

    pub fn get(&self, id: LayerId) -> Option<&LayerSpec> {
        self.layers.get(&id)
    }

    /// Brings the applied state to `target`, returning the operations performed.
    pub fn reconcile(&mut self, target: &DesiredLayers) -> Vec<LayerOp> {
        let mut ops = Vec::new();
        if self.style != Some(target.style) {
            ops.push(LayerOp::SetStyle(target.style));
            self.style = Some(target.style);
            self.layers.clear();
        }

        let stale: Vec<LayerId> = self.layers.keys().filter(|id| !target.layers.contains_key(id)).copied().collect();
        for id in stale {
            self.layers.remove(&id);
            ops.push(LayerOp::RemoveLayer(id));
        }

        for (id, spec) in &target.layers {
            match self.layers.get_mut(id) {
                None => {
                    ops.push(LayerOp::AddLayer(*id, spec.clone()));
                    self.layers.insert(*id, spec.clone());
                }
                Some(applied) => {
                    for (key, value) in &spec.paint {
                        if applied.paint.get(key) != Some(value) {
                            ops.push(LayerOp::SetPaint(*id, *key, *value));
                            applied.paint.insert(*key, *value);
                        }
                    }
                    if applied.visible != spec.visible {
                        ops.push(LayerOp::SetVisibility(*id, spec.visible));
                        applied.visible = spec.visible;
                    }
                }
            }
        }
        if !ops.is_empty() {
            log::debug!("layer reconcile: {} ops", ops.len());
        }
        ops
    }
}
