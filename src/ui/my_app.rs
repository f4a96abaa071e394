use std::collections::{BTreeSet, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;

use eframe::egui;
use egui::{Color32, Margin, Style};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;

use bizmap::map::layers::{BaseStyle, LayerConfig, ROUTE_COLOR};
use bizmap::map::map_tile::{MapTile, TileKey};
use bizmap::map::viewport::Viewport;
use bizmap::markers::color::ColorMode;
use bizmap::markers::glyph::GlyphStyle;
use bizmap::markers::notice::NoticeKind;
use bizmap::maps_api::tile_retriever::TileRetriever;
use bizmap::{EngineConfig, FilterSet, MapOrchestrator};

use super::map_view::{MapView, RenderedLayers};
use super::store::{Dataset, InMemoryStore};

/// Viewer choices restored between runs.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ViewerSettings {
    pub viewport: Viewport,
    pub layers: LayerConfig,
    pub color_mode: ColorMode,
    pub glyph_style: GlyphStyle,
}

type TileResult = (TileKey, bizmap::Result<MapTile>);

pub struct MyApp {
    orchestrator: MapOrchestrator,
    store: Arc<InMemoryStore>,
    settings: ViewerSettings,
    filter: FilterSet,
    statuses: Vec<String>,
    focus_query: String,
    rendered_layers: RenderedLayers,
    memory: LruCache<TileKey, MapTile>,
    tile_retriever: TileRetriever,
    pending_tiles: HashSet<TileKey>,
    receiver: mpsc::UnboundedReceiver<TileResult>,
    sender: mpsc::UnboundedSender<TileResult>,
    runtime: tokio::runtime::Runtime,
}

impl eframe::App for MyApp {
    fn save(&mut self, storage: &mut dyn eframe::Storage) {
        self.settings.viewport = self.orchestrator.viewport().clone();
        eframe::set_value(storage, eframe::APP_KEY, &self.settings);
    }

    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        // Test for f11 key, to toggle fullscreen
        if let Some(new_fullscreen) = ctx.input(|i| {
            if i.key_pressed(egui::Key::F11) { Some(!i.viewport().fullscreen.unwrap_or(false)) }
            else                       { None                                            }
        }) {
            ctx.send_viewport_cmd(egui::ViewportCommand::Fullscreen(  new_fullscreen));
            ctx.send_viewport_cmd(egui::ViewportCommand::Decorations(!new_fullscreen));
            ctx.send_viewport_cmd(egui::ViewportCommand::Maximized(  !new_fullscreen));
            ctx.send_viewport_cmd(egui::ViewportCommand::Focus);
        }

        let now = Instant::now();
        self.orchestrator.tick(now);
        self.rendered_layers.apply(self.orchestrator.drain_layer_ops());
        for name in self.store.take_photo_requests() {
            log::info!("no photo viewer attached; {name} requested");
        }

        egui::SidePanel::left("controls").resizable(false).default_width(260.0).show(ctx, |ui| {
            self.controls(ui, now);
        });

        let frame = egui::Frame {
            fill: Color32::TRANSPARENT,
            inner_margin: Margin::same(0.0),
            outer_margin: Margin::same(0.0),
            ..Default::default()
        };
        egui::CentralPanel::default().frame(frame).show(ctx, |ui| {
            let mut missing_tiles = Vec::new();
            let size = ui.available_size();
            let map = MapView::new(
                "interactible_map",
                &mut self.orchestrator,
                &self.rendered_layers,
                &mut self.memory,
                &mut missing_tiles,
            )
            .viewport_size(size);
            ui.add(map);

            for key in missing_tiles {
                // Check if we need to fetch the tile, or are waiting for it
                if self.pending_tiles.contains(&key) || self.memory.peek(&key).is_some() {
                    continue;
                }
                let sender = self.sender.clone();
                let tile_retriever = self.tile_retriever.clone();
                let requester = ctx.clone();
                self.runtime.spawn(async move {
                    let result = tile_retriever.fetch_tile(key).await;
                    if sender.send((key, result)).is_ok() {
                        requester.request_repaint();
                    }
                });
                self.pending_tiles.insert(key);
            }
        });

        self.toasts(ctx, now);

        // Process completed requests
        while let Ok((key, result)) = self.receiver.try_recv() {
            self.pending_tiles.remove(&key);
            match result {
                Ok(tile) => {
                    self.memory.put(key, tile);
                }
                Err(e) => log::warn!("tile {key:?}: {e}"),
            }
        }

        // Timers in the engine run off the frame clock.
        ctx.request_repaint_after(std::time::Duration::from_millis(50));
    }
}

impl MyApp {
    pub fn new(cc: &eframe::CreationContext<'_>, config: EngineConfig, dataset: Dataset, tile_retriever: TileRetriever) -> Self {
        cc.egui_ctx.set_style(Self::slate_style(&cc.egui_ctx));
        let settings: ViewerSettings = cc
            .storage
            .and_then(|storage| eframe::get_value(storage, eframe::APP_KEY))
            .unwrap_or_default();

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(8) // Set max number of worker threads
            .thread_name("bizmap-io")
            .thread_stack_size(3 * 1024 * 1024) // 3MB stack size
            .enable_all()
            .build()
            .expect("Unable to create runtime");
        let (sender, receiver) = mpsc::unbounded_channel();

        let store = Arc::new(InMemoryStore::new(&dataset.entities));
        let statuses: BTreeSet<String> = dataset.entities.iter().filter_map(|e| e.status.clone()).collect();
        let mut orchestrator = MapOrchestrator::new(config, settings.viewport.clone(), store.clone(), runtime.handle().clone());
        let now = Instant::now();
        orchestrator.set_entities(dataset.entities, now);
        orchestrator.set_metrics(Ok(dataset.metrics), now);
        orchestrator.set_route(dataset.route.as_deref(), dataset.waypoints);
        orchestrator.set_layer_config(settings.layers.clone());
        orchestrator.set_color_mode(settings.color_mode);
        orchestrator.set_glyph_style(settings.glyph_style);

        Self {
            orchestrator,
            store,
            settings,
            filter: FilterSet::default(),
            statuses: statuses.into_iter().collect(),
            focus_query: String::new(),
            rendered_layers: RenderedLayers::default(),
            memory: LruCache::new(NonZeroUsize::new(512).unwrap_or(NonZeroUsize::MIN)),
            tile_retriever,
            pending_tiles: HashSet::new(),
            receiver,
            sender,
            runtime,
        }
    }

    fn controls(&mut self, ui: &mut egui::Ui, now: Instant) {
        ui.heading("Companies");
        ui.label(format!("{} on the map", self.orchestrator.visible_count()));
        ui.separator();

        let mut filter = self.filter.clone();
        ui.label("Search");
        ui.text_edit_singleline(&mut filter.search);
        ui.label("Status");
        for status in &self.statuses {
            let mut on = filter.statuses.contains(status);
            if ui.checkbox(&mut on, status.as_str()).changed() {
                if on {
                    filter.statuses.insert(status.clone());
                } else {
                    filter.statuses.remove(status);
                }
            }
        }
        if filter != self.filter {
            self.filter = filter.clone();
            self.orchestrator.set_filter(filter, now);
        }

        ui.separator();
        ui.label("Focus");
        ui.text_edit_singleline(&mut self.focus_query);
        let query = self.focus_query.trim().to_lowercase();
        if !query.is_empty() {
            let mut target = None;
            let mut matches: Vec<(String, String)> = self
                .orchestrator
                .visible_entities()
                .filter(|e| e.name.to_lowercase().contains(&query))
                .map(|e| (e.id.clone(), e.name.clone()))
                .collect();
            matches.sort_by(|a, b| a.1.cmp(&b.1));
            matches.truncate(8);
            for (id, name) in matches {
                if ui.link(name).clicked() {
                    target = Some(id);
                }
            }
            if let Some(id) = target {
                self.orchestrator.focus(&id, now);
                self.focus_query.clear();
            }
        }

        ui.separator();
        let mut mode = self.settings.color_mode;
        egui::ComboBox::from_label("Color by")
            .selected_text(mode.label())
            .show_ui(ui, |ui| {
                for m in ColorMode::ALL {
                    ui.selectable_value(&mut mode, m, m.label());
                }
            });
        if mode != self.settings.color_mode {
            self.settings.color_mode = mode;
            self.orchestrator.set_color_mode(mode);
        }

        let mut style = self.settings.glyph_style;
        egui::ComboBox::from_label("Pin")
            .selected_text(style.label())
            .show_ui(ui, |ui| {
                for s in GlyphStyle::ALL {
                    ui.selectable_value(&mut style, s, s.label());
                }
            });
        if style != self.settings.glyph_style {
            self.settings.glyph_style = style;
            self.orchestrator.set_glyph_style(style);
        }

        let mut reveal = self.orchestrator.config().glyph.reveal_zoom;
        if ui.add(egui::Slider::new(&mut reveal, 0.0..=20.0).text("Bank share from zoom")).changed() {
            self.orchestrator.set_reveal_zoom(reveal);
        }

        ui.separator();
        let mut layers = self.settings.layers.clone();
        egui::ComboBox::from_label("Base map")
            .selected_text(layers.base_style.label())
            .show_ui(ui, |ui| {
                for s in BaseStyle::ALL {
                    ui.selectable_value(&mut layers.base_style, s, s.label());
                }
            });
        ui.checkbox(&mut layers.show_markers, "Markers");
        ui.checkbox(&mut layers.show_route, "Route");
        ui.checkbox(&mut layers.show_waypoints, "Waypoints");
        ui.checkbox(&mut layers.show_3d, "3D columns");
        ui.add_enabled(layers.show_3d, egui::Slider::new(&mut layers.extrusion_opacity, 0.0..=1.0).text("Opacity"));
        ui.add_enabled(layers.show_3d, egui::Slider::new(&mut layers.height_multiplier, 0.0..=5.0).text("Height"));
        if layers != self.settings.layers {
            self.settings.layers = layers.clone();
            self.orchestrator.set_layer_config(layers);
        }

        if let Some(selected) = self.store.selected() {
            ui.separator();
            ui.label(format!("Selected: {selected}"));
        }
    }

    fn toasts(&mut self, ctx: &egui::Context, now: Instant) {
        let remaining = self.orchestrator.undo_remaining(now);
        let record = self.orchestrator.undo_record(now).map(|r| r.name.clone());
        let notices: Vec<(NoticeKind, String)> = self
            .orchestrator
            .notices()
            .iter()
            .map(|n| (n.kind, n.message.clone()))
            .collect();
        if record.is_none() && notices.is_empty() {
            return;
        }

        egui::Area::new(egui::Id::new("toasts"))
            .anchor(egui::Align2::RIGHT_BOTTOM, [-16.0, -16.0])
            .order(egui::Order::Foreground)
            .show(ctx, |ui| {
                for (kind, message) in &notices {
                    let color = match kind {
                        NoticeKind::Info => Color32::LIGHT_BLUE,
                        NoticeKind::Success => Color32::LIGHT_GREEN,
                        NoticeKind::Error => Color32::LIGHT_RED,
                    };
                    egui::Frame::popup(ui.style()).show(ui, |ui| {
                        ui.colored_label(color, message.as_str());
                    });
                }
                if let (Some(name), Some(remaining)) = (record, remaining) {
                    egui::Frame::popup(ui.style()).show(ui, |ui| {
                        ui.horizontal(|ui| {
                            ui.label(format!("{name} moved ({}s)", remaining.as_secs() + 1));
                            if ui.button("Undo").clicked() {
                                self.orchestrator.undo(now);
                            }
                            if ui.small_button("✕").clicked() {
                                self.orchestrator.dismiss_undo();
                            }
                        });
                    });
                }
            });
    }

    /// Slate panels with the route blue as the accent, so controls match the map overlays.
    pub fn slate_style(ctx: &egui::Context) -> Style {
        use egui::{FontFamily, FontId, Rounding, Stroke, TextStyle};

        let slate = Color32::from_rgb(0x26, 0x32, 0x38);
        let raised = Color32::from_rgb(0x37, 0x47, 0x4f);
        let accent = ROUTE_COLOR;

        let mut style = (*ctx.style()).clone();
        style.visuals = egui::Visuals::dark();
        style.text_styles.insert(TextStyle::Heading, FontId::new(18.0, FontFamily::Proportional));
        style.text_styles.insert(TextStyle::Body, FontId::new(14.0, FontFamily::Proportional));
        style.text_styles.insert(TextStyle::Button, FontId::new(14.0, FontFamily::Proportional));

        let widgets = &mut style.visuals.widgets;
        for visuals in [&mut widgets.noninteractive, &mut widgets.inactive] {
            visuals.bg_fill = slate;
            visuals.weak_bg_fill = raised;
            visuals.rounding = Rounding::same(3.0);
        }
        widgets.hovered.weak_bg_fill = accent.gamma_multiply(0.6);
        widgets.hovered.bg_stroke = Stroke::new(1.0, accent);
        widgets.active.weak_bg_fill = accent;

        style.visuals.selection.bg_fill = accent.gamma_multiply(0.8);
        style.visuals.selection.stroke = Stroke::new(1.0, Color32::WHITE);
        style.visuals.hyperlink_color = accent;
        style.visuals.panel_fill = slate;
        style.visuals.window_fill = raised;
        style.visuals.window_stroke = Stroke::new(1.0, accent.gamma_multiply(0.5));
        style.visuals.window_rounding = Rounding::same(8.0);
        style.spacing.item_spacing = egui::vec2(6.0, 5.0);

        style
    }
}
