//! Wires the marker engine together and to its host.
//!
//! The orchestrator is driven by the host's event loop: viewport and pointer
//! events come in through the methods below, and [`MapOrchestrator::tick`] is
//! called once per frame to fire timers and pick up finished location updates.
//! The only asynchronous work, the location-update call, runs on the tokio
//! runtime and reports back through a channel drained by `tick`.

use std::collections::HashMap;
use std::sync::Arc;

use egui::{Pos2, Vec2};
use futures::future::BoxFuture;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::{EngineConfig, RemoteSettings};
use crate::entity::{Entity, EntityId, FilterSet, Metrics};
use crate::error::{EngineError, Result};
use crate::map::cluster::{ClusterId, ClusterIndex, ClusterOrPoint};
use crate::map::geo::Coordinate;
use crate::map::layers::{desired, AppliedLayers, LayerConfig, LayerOp};
use crate::map::polyline;
use crate::map::viewport::{FlyTo, InteractionLock, Viewport};
use crate::markers::color::{color_for, ColorMode, Palette};
use crate::markers::drag::{DragEffect, DragGestureController, DragPhase, PointerId};
use crate::markers::glyph::{Glyph, GlyphCache, GlyphStyle};
use crate::markers::notice::{NoticeKind, Notices};
use crate::markers::popup::{build_content, PopupContent, PopupKind, PopupStateManager, VisiblePopup};
use crate::markers::undo::{UndoRecord, UndoSlot};

/// Collaborators the engine calls out to.
pub trait MapCallbacks: Send + Sync {
    /// A marker was clicked (`Some`) or its popup was closed (`None`).
    fn on_select(&self, entity: Option<&Entity>);

    /// Persists a new position. The engine never retries on failure.
    fn update_location(&self, entity_id: &str, latitude: f64, longitude: f64) -> BoxFuture<'static, std::result::Result<(), String>>;

    fn open_photos(&self, entity_id: &str, name: &str);

    /// The fly-to for a focus request has started.
    fn focus_handled(&self, entity_id: &str);
}

/// A marker ready to draw, positioned relative to the viewport's top-left corner.
#[derive(Debug, Clone, PartialEq)]
pub enum MarkerView {
    Cluster {
        id: ClusterId,
        position: Pos2,
        count: usize,
    },
    Marker {
        entity_id: EntityId,
        position: Pos2,
        glyph: Glyph,
        pulsing: bool,
        grabbed: bool,
    },
}

#[derive(Debug)]
enum UpdateKind {
    Drag,
    Undo(UndoRecord),
}

#[derive(Debug)]
struct UpdateOutcome {
    entity_id: EntityId,
    kind: UpdateKind,
    result: std::result::Result<(), String>,
}

pub struct MapOrchestrator {
    config: EngineConfig,
    callbacks: Arc<dyn MapCallbacks>,
    runtime: Handle,
    sender: mpsc::UnboundedSender<UpdateOutcome>,
    receiver: mpsc::UnboundedReceiver<UpdateOutcome>,

    entities: Vec<Entity>,
    metrics: Metrics,
    filter: FilterSet,
    visible: HashMap<EntityId, Entity>,
    index: ClusterIndex,
    rendered: Vec<ClusterOrPoint>,

    viewport: Viewport,
    lock: InteractionLock,
    fly: Option<FlyTo>,
    deferred_focus: Option<EntityId>,
    pulse: Option<(EntityId, Instant)>,

    drags: HashMap<EntityId, DragGestureController>,
    pointers: HashMap<PointerId, EntityId>,
    popups: PopupStateManager,
    undo: UndoSlot,
    undo_in_flight: bool,
    notices: Notices,

    color_mode: ColorMode,
    palette: Palette,
    glyphs: GlyphCache,

    route: Vec<Coordinate>,
    waypoints: Vec<Coordinate>,
    layer_config: LayerConfig,
    applied_layers: AppliedLayers,
    layer_ops: Vec<LayerOp>,
}

impl MapOrchestrator {
    pub fn new(config: EngineConfig, viewport: Viewport, callbacks: Arc<dyn MapCallbacks>, runtime: Handle) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut orchestrator = Self {
            index: ClusterIndex::new(config.cluster.clone()),
            popups: PopupStateManager::new(config.popup.clone()),
            undo: UndoSlot::new(config.drag.undo_window),
            notices: Notices::new(config.notices.duration),
            config,
            callbacks,
            runtime,
            sender,
            receiver,
            entities: Vec::new(),
            metrics: Metrics::default(),
            filter: FilterSet::default(),
            visible: HashMap::new(),
            rendered: Vec::new(),
            viewport,
            lock: InteractionLock::default(),
            fly: None,
            deferred_focus: None,
            pulse: None,
            drags: HashMap::new(),
            pointers: HashMap::new(),
            undo_in_flight: false,
            color_mode: ColorMode::default(),
            palette: Palette::default(),
            glyphs: GlyphCache::default(),
            route: Vec::new(),
            waypoints: Vec::new(),
            layer_config: LayerConfig::default(),
            applied_layers: AppliedLayers::default(),
            layer_ops: Vec::new(),
        };
        orchestrator.refresh_layers();
        orchestrator
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn viewport(&self) -> &Viewport {
        &self.viewport
    }

    pub fn interaction_lock(&self) -> &InteractionLock {
        &self.lock
    }

    pub fn notices(&self) -> &Notices {
        &self.notices
    }

    pub fn rendered(&self) -> &[ClusterOrPoint] {
        &self.rendered
    }

    pub fn entity(&self, id: &str) -> Option<&Entity> {
        self.visible.get(id)
    }

    /// Entities passing the current filter, in no particular order.
    pub fn visible_entities(&self) -> impl Iterator<Item = &Entity> {
        self.visible.values()
    }

    pub fn visible_count(&self) -> usize {
        self.visible.len()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn filter(&self) -> &FilterSet {
        &self.filter
    }

    pub fn color_mode(&self) -> ColorMode {
        self.color_mode
    }

    pub fn glyph_style(&self) -> GlyphStyle {
        self.config.glyph.style
    }

    pub fn layer_config(&self) -> &LayerConfig {
        &self.layer_config
    }

    pub fn route(&self) -> &[Coordinate] {
        &self.route
    }

    pub fn waypoints(&self) -> &[Coordinate] {
        &self.waypoints
    }

    pub fn pulsing(&self) -> Option<&str> {
        self.pulse.as_ref().map(|(id, _)| id.as_str())
    }

    pub fn is_flying(&self) -> bool {
        self.fly.is_some()
    }

    pub fn undo_record(&self, now: Instant) -> Option<&UndoRecord> {
        self.undo.current(now)
    }

    pub fn undo_remaining(&self, now: Instant) -> Option<std::time::Duration> {
        self.undo.remaining(now)
    }

    pub fn visible_popups(&self) -> Vec<VisiblePopup> {
        self.popups.visible()
    }

    pub fn popup_content(&self, entity_id: &str) -> Option<PopupContent> {
        let entity = self.visible.get(entity_id)?;
        Some(build_content(entity, &self.metrics, &self.config.tooltip_fields))
    }

    /// Replaces the base entity list.
    pub fn set_entities(&mut self, entities: Vec<Entity>, now: Instant) {
        self.entities = entities;
        self.rebuild(now);
    }

    pub fn set_filter(&mut self, filter: FilterSet, now: Instant) {
        if filter == self.filter {
            return;
        }
        self.filter = filter;
        self.rebuild(now);
    }

    /// New affiliation and visit aggregates. A failed fetch renders with no data.
    pub fn set_metrics(&mut self, metrics: Result<Metrics>, now: Instant) {
        self.metrics = match metrics {
            Ok(metrics) => metrics,
            Err(e) => {
                log::warn!("metrics unavailable, rendering without them: {e}");
                Metrics::unavailable()
            }
        };
        self.rebuild(now);
    }

    /// Applies externally stored settings. A failed fetch keeps the current values.
    pub fn apply_remote_settings(&mut self, settings: Result<RemoteSettings>) {
        match settings {
            Ok(settings) => {
                if let Some(fields) = settings.tooltip_fields {
                    self.config.tooltip_fields = fields;
                }
                if let Some(zoom) = settings.reveal_zoom {
                    self.config.glyph.reveal_zoom = zoom;
                }
                self.glyphs.clear();
            }
            Err(e) => log::warn!("keeping current settings: {e}"),
        }
    }

    pub fn set_color_mode(&mut self, mode: ColorMode) {
        self.color_mode = mode;
    }

    pub fn set_palette(&mut self, palette: Palette) {
        self.palette = palette;
    }

    pub fn set_glyph_style(&mut self, style: GlyphStyle) {
        self.config.glyph.style = style;
    }

    pub fn set_reveal_zoom(&mut self, zoom: f64) {
        self.config.glyph.reveal_zoom = zoom;
    }

    pub fn set_layer_config(&mut self, config: LayerConfig) {
        self.layer_config = config;
        self.refresh_layers();
    }

    /// Decodes and shows a route. Malformed input is logged; nothing is drawn if no coordinate survives.
    pub fn set_route(&mut self, encoded: Option<&str>, waypoints: Vec<Coordinate>) {
        self.route = match encoded {
            None => Vec::new(),
            Some(encoded) => {
                let decoded = polyline::decode_with(encoded, self.config.polyline.precision, self.config.polyline.truncation);
                match decoded {
                    Ok(points) => points.into_iter().map(|(lon, lat)| Coordinate::new(lat, lon)).collect(),
                    Err(e) => {
                        log::warn!("route not drawn: {}", EngineError::from(e));
                        Vec::new()
                    }
                }
            }
        };
        if encoded.is_some() && self.route.is_empty() {
            log::warn!("route decoded to no coordinates");
        }
        self.waypoints = waypoints;
        self.refresh_layers();
    }

    /// Layer operations accumulated since the last call, in order.
    pub fn drain_layer_ops(&mut self) -> Vec<LayerOp> {
        std::mem::take(&mut self.layer_ops)
    }

    fn refresh_layers(&mut self) {
        let target = desired(&self.layer_config, !self.route.is_empty(), !self.waypoints.is_empty());
        let ops = self.applied_layers.reconcile(&target);
        self.layer_ops.extend(ops);
    }

    /// Re-filters the base list and reloads the index.
    fn rebuild(&mut self, now: Instant) {
        let filtered = self.filter.apply(&self.entities, &self.metrics);
        self.index.load_entities(&filtered);
        self.visible = filtered.into_iter().map(|e| (e.id.clone(), e)).collect();
        log::debug!("index rebuilt with {} of {} entities", self.visible.len(), self.entities.len());

        let gone: Vec<EntityId> = self.drags.keys().filter(|id| !self.visible.contains_key(*id)).cloned().collect();
        for id in gone {
            // A pending commit keeps its controller and the lock until the update resolves.
            let committing = self
                .drags
                .get(&id)
                .is_some_and(|d| matches!(d.phase(), DragPhase::Committing { .. }));
            if !committing {
                if let Some(mut drag) = self.drags.remove(&id) {
                    let effects = drag.abort();
                    self.apply_drag_effects(&id, effects, now);
                }
            }
            self.pointers.retain(|_, owner| owner != &id);
            self.popups.forget(&id);
        }
        if let Some(persistent) = self.popups.persistent() {
            if !self.visible.contains_key(persistent) {
                let id = persistent.to_string();
                self.popups.forget(&id);
            }
        }
        self.requery();
    }

    fn requery(&mut self) {
        self.rendered = self.index.query_bounds(&self.viewport.bounds(), self.viewport.zoom());
        log::debug!("{} markers at zoom {:.2}", self.rendered.len(), self.viewport.zoom());
    }

    /// The host resized, or moved the view by other means. Re-queries the index.
    pub fn viewport_changed(&mut self, size: Vec2) {
        self.viewport.set_size(size);
        self.requery();
    }

    /// Pans by a pointer drag of `delta` pixels. Ignored while a marker drag holds the controls.
    pub fn pan_by(&mut self, delta: Vec2) -> bool {
        if !self.lock.pan_enabled() {
            return false;
        }
        self.fly = None;
        self.viewport.pan_by(delta);
        self.requery();
        true
    }

    pub fn scroll_zoom(&mut self, delta: f64, anchor: Pos2) -> bool {
        if !self.lock.scroll_zoom_enabled() {
            return false;
        }
        self.fly = None;
        self.viewport.zoom_around(delta, anchor);
        self.requery();
        true
    }

    pub fn double_click_zoom(&mut self, anchor: Pos2) -> bool {
        if !self.lock.double_click_zoom_enabled() {
            return false;
        }
        self.fly = None;
        self.viewport.zoom_around(1.0, anchor);
        self.requery();
        true
    }

    /// Animates to the zoom at which the cluster splits apart.
    pub fn click_cluster(&mut self, id: ClusterId, now: Instant) -> bool {
        if self.lock.is_locked() {
            return false;
        }
        let Some(zoom) = self.index.expansion_zoom(id) else {
            log::debug!("stale cluster handle {id:?}");
            return false;
        };
        let Some(coordinate) = self.rendered.iter().find_map(|r| match r {
            ClusterOrPoint::Cluster { id: c, coordinate, .. } if *c == id => Some(*coordinate),
            _ => None,
        }) else {
            return false;
        };
        self.fly = Some(FlyTo::new(&self.viewport, coordinate, f64::from(zoom), now, self.config.focus.fly_duration));
        true
    }

    pub fn click_marker(&mut self, entity_id: &str, now: Instant) {
        if self.lock.is_locked() {
            return;
        }
        let Some(entity) = self.visible.get(entity_id) else {
            return;
        };
        self.popups.open_persistent(entity_id, now);
        self.callbacks.on_select(Some(entity));
    }

    pub fn hover_enter(&mut self, entity_id: &str, now: Instant) {
        if self.visible.contains_key(entity_id) {
            self.popups.hover_enter(entity_id, now);
        }
    }

    pub fn hover_leave(&mut self, entity_id: &str, now: Instant) {
        self.popups.hover_leave(entity_id, now);
    }

    pub fn close_popup(&mut self, now: Instant) {
        if self.popups.close_persistent(now).is_some() {
            self.callbacks.on_select(None);
        }
    }

    pub fn base_map_click(&mut self, now: Instant) {
        if self.popups.base_map_click(now).is_some() {
            self.callbacks.on_select(None);
        }
    }

    /// Popup action: closes the popup, then hands over to the photo viewer.
    pub fn open_photos(&mut self, entity_id: &str, now: Instant) {
        let Some(name) = self.visible.get(entity_id).map(|e| e.name.clone()) else {
            return;
        };
        if self.popups.is_open(entity_id, PopupKind::Persistent) {
            self.popups.close_persistent(now);
        }
        self.popups.forget(entity_id);
        self.callbacks.open_photos(entity_id, &name);
    }

    /// Flies to an entity and pulses its marker. The request is always acknowledged.
    ///
    /// While a drag holds the viewport the request waits until the controls are released.
    pub fn focus(&mut self, entity_id: &str, now: Instant) {
        if self.lock.is_locked() {
            log::debug!("focus on {entity_id} deferred until the viewport is released");
            self.deferred_focus = Some(entity_id.to_string());
            return;
        }
        match self.entities.iter().find(|e| e.id == entity_id) {
            Some(entity) => {
                let target = entity.coordinate();
                log::info!("focusing {} ({entity_id})", entity.name);
                self.fly = Some(FlyTo::new(&self.viewport, target, self.config.focus.fly_to_zoom, now, self.config.focus.fly_duration));
                self.pulse = Some((entity_id.to_string(), now + self.config.focus.pulse));
            }
            None => log::warn!("focus requested for unknown entity {entity_id}"),
        }
        self.callbacks.focus_handled(entity_id);
    }

    pub fn pointer_down(&mut self, entity_id: &str, pointer_id: PointerId, pos: Pos2, now: Instant) {
        if self.pointers.contains_key(&pointer_id) || self.lock.is_locked() {
            return;
        }
        if self.drags.values().any(|d| !d.is_idle()) {
            return;
        }
        let Some(entity) = self.visible.get(entity_id) else {
            return;
        };
        let origin = entity.coordinate();
        let drag_config = self.config.drag.clone();
        let name = entity.name.clone();
        let drag = self
            .drags
            .entry(entity_id.to_string())
            .or_insert_with(|| DragGestureController::new(entity_id, name, drag_config));
        let effects = drag.pointer_down(pointer_id, pos, origin, now);
        self.pointers.insert(pointer_id, entity_id.to_string());
        self.apply_drag_effects(entity_id, effects, now);
    }

    pub fn pointer_move(&mut self, pointer_id: PointerId, pos: Pos2, now: Instant) {
        let Some(id) = self.pointers.get(&pointer_id).cloned() else {
            return;
        };
        if let Some(drag) = self.drags.get_mut(&id) {
            let effects = drag.pointer_move(pointer_id, pos, &self.viewport);
            self.apply_drag_effects(&id, effects, now);
        }
        self.forget_pointer_if_done(pointer_id, &id);
    }

    pub fn pointer_up(&mut self, pointer_id: PointerId, pos: Pos2, now: Instant) {
        let Some(id) = self.pointers.get(&pointer_id).cloned() else {
            return;
        };
        if let Some(drag) = self.drags.get_mut(&id) {
            let effects = drag.pointer_up(pointer_id, pos, &self.viewport);
            self.apply_drag_effects(&id, effects, now);
        }
        self.pointers.remove(&pointer_id);
    }

    pub fn pointer_cancel(&mut self, pointer_id: PointerId, now: Instant) {
        let Some(id) = self.pointers.remove(&pointer_id) else {
            return;
        };
        if let Some(drag) = self.drags.get_mut(&id) {
            let effects = drag.pointer_cancel(pointer_id);
            self.apply_drag_effects(&id, effects, now);
        }
    }

    pub fn pointer_leave(&mut self, pointer_id: PointerId, now: Instant) {
        let Some(id) = self.pointers.get(&pointer_id).cloned() else {
            return;
        };
        if let Some(drag) = self.drags.get_mut(&id) {
            let effects = drag.pointer_leave(pointer_id);
            self.apply_drag_effects(&id, effects, now);
        }
        self.forget_pointer_if_done(pointer_id, &id);
    }

    fn forget_pointer_if_done(&mut self, pointer_id: PointerId, id: &str) {
        let tracking = self.drags.get(id).and_then(|d| d.pointer_id()) == Some(pointer_id);
        if !tracking {
            self.pointers.remove(&pointer_id);
        }
    }

    pub fn is_dragging(&self, entity_id: &str) -> bool {
        self.drags.get(entity_id).is_some_and(|d| d.is_dragging())
    }

    /// Puts the last relocated entity back where it was.
    pub fn undo(&mut self, now: Instant) -> bool {
        if self.undo_in_flight {
            return false;
        }
        let Some(record) = self.undo.take(now) else {
            return false;
        };
        log::info!("undoing move of {} ({})", record.name, record.entity_id);
        let future = self
            .callbacks
            .update_location(&record.entity_id, record.origin.latitude(), record.origin.longitude());
        self.undo_in_flight = true;
        self.spawn_update(record.entity_id.clone(), UpdateKind::Undo(record), future);
        true
    }

    pub fn dismiss_undo(&mut self) {
        self.undo.dismiss();
    }

    /// Advances timers and applies finished location updates.
    pub fn tick(&mut self, now: Instant) {
        while let Ok(outcome) = self.receiver.try_recv() {
            self.finish_update(outcome, now);
        }

        let armed: Vec<EntityId> = self
            .drags
            .iter()
            .filter(|(_, d)| d.next_deadline().is_some_and(|t| t <= now))
            .map(|(id, _)| id.clone())
            .collect();
        for id in armed {
            if let Some(drag) = self.drags.get_mut(&id) {
                let effects = drag.poll(now);
                self.apply_drag_effects(&id, effects, now);
            }
        }

        if !self.lock.is_locked() {
            if let Some(id) = self.deferred_focus.take() {
                self.focus(&id, now);
            }
        }
        let landed = !self.lock.is_locked() && self.fly.as_ref().is_some_and(|fly| fly.step(&mut self.viewport, now));
        if landed {
            self.fly = None;
            self.requery();
        }
        if self.pulse.as_ref().is_some_and(|(_, until)| *until <= now) {
            self.pulse = None;
        }
        self.popups.tick(now);
        if let Some(expired) = self.undo.expire(now) {
            log::debug!("undo for {} expired", expired.entity_id);
        }
        self.notices.expire(now);
    }

    fn spawn_update(&self, entity_id: EntityId, kind: UpdateKind, future: BoxFuture<'static, std::result::Result<(), String>>) {
        let sender = self.sender.clone();
        self.runtime.spawn(async move {
            let result = future.await;
            if sender.send(UpdateOutcome { entity_id, kind, result }).is_err() {
                log::debug!("location update finished after the map closed");
            }
        });
    }

    fn finish_update(&mut self, outcome: UpdateOutcome, now: Instant) {
        let UpdateOutcome { entity_id, kind, result } = outcome;
        match kind {
            UpdateKind::Drag => {
                let effects = match self.drags.get_mut(&entity_id) {
                    Some(drag) => drag.resolve(result),
                    None => Vec::new(),
                };
                self.apply_drag_effects(&entity_id, effects, now);
                // The controller may have been aborted while the call was pending.
                self.lock.release(&entity_id);
            }
            UpdateKind::Undo(record) => {
                self.undo_in_flight = false;
                match result {
                    Ok(()) => {
                        self.move_entity(&record.entity_id, record.origin, now);
                        self.notices
                            .push(NoticeKind::Success, format!("{} moved back", record.name), now);
                    }
                    Err(reason) => {
                        let error = EngineError::LocationUpdate {
                            entity_id: record.entity_id.clone(),
                            reason,
                        };
                        log::warn!("{error}");
                        self.notices
                            .push(NoticeKind::Error, format!("Could not move {} back", record.name), now);
                    }
                }
            }
        }
    }

    fn move_entity(&mut self, entity_id: &str, coordinate: Coordinate, now: Instant) {
        if let Some(entity) = self.entities.iter_mut().find(|e| e.id == entity_id) {
            entity.set_coordinate(coordinate);
        }
        self.rebuild(now);
    }

    fn apply_drag_effects(&mut self, entity_id: &str, effects: Vec<DragEffect>, now: Instant) {
        for effect in effects {
            match effect {
                DragEffect::AcquireViewport => {
                    self.fly = None;
                    if !self.lock.acquire(entity_id) {
                        log::warn!("viewport controls already held by {:?}", self.lock.holder());
                    }
                }
                DragEffect::ReleaseViewport => {
                    self.lock.release(entity_id);
                }
                DragEffect::CapturePointer(pointer_id) => {
                    self.pointers.insert(pointer_id, entity_id.to_string());
                }
                DragEffect::ReleasePointer(pointer_id) => {
                    self.pointers.remove(&pointer_id);
                }
                DragEffect::Grabbed { name } => {
                    self.popups.forget(entity_id);
                    self.notices
                        .push(NoticeKind::Info, format!("Drag {name} to its new location"), now);
                }
                DragEffect::Commit { target, .. } => {
                    log::info!(
                        "moving {entity_id} to {:.6}, {:.6}",
                        target.latitude(),
                        target.longitude()
                    );
                    let future = self
                        .callbacks
                        .update_location(entity_id, target.latitude(), target.longitude());
                    self.spawn_update(entity_id.to_string(), UpdateKind::Drag, future);
                }
                DragEffect::Committed { origin, target } => {
                    let name = self
                        .entities
                        .iter()
                        .find(|e| e.id == entity_id)
                        .map(|e| e.name.clone())
                        .unwrap_or_else(|| entity_id.to_string());
                    self.undo.replace(entity_id.to_string(), name.clone(), origin, target, now);
                    self.notices.push(NoticeKind::Success, format!("{name} moved"), now);
                    self.move_entity(entity_id, target, now);
                }
                DragEffect::SnapBack { to } => {
                    log::debug!("{entity_id} snapped back to {:.6}, {:.6}", to.latitude(), to.longitude());
                }
                DragEffect::Failed { reason } => {
                    let error = EngineError::LocationUpdate {
                        entity_id: entity_id.to_string(),
                        reason,
                    };
                    log::warn!("{error}");
                    self.notices.push(NoticeKind::Error, "Could not save the new location", now);
                }
            }
        }
    }

    /// Drawable markers for the current query, in index order.
    pub fn marker_views(&mut self) -> Vec<MarkerView> {
        let mut views = Vec::with_capacity(self.rendered.len());
        let zoom = self.viewport.zoom();
        for item in &self.rendered {
            match item {
                ClusterOrPoint::Cluster { id, coordinate, count } => views.push(MarkerView::Cluster {
                    id: *id,
                    position: self.viewport.project(coordinate),
                    count: *count,
                }),
                ClusterOrPoint::Point { id, coordinate } => {
                    let Some(entity) = self.visible.get(id) else {
                        continue;
                    };
                    let drag = self.drags.get(id);
                    let shown = drag.and_then(|d| d.display_coordinate()).unwrap_or(*coordinate);
                    let color = color_for(entity, self.color_mode, &self.metrics, &self.palette);
                    let badge = self.metrics.primary_affiliation(id).map(|a| a.percentage);
                    let glyph = self.glyphs.get(self.config.glyph.style, color, zoom, badge, &self.config.glyph);
                    views.push(MarkerView::Marker {
                        entity_id: id.clone(),
                        position: self.viewport.project(&shown),
                        glyph,
                        pulsing: self.pulse.as_ref().is_some_and(|(p, _)| p == id),
                        grabbed: drag.is_some_and(|d| d.is_dragging()),
                    });
                }
            }
        }
        views
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::markers::color::Tier;
    use approx::assert_abs_diff_eq;
    use egui::vec2;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        selected: Mutex<Vec<Option<EntityId>>>,
        updates: Mutex<Vec<(EntityId, f64, f64)>>,
        photos: Mutex<Vec<EntityId>>,
        focused: Mutex<Vec<EntityId>>,
        fail: AtomicBool,
    }

    impl MapCallbacks for Recorder {
        fn on_select(&self, entity: Option<&Entity>) {
            self.selected.lock().unwrap().push(entity.map(|e| e.id.clone()));
        }

        fn update_location(&self, entity_id: &str, latitude: f64, longitude: f64) -> BoxFuture<'static, std::result::Result<(), String>> {
            self.updates.lock().unwrap().push((entity_id.to_string(), latitude, longitude));
            let fail = self.fail.load(Ordering::SeqCst);
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                if fail {
                    Err("store offline".to_string())
                } else {
                    Ok(())
                }
            }
            .boxed()
        }

        fn open_photos(&self, entity_id: &str, _name: &str) {
            self.photos.lock().unwrap().push(entity_id.to_string());
        }

        fn focus_handled(&self, entity_id: &str) {
            self.focused.lock().unwrap().push(entity_id.to_string());
        }
    }

    fn setup() -> (MapOrchestrator, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let viewport = Viewport::new(Coordinate::new(42.5, 1.52), 17.0, vec2(800.0, 600.0));
        let mut orchestrator = MapOrchestrator::new(EngineConfig::default(), viewport, recorder.clone(), Handle::current());
        let mut a = Entity::new("a", "Alpha", 42.5, 1.52);
        a.turnover = Some(1_200_000.0);
        let b = Entity::new("b", "Beta", 42.501, 1.521);
        orchestrator.set_entities(vec![a, b], Instant::now());
        (orchestrator, recorder)
    }

    async fn settle(orchestrator: &mut MapOrchestrator) {
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(60)).await;
            orchestrator.tick(Instant::now());
        }
    }

    fn screen_pos(orchestrator: &MapOrchestrator, id: &str) -> Pos2 {
        let entity = orchestrator.entity(id).unwrap();
        orchestrator.viewport().project(&entity.coordinate())
    }

    async fn grab(orchestrator: &mut MapOrchestrator, id: &str, pointer: PointerId) -> Pos2 {
        let start = screen_pos(orchestrator, id);
        orchestrator.pointer_down(id, pointer, start, Instant::now());
        tokio::time::advance(Duration::from_secs(3)).await;
        orchestrator.tick(Instant::now());
        start
    }

    #[tokio::test(start_paused = true)]
    async fn drag_commit_moves_entity_and_offers_undo() {
        let (mut map, recorder) = setup();
        let start = grab(&mut map, "a", 1).await;
        assert!(map.is_dragging("a"));
        assert!(!map.interaction_lock().pan_enabled());
        assert!(!map.pan_by(vec2(10.0, 0.0)));

        map.pointer_move(1, start + vec2(60.0, 0.0), Instant::now());
        map.pointer_up(1, start + vec2(80.0, 40.0), Instant::now());
        let expected = map.viewport().unproject(start + vec2(80.0, 40.0));
        // Locked until the update settles.
        assert!(map.interaction_lock().is_locked());

        settle(&mut map).await;
        let updates = recorder.updates.lock().unwrap().clone();
        assert_eq!(updates.len(), 1);
        assert_abs_diff_eq!(updates[0].1, expected.latitude(), epsilon = 1e-9);
        assert_abs_diff_eq!(updates[0].2, expected.longitude(), epsilon = 1e-9);

        let lock = map.interaction_lock();
        assert!(lock.pan_enabled());
        assert_eq!(lock.acquire_count(), lock.release_count());
        assert_abs_diff_eq!(map.entity("a").unwrap().latitude, expected.latitude(), epsilon = 1e-9);
        let record = map.undo_record(Instant::now()).unwrap();
        assert_eq!(record.origin, Coordinate::new(42.5, 1.52));
    }

    #[tokio::test(start_paused = true)]
    async fn short_press_never_updates() {
        let (mut map, recorder) = setup();
        let start = screen_pos(&map, "a");
        map.pointer_down("a", 1, start, Instant::now());
        tokio::time::advance(Duration::from_millis(2500)).await;
        map.tick(Instant::now());
        map.pointer_up(1, start + vec2(50.0, 0.0), Instant::now());
        settle(&mut map).await;
        tokio::time::advance(Duration::from_secs(5)).await;
        map.tick(Instant::now());
        assert!(!map.is_dragging("a"));
        assert!(recorder.updates.lock().unwrap().is_empty());
        assert_eq!(map.interaction_lock().acquire_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_update_snaps_back_and_reenables() {
        let (mut map, recorder) = setup();
        recorder.fail.store(true, Ordering::SeqCst);
        let start = grab(&mut map, "a", 1).await;
        map.pointer_up(1, start + vec2(40.0, 40.0), Instant::now());
        settle(&mut map).await;

        assert_eq!(map.entity("a").unwrap().coordinate(), Coordinate::new(42.5, 1.52));
        let lock = map.interaction_lock();
        assert!(lock.pan_enabled() && lock.scroll_zoom_enabled() && lock.double_click_zoom_enabled());
        assert_eq!(lock.acquire_count(), 1);
        assert_eq!(lock.release_count(), 1);
        assert!(map.undo_record(Instant::now()).is_none());
        assert!(map.notices().iter().any(|n| n.kind == NoticeKind::Error));
    }

    #[tokio::test(start_paused = true)]
    async fn undo_restores_origin_and_record_expires() {
        let (mut map, recorder) = setup();
        let start = grab(&mut map, "a", 1).await;
        map.pointer_up(1, start + vec2(30.0, 0.0), Instant::now());
        settle(&mut map).await;
        assert!(map.undo(Instant::now()));
        settle(&mut map).await;
        assert_eq!(recorder.updates.lock().unwrap().len(), 2);
        assert_eq!(map.entity("a").unwrap().coordinate(), Coordinate::new(42.5, 1.52));

        // A second move, left alone, expires after the window.
        let start = grab(&mut map, "a", 2).await;
        map.pointer_up(2, start + vec2(30.0, 0.0), Instant::now());
        settle(&mut map).await;
        assert!(map.undo_record(Instant::now()).is_some());
        tokio::time::advance(Duration::from_millis(15_001)).await;
        map.tick(Instant::now());
        assert!(map.undo_record(Instant::now()).is_none());
        assert!(!map.undo(Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn popups_select_and_photos() {
        let (mut map, recorder) = setup();
        let now = Instant::now();
        map.click_marker("a", now);
        map.click_marker("b", now);
        map.tick(now + Duration::from_millis(250));
        let persistent: Vec<_> = map
            .visible_popups()
            .into_iter()
            .filter(|p| p.kind == PopupKind::Persistent)
            .collect();
        assert_eq!(persistent.len(), 1);
        assert_eq!(persistent[0].entity_id, "b");

        map.open_photos("b", now);
        assert_eq!(recorder.photos.lock().unwrap().as_slice(), ["b".to_string()]);
        map.tick(now + Duration::from_millis(500));
        assert!(map.visible_popups().is_empty());

        map.click_marker("a", now);
        map.base_map_click(now);
        let selected = recorder.selected.lock().unwrap().clone();
        assert_eq!(selected, vec![Some("a".into()), Some("b".into()), Some("a".into()), None]);
        assert_eq!(map.popup_content("a").unwrap().title, "Alpha");
    }

    #[tokio::test(start_paused = true)]
    async fn focus_flies_pulses_and_acknowledges() {
        let (mut map, recorder) = setup();
        let now = Instant::now();
        map.focus("b", now);
        map.focus("nope", now);
        assert_eq!(recorder.focused.lock().unwrap().as_slice(), ["b".to_string(), "nope".to_string()]);
        assert_eq!(map.pulsing(), Some("b"));

        map.tick(now + Duration::from_secs(2));
        assert!(!map.is_flying());
        assert_abs_diff_eq!(map.viewport().zoom(), 15.0, epsilon = 1e-9);
        assert_abs_diff_eq!(map.viewport().center().latitude(), 42.501, epsilon = 1e-6);

        map.tick(now + Duration::from_secs(5));
        assert_eq!(map.pulsing(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn clusters_and_colors() {
        let (mut map, _) = setup();
        let now = Instant::now();
        map.set_color_mode(ColorMode::Turnover);
        let views = map.marker_views();
        assert_eq!(views.len(), 2);

        // Zoomed out, the two nearby companies share a cluster.
        map.scroll_zoom(-10.0, Pos2::new(400.0, 300.0));
        let cluster = map.rendered().iter().find_map(|r| match r {
            ClusterOrPoint::Cluster { id, count: 2, .. } => Some(*id),
            _ => None,
        });
        let cluster = cluster.unwrap();
        assert!(map.click_cluster(cluster, now));
        map.tick(now + Duration::from_secs(2));
        assert!(map.rendered().iter().all(|r| r.count() == 1));

        let strongest = Palette::default().tier(Tier::Strongest);
        let color_of = |views: &[MarkerView], id: &str| {
            views.iter().find_map(|v| match v {
                MarkerView::Marker { entity_id, glyph, .. } if entity_id == id => Some(glyph.shapes.clone()),
                _ => None,
            })
        };
        let views = map.marker_views();
        let expected = crate::markers::glyph::render(GlyphStyle::Teardrop, strongest, map.viewport().zoom(), None, &map.config().glyph);
        assert_eq!(color_of(&views, "a"), Some(expected.shapes));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_fetches_fall_back() {
        let (mut map, _) = setup();
        map.apply_remote_settings(Ok(RemoteSettings {
            tooltip_fields: None,
            reveal_zoom: Some(10.0),
        }));
        assert_eq!(map.config().glyph.reveal_zoom, 10.0);
        map.apply_remote_settings(Err(EngineError::ConfigFetch("timeout".into())));
        assert_eq!(map.config().glyph.reveal_zoom, 10.0);

        map.set_metrics(Err(EngineError::MetricsFetch("timeout".into())), Instant::now());
        assert!(!map.metrics().is_available());
        assert_eq!(map.visible_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn visits_mode_is_gray_without_metrics() {
        let (mut map, _) = setup();
        map.set_color_mode(ColorMode::Visits);
        map.set_metrics(Err(EngineError::MetricsFetch("timeout".into())), Instant::now());

        let gray = Palette::default().fallback;
        let expected = crate::markers::glyph::render(GlyphStyle::Teardrop, gray, map.viewport().zoom(), None, &map.config().glyph);
        let views = map.marker_views();
        assert_eq!(views.len(), 2);
        for view in views {
            match view {
                MarkerView::Marker { glyph, .. } => assert_eq!(glyph.shapes, expected.shapes),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn viewport_holds_still_during_a_drag() {
        let (mut map, recorder) = setup();
        let start = grab(&mut map, "a", 1).await;
        let center = map.viewport().center();
        let zoom = map.viewport().zoom();

        map.focus("b", Instant::now());
        assert!(recorder.focused.lock().unwrap().is_empty());
        assert!(!map.is_flying());
        tokio::time::advance(Duration::from_secs(2)).await;
        map.tick(Instant::now());
        assert_eq!(map.viewport().center(), center);
        assert_eq!(map.viewport().zoom(), zoom);

        map.pointer_up(1, start + vec2(40.0, 0.0), Instant::now());
        let expected = map.viewport().unproject(start + vec2(40.0, 0.0));
        settle(&mut map).await;
        let stored = recorder.updates.lock().unwrap()[0].clone();
        assert_abs_diff_eq!(stored.2, expected.longitude(), epsilon = 1e-9);

        // The deferred focus runs once the controls come back.
        assert_eq!(recorder.focused.lock().unwrap().as_slice(), ["b".to_string()]);
        assert_eq!(map.pulsing(), Some("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn cluster_clicks_are_ignored_while_locked() {
        let (mut map, _) = setup();
        map.scroll_zoom(-10.0, Pos2::new(400.0, 300.0));
        let cluster = map.rendered().iter().find_map(|r| match r {
            ClusterOrPoint::Cluster { id, .. } => Some(*id),
            _ => None,
        });
        let cluster = cluster.unwrap();
        map.lock.acquire("a");
        assert!(!map.click_cluster(cluster, Instant::now()));
        assert!(!map.is_flying());
        map.lock.release("a");
        assert!(map.click_cluster(cluster, Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn filtering_during_a_pending_commit_still_applies_it() {
        let (mut map, recorder) = setup();
        let start = grab(&mut map, "a", 1).await;
        map.pointer_up(1, start + vec2(50.0, 0.0), Instant::now());
        let expected = map.viewport().unproject(start + vec2(50.0, 0.0));

        let beta_only = FilterSet {
            search: "beta".into(),
            ..FilterSet::default()
        };
        map.set_filter(beta_only, Instant::now());
        assert_eq!(map.visible_count(), 1);
        assert!(map.interaction_lock().is_locked());

        settle(&mut map).await;
        assert_eq!(recorder.updates.lock().unwrap().len(), 1);
        let lock = map.interaction_lock();
        assert!(!lock.is_locked());
        assert_eq!(lock.acquire_count(), lock.release_count());
        let record = map.undo_record(Instant::now()).unwrap();
        assert_eq!(record.name, "Alpha");

        map.set_filter(FilterSet::default(), Instant::now());
        let a = map.entity("a").unwrap();
        assert_abs_diff_eq!(a.longitude, expected.longitude(), epsilon = 1e-9);
        assert_abs_diff_eq!(a.latitude, expected.latitude(), epsilon = 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn route_layers_follow_route() {
        let (mut map, _) = setup();
        let initial = map.drain_layer_ops();
        assert!(initial.contains(&LayerOp::SetStyle(Default::default())));

        map.set_route(Some("_p~iF~ps|U_ulLnnqC_mqNvxq`@"), vec![Coordinate::new(38.5, -120.2)]);
        assert_eq!(map.route().len(), 3);
        assert_abs_diff_eq!(map.route()[0].latitude(), 38.5, epsilon = 1e-9);
        let ops = map.drain_layer_ops();
        assert_eq!(ops.iter().filter(|op| matches!(op, LayerOp::AddLayer(..))).count(), 2);

        map.set_route(Some(""), Vec::new());
        assert!(map.route().is_empty());
        assert_eq!(map.drain_layer_ops().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn filtering_out_a_dragged_entity_releases_controls() {
        let (mut map, _) = setup();
        grab(&mut map, "a", 1).await;
        assert!(map.interaction_lock().is_locked());
        let filter = FilterSet {
            search: "beta".into(),
            ..FilterSet::default()
        };
        map.set_filter(filter, Instant::now());
        assert_eq!(map.visible_count(), 1);
        assert!(!map.interaction_lock().is_locked());
        assert_eq!(map.interaction_lock().acquire_count(), map.interaction_lock().release_count());
    }
}
