//! Hover and click popups for markers.

use std::collections::BTreeMap;

use egui::Color32;
use tokio::time::Instant;

use crate::config::{PopupConfig, TooltipFields};
use crate::entity::{Entity, EntityId, Metrics};

pub const PLACEHOLDER: &str = "N/A";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopupKind {
    Hover,
    Persistent,
}

/// A popup the host should draw this frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisiblePopup {
    pub entity_id: EntityId,
    pub kind: PopupKind,
    /// Set while the close animation runs.
    pub closing: bool,
}

#[derive(Debug, Clone)]
struct Closing {
    entity_id: EntityId,
    kind: PopupKind,
    remove_at: Instant,
}

/// Owns which popups are open.
///
/// There is a single optional persistent popup. Hover popups are keyed by
/// entity and carry an optional pending close time, which a re-entry clears.
/// Every close goes through the `closing` list so the host can fade it out.
#[derive(Debug)]
pub struct PopupStateManager {
    config: PopupConfig,
    persistent: Option<EntityId>,
    hovers: BTreeMap<EntityId, Option<Instant>>,
    closing: Vec<Closing>,
}

impl PopupStateManager {
    pub fn new(config: PopupConfig) -> Self {
        Self {
            config,
            persistent: None,
            hovers: BTreeMap::new(),
            closing: Vec::new(),
        }
    }

    pub fn persistent(&self) -> Option<&str> {
        self.persistent.as_deref()
    }

    /// Returns false when the hover popup is suppressed by a persistent one.
    pub fn hover_enter(&mut self, entity_id: &str, _now: Instant) -> bool {
        if self.persistent.is_some() {
            return false;
        }
        self.closing
            .retain(|c| !(c.kind == PopupKind::Hover && c.entity_id == entity_id));
        self.hovers.insert(entity_id.to_string(), None);
        true
    }

    pub fn hover_leave(&mut self, entity_id: &str, now: Instant) {
        if let Some(close_at) = self.hovers.get_mut(entity_id) {
            *close_at = Some(now + self.config.hover_close_delay);
        }
    }

    /// Opens `entity_id`'s persistent popup. Any other persistent popup and all hover popups fade out.
    pub fn open_persistent(&mut self, entity_id: &str, now: Instant) {
        if self.persistent.as_deref() == Some(entity_id) {
            return;
        }
        if let Some(previous) = self.persistent.take() {
            self.start_closing(previous, PopupKind::Persistent, now);
        }
        for id in std::mem::take(&mut self.hovers).into_keys() {
            self.start_closing(id, PopupKind::Hover, now);
        }
        self.closing
            .retain(|c| !(c.kind == PopupKind::Persistent && c.entity_id == entity_id));
        self.persistent = Some(entity_id.to_string());
    }

    /// Closes the persistent popup, returning whose it was.
    pub fn close_persistent(&mut self, now: Instant) -> Option<EntityId> {
        let id = self.persistent.take()?;
        self.start_closing(id.clone(), PopupKind::Persistent, now);
        Some(id)
    }

    pub fn base_map_click(&mut self, now: Instant) -> Option<EntityId> {
        self.close_persistent(now)
    }

    /// Drops every popup of an entity that is no longer on the map.
    pub fn forget(&mut self, entity_id: &str) {
        if self.persistent.as_deref() == Some(entity_id) {
            self.persistent = None;
        }
        self.hovers.remove(entity_id);
        self.closing.retain(|c| c.entity_id != entity_id);
    }

    /// Advances the hover debounce and close animations.
    pub fn tick(&mut self, now: Instant) {
        let expired: Vec<EntityId> = self
            .hovers
            .iter()
            .filter(|(_, close_at)| close_at.is_some_and(|t| t <= now))
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            self.hovers.remove(&id);
            self.start_closing(id, PopupKind::Hover, now);
        }
        self.closing.retain(|c| c.remove_at > now);
    }

    /// The earliest pending timer, so the host knows when to repaint.
    pub fn next_deadline(&self) -> Option<Instant> {
        let hovers = self.hovers.values().flatten().copied();
        let closing = self.closing.iter().map(|c| c.remove_at);
        hovers.chain(closing).min()
    }

    pub fn visible(&self) -> Vec<VisiblePopup> {
        let mut popups: Vec<VisiblePopup> = self
            .closing
            .iter()
            .map(|c| VisiblePopup {
                entity_id: c.entity_id.clone(),
                kind: c.kind,
                closing: true,
            })
            .collect();
        popups.extend(self.hovers.keys().map(|id| VisiblePopup {
            entity_id: id.clone(),
            kind: PopupKind::Hover,
            closing: false,
        }));
        popups.extend(self.persistent.iter().map(|id| VisiblePopup {
            entity_id: id.clone(),
            kind: PopupKind::Persistent,
            closing: false,
        }));
        popups
    }

    pub fn is_open(&self, entity_id: &str, kind: PopupKind) -> bool {
        match kind {
            PopupKind::Persistent => self.persistent.as_deref() == Some(entity_id),
            PopupKind::Hover => self.hovers.contains_key(entity_id),
        }
    }

    fn start_closing(&mut self, entity_id: EntityId, kind: PopupKind, now: Instant) {
        self.closing.push(Closing {
            entity_id,
            kind,
            remove_at: now + self.config.close_fade,
        });
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AffiliationRow {
    pub bank_name: String,
    pub percentage: f64,
    pub color: Option<Color32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AffiliationBreakdown {
    pub rows: Vec<AffiliationRow>,
    pub total: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopupAction {
    OpenPhotos,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PopupContent {
    pub title: String,
    pub affiliations: Option<AffiliationBreakdown>,
    /// `(label, formatted value)` in configured order.
    pub fields: Vec<(String, String)>,
    pub actions: Vec<PopupAction>,
}

pub fn build_content(entity: &Entity, metrics: &Metrics, fields: &TooltipFields) -> PopupContent {
    PopupContent {
        title: entity.name.clone(),
        affiliations: affiliation_breakdown(&entity.id, metrics),
        fields: fields.0.iter().map(|name| format_field(entity, metrics, name)).collect(),
        actions: vec![PopupAction::OpenPhotos],
    }
}

/// Active affiliations summed per bank, largest share first.
pub fn affiliation_breakdown(entity_id: &str, metrics: &Metrics) -> Option<AffiliationBreakdown> {
    let mut by_bank: BTreeMap<&str, AffiliationRow> = BTreeMap::new();
    for a in metrics.affiliations_of(entity_id).iter().filter(|a| a.active) {
        by_bank
            .entry(a.bank_id.as_str())
            .and_modify(|row| row.percentage += a.percentage)
            .or_insert_with(|| AffiliationRow {
                bank_name: a.bank_name.clone(),
                percentage: a.percentage,
                color: a.bank_color,
            });
    }
    if by_bank.is_empty() {
        return None;
    }
    let mut rows: Vec<AffiliationRow> = by_bank.into_values().collect();
    rows.sort_by(|a, b| b.percentage.total_cmp(&a.percentage));
    let total = rows.iter().map(|r| r.percentage).sum();
    Some(AffiliationBreakdown { rows, total })
}

/// Label and display value for a named field. Unknown names and missing values read `N/A`.
pub fn format_field(entity: &Entity, metrics: &Metrics, name: &str) -> (String, String) {
    let (label, value) = match name {
        "status" => ("Status", entity.status.clone()),
        "sector" => ("Sector", entity.sector.clone()),
        "city" => ("City", entity.city.clone()),
        "turnover" => ("Turnover", entity.turnover.map(format_money)),
        "employees" => ("Employees", entity.employees.map(|n| n.to_string())),
        "bank_pnl" => ("Bank P&L", entity.bank_pnl.map(format_money)),
        "profit" => ("Profit", entity.profit.map(format_money)),
        "last_visit" => ("Last visit", entity.last_visit.map(|d| d.format("%d/%m/%Y").to_string())),
        "visits" => (
            "Visits",
            metrics.is_available().then(|| metrics.visit_count(&entity.id).to_string()),
        ),
        _ => return (name.to_string(), PLACEHOLDER.to_string()),
    };
    let value = value.filter(|v| !v.is_empty()).unwrap_or_else(|| PLACEHOLDER.to_string());
    (label.to_string(), value)
}

pub fn format_money(amount: f64) -> String {
    let sign = if amount < 0.0 { "-" } else { "" };
    let abs = amount.abs();
    if abs >= 1_000_000.0 {
        format!("{sign}{:.1}M €", abs / 1_000_000.0)
    } else if abs >= 1_000.0 {
        format!("{sign}{:.0}k €", abs / 1_000.0)
    } else {
        format!("{sign}{:.0} €", abs)
    }
}
