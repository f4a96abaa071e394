//! Mappable companies and the filters applied to them.

use std::collections::{BTreeSet, HashMap};

use chrono::NaiveDate;
use egui::Color32;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::map::geo::Coordinate;
use crate::markers::color::hex_color;

pub type EntityId = String;

/// A company placed on the map. Owned by the data store; the engine only
/// ever proposes changes to its position.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Entity {
    pub id: EntityId,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub sector: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub turnover: Option<f64>,
    #[serde(default)]
    pub employees: Option<u32>,
    #[serde(default)]
    pub bank_pnl: Option<f64>,
    #[serde(default)]
    pub profit: Option<f64>,
    #[serde(default)]
    pub last_visit: Option<NaiveDate>,
}

impl Entity {
    pub fn new(id: impl Into<EntityId>, name: impl Into<String>, latitude: f64, longitude: f64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            latitude,
            longitude,
            status: None,
            sector: None,
            city: None,
            turnover: None,
            employees: None,
            bank_pnl: None,
            profit: None,
            last_visit: None,
        }
    }

    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.latitude, self.longitude)
    }

    pub fn set_coordinate(&mut self, coordinate: Coordinate) {
        self.latitude = coordinate.latitude();
        self.longitude = coordinate.longitude();
    }

    pub fn has_valid_position(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// A company's relationship with a bank.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Affiliation {
    pub bank_id: String,
    pub bank_name: String,
    #[serde(default, with = "hex_color::option")]
    pub bank_color: Option<Color32>,
    pub percentage: f64,
    #[serde(default)]
    pub is_primary: bool,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

/// Aggregates fetched alongside the entity list, keyed by entity id.
#[derive(Debug, Default, Clone, PartialEq, Deserialize, Serialize)]
pub struct Metrics {
    #[serde(default)]
    pub affiliations: HashMap<EntityId, Vec<Affiliation>>,
    #[serde(default)]
    pub visit_counts: HashMap<EntityId, u32>,
    /// Set when the aggregates could not be fetched; metric-driven colors go gray.
    #[serde(skip)]
    unavailable: bool,
}

impl Metrics {
    /// Stand-in for a failed fetch.
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    pub fn is_available(&self) -> bool {
        !self.unavailable
    }

    pub fn affiliations_of(&self, id: &str) -> &[Affiliation] {
        self.affiliations.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The primary active affiliation, or the first active one.
    pub fn primary_affiliation(&self, id: &str) -> Option<&Affiliation> {
        let active = || self.affiliations_of(id).iter().filter(|a| a.active);
        active().find(|a| a.is_primary).or_else(|| active().next())
    }

    pub fn visit_count(&self, id: &str) -> u32 {
        self.visit_counts.get(id).copied().unwrap_or(0)
    }
}

/// Inclusive numeric range; either end may be open.
#[derive(Debug, Default, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct RangeFilter {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl RangeFilter {
    pub fn new(min: Option<f64>, max: Option<f64>) -> Self {
        Self { min, max }
    }

    /// A missing value never satisfies an active range.
    pub fn matches(&self, value: Option<f64>) -> bool {
        let Some(value) = value else {
            return self.min.is_none() && self.max.is_none();
        };
        self.min.map_or(true, |min| value >= min) && self.max.map_or(true, |max| value <= max)
    }
}

/// Snapshot of the active filter predicates for one render cycle.
#[derive(Debug, Default, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct FilterSet {
    pub statuses: BTreeSet<String>,
    pub sectors: BTreeSet<String>,
    pub turnover: Option<RangeFilter>,
    pub employees: Option<RangeFilter>,
    pub search: String,
    pub bank_id: Option<String>,
}

impl FilterSet {
    pub fn is_empty(&self) -> bool {
        self == &FilterSet::default()
    }

    pub fn matches(&self, entity: &Entity, metrics: &Metrics) -> bool {
        if !self.statuses.is_empty() && !entity.status.as_ref().is_some_and(|s| self.statuses.contains(s)) {
            return false;
        }
        if !self.sectors.is_empty() && !entity.sector.as_ref().is_some_and(|s| self.sectors.contains(s)) {
            return false;
        }
        if let Some(range) = &self.turnover {
            if !range.matches(entity.turnover) {
                return false;
            }
        }
        if let Some(range) = &self.employees {
            if !range.matches(entity.employees.map(f64::from)) {
                return false;
            }
        }
        if let Some(bank_id) = &self.bank_id {
            let affiliated = metrics
                .affiliations_of(&entity.id)
                .iter()
                .any(|a| a.active && &a.bank_id == bank_id);
            if !affiliated {
                return false;
            }
        }
        let needle = self.search.trim().to_lowercase();
        if !needle.is_empty() {
            let haystacks = [Some(&entity.name), entity.city.as_ref(), entity.sector.as_ref()];
            if !haystacks.into_iter().flatten().any(|h| h.to_lowercase().contains(&needle)) {
                return false;
            }
        }
        true
    }

    /// The visible subset, in input order. Entities without a usable position are dropped.
    pub fn apply(&self, entities: &[Entity], metrics: &Metrics) -> Vec<Entity> {
        entities
            .par_iter()
            .filter(|e| e.has_valid_position() && self.matches(e, metrics))
            .cloned()
            .collect()
    }
}
