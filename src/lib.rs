//! Interactive marker engine for a map of companies.
//!
//! Clusters entities by zoom, colors and draws their pins, runs the
//! long-press drag that relocates an entity (with undo), manages popups and
//! overlays a decoded route. [`MapOrchestrator`] ties it together; the host
//! feeds it events and draws what it reports.

pub mod config;
pub mod entity;
pub mod error;
pub mod map;
pub mod maps_api;
pub mod markers;
pub mod orchestrator;

pub use config::EngineConfig;
pub use entity::{Entity, EntityId, FilterSet, Metrics};
pub use error::{EngineError, Result};
pub use map::geo::Coordinate;
pub use orchestrator::{MapCallbacks, MapOrchestrator, MarkerView};
