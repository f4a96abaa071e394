use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};

use bizmap::map::geo::Coordinate;
use bizmap::{EngineError, Entity, EntityId, MapCallbacks, Metrics};

/// What the viewer loads from `BIZMAP_ENTITIES`.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Dataset {
    pub entities: Vec<Entity>,
    pub metrics: Metrics,
    pub route: Option<String>,
    pub waypoints: Vec<Coordinate>,
}

impl Dataset {
    pub fn load(path: impl AsRef<Path>) -> bizmap::Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| EngineError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(serde_json::from_str(&json)?)
    }
}

/// Stands in for the data store: positions live in memory for the session.
#[derive(Default)]
pub struct InMemoryStore {
    positions: Arc<Mutex<HashMap<EntityId, (f64, f64)>>>,
    selected: Mutex<Option<EntityId>>,
    photo_requests: Mutex<Vec<String>>,
}

impl InMemoryStore {
    pub fn new(entities: &[Entity]) -> Self {
        let positions = entities.iter().map(|e| (e.id.clone(), (e.latitude, e.longitude))).collect();
        Self {
            positions: Arc::new(Mutex::new(positions)),
            ..Default::default()
        }
    }

    pub fn selected(&self) -> Option<EntityId> {
        self.selected.lock().ok().and_then(|s| s.clone())
    }

    pub fn take_photo_requests(&self) -> Vec<String> {
        self.photo_requests
            .lock()
            .map(|mut r| std::mem::take(&mut *r))
            .unwrap_or_default()
    }
}

impl MapCallbacks for InMemoryStore {
    fn on_select(&self, entity: Option<&Entity>) {
        if let Ok(mut selected) = self.selected.lock() {
            *selected = entity.map(|e| e.id.clone());
        }
    }

    fn update_location(&self, entity_id: &str, latitude: f64, longitude: f64) -> BoxFuture<'static, Result<(), String>> {
        let positions = self.positions.clone();
        let entity_id = entity_id.to_string();
        async move {
            // Simulated round trip to the store.
            tokio::time::sleep(Duration::from_millis(300)).await;
            let mut positions = positions.lock().map_err(|e| e.to_string())?;
            match positions.get_mut(&entity_id) {
                Some(position) => {
                    *position = (latitude, longitude);
                    log::info!("stored {entity_id} at {latitude:.6}, {longitude:.6}");
                    Ok(())
                }
                None => Err(format!("unknown company {entity_id}")),
            }
        }
        .boxed()
    }

    fn open_photos(&self, entity_id: &str, name: &str) {
        log::info!("photo viewer requested for {name} ({entity_id})");
        if let Ok(mut requests) = self.photo_requests.lock() {
            requests.push(name.to_string());
        }
    }

    fn focus_handled(&self, entity_id: &str) {
        log::debug!("focus on {entity_id} handled");
    }
}
