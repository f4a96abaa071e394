use std::sync::{Arc, Mutex};
use std::time::Duration;

use approx::assert_abs_diff_eq;
use egui::vec2;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::time::Instant;

use bizmap::config::{ClusterConfig, PopupConfig};
use bizmap::map::cluster::{ClusterIndex, ClusterOrPoint};
use bizmap::map::geo::GeoBounds;
use bizmap::map::layers::{LayerId, LayerOp};
use bizmap::map::polyline;
use bizmap::map::viewport::Viewport;
use bizmap::markers::color::{color_for, ColorMode, Palette, Tier};
use bizmap::markers::popup::{PopupKind, PopupStateManager};
use bizmap::{Coordinate, EngineConfig, Entity, MapCallbacks, MapOrchestrator, Metrics};

#[derive(Default)]
struct Store {
    updates: Mutex<Vec<(String, f64, f64)>>,
}

impl MapCallbacks for Store {
    fn on_select(&self, _entity: Option<&Entity>) {}

    fn update_location(&self, entity_id: &str, latitude: f64, longitude: f64) -> BoxFuture<'static, Result<(), String>> {
        self.updates.lock().unwrap().push((entity_id.to_string(), latitude, longitude));
        async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(())
        }
        .boxed()
    }

    fn open_photos(&self, _entity_id: &str, _name: &str) {}

    fn focus_handled(&self, _entity_id: &str) {}
}

#[test]
fn turnover_color_falls_back_to_gray() {
    let palette = Palette::default();
    let metrics = Metrics::default();
    let mut entity = Entity::new("a", "Alpha", 42.5, 1.52);
    entity.turnover = Some(1_200_000.0);
    assert_eq!(color_for(&entity, ColorMode::Turnover, &metrics, &palette), palette.tier(Tier::Strongest));

    entity.turnover = None;
    assert_eq!(color_for(&entity, ColorMode::Turnover, &metrics, &palette), palette.fallback);
}

#[test]
fn google_sample_route_decodes() {
    let points = polyline::decode("_p~iF~ps|U_ulLnnqC_mqNvxq`@");
    let expected = [(-120.2, 38.5), (-120.95, 40.7), (-126.453, 43.252)];
    assert_eq!(points.len(), expected.len());
    for (got, want) in points.iter().zip(expected) {
        assert_abs_diff_eq!(got.0, want.0, epsilon = 1e-5);
        assert_abs_diff_eq!(got.1, want.1, epsilon = 1e-5);
    }
    assert!(polyline::decode("").is_empty());
}

#[test]
fn stacked_entities_cluster_and_loners_do_not() {
    let mut index = ClusterIndex::new(ClusterConfig::default());
    index.load([
        ("a".to_string(), Coordinate::new(42.5, 1.52)),
        ("b".to_string(), Coordinate::new(42.5, 1.52)),
        ("c".to_string(), Coordinate::new(-33.9, 151.2)),
    ]);
    let world = GeoBounds::new(-85.0, -180.0, 85.0, 180.0);
    let results = index.query_bounds(&world, 3.0);
    assert_eq!(results, index.query_bounds(&world, 3.0));

    let clusters: Vec<_> = results.iter().filter(|r| matches!(r, ClusterOrPoint::Cluster { .. })).collect();
    assert_eq!(clusters.len(), 1);
    assert_eq!(clusters[0].count(), 2);
    assert!(results
        .iter()
        .any(|r| matches!(r, ClusterOrPoint::Point { id, .. } if id == "c")));
}

#[test]
fn only_one_persistent_popup_survives_the_fade() {
    let mut popups = PopupStateManager::new(PopupConfig::default());
    let now = Instant::now();
    popups.open_persistent("a", now);
    popups.open_persistent("b", now);
    popups.tick(now + Duration::from_millis(250));

    let open: Vec<_> = popups.visible().into_iter().filter(|p| p.kind == PopupKind::Persistent).collect();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].entity_id, "b");
    assert!(!popups.hover_enter("a", now));
}

#[tokio::test(start_paused = true)]
async fn configured_long_press_drag_then_undo() {
    let config = EngineConfig::from_json_str(r#"{ "drag": { "long_press": 1000, "undo_window": 5000 } }"#).unwrap();
    let store = Arc::new(Store::default());
    let viewport = Viewport::new(Coordinate::new(42.5, 1.52), 17.0, vec2(800.0, 600.0));
    let mut map = MapOrchestrator::new(config, viewport, store.clone(), Handle::current());
    map.set_entities(vec![Entity::new("a", "Alpha", 42.5, 1.52)], Instant::now());

    let start = map.viewport().project(&Coordinate::new(42.5, 1.52));
    map.pointer_down("a", 7, start, Instant::now());
    tokio::time::advance(Duration::from_millis(1000)).await;
    map.tick(Instant::now());
    assert!(map.is_dragging("a"));

    let release = start + vec2(0.0, 50.0);
    map.pointer_up(7, release, Instant::now());
    let target = map.viewport().unproject(release);
    for _ in 0..4 {
        tokio::time::sleep(Duration::from_millis(60)).await;
        map.tick(Instant::now());
    }
    assert_abs_diff_eq!(map.entity("a").unwrap().latitude, target.latitude(), epsilon = 1e-9);

    assert!(map.undo(Instant::now()));
    for _ in 0..4 {
        tokio::time::sleep(Duration::from_millis(60)).await;
        map.tick(Instant::now());
    }
    assert_eq!(map.entity("a").unwrap().coordinate(), Coordinate::new(42.5, 1.52));

    let updates = store.updates.lock().unwrap().clone();
    assert_eq!(updates.len(), 2);
    assert_eq!(updates[1], ("a".to_string(), 42.5, 1.52));
    let lock = map.interaction_lock();
    assert_eq!(lock.acquire_count(), lock.release_count());
    assert!(lock.pan_enabled());
}

#[tokio::test]
async fn route_layers_follow_the_polyline() {
    let viewport = Viewport::new(Coordinate::new(40.0, -122.0), 5.0, vec2(800.0, 600.0));
    let mut map = MapOrchestrator::new(EngineConfig::default(), viewport, Arc::new(Store::default()), Handle::current());
    map.drain_layer_ops();

    map.set_route(Some("_p~iF~ps|U_ulLnnqC_mqNvxq`@"), Vec::new());
    assert_eq!(map.route().len(), 3);
    let ops = map.drain_layer_ops();
    assert!(ops.iter().any(|op| matches!(op, LayerOp::AddLayer(LayerId::Route, _))));
    assert!(!ops.iter().any(|op| matches!(op, LayerOp::AddLayer(LayerId::Waypoints, _))));

    map.set_route(None, Vec::new());
    assert!(map.route().is_empty());
    assert_eq!(map.drain_layer_ops(), vec![LayerOp::RemoveLayer(LayerId::Route)]);
}
