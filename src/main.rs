#![warn(clippy::all, rust_2018_idioms)]
#![cfg_attr(not(debug_assertions), windows_subsystem = "windows")]

mod ui;

use bizmap::maps_api::tile_retriever::TileRetriever;
use bizmap::EngineConfig;
use ui::store::Dataset;

#[cfg(not(target_arch = "wasm32"))]
fn main() -> eframe::Result<()> {
    env_logger::init();

    let native_options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_inner_size(egui::vec2(1600.0, 1000.0))
            .with_min_inner_size(egui::vec2(400.0, 300.0))
            .with_title("BizMap")
            .with_resizable(true)
            .with_decorations(true),
        ..Default::default()
    };

    let config = match dotenv::var("BIZMAP_CONFIG") {
        Ok(path) => EngineConfig::load(&path).unwrap_or_else(|e| {
            log::warn!("ignoring config {path}: {e}");
            EngineConfig::default()
        }),
        Err(_) => EngineConfig::default(),
    };

    let dataset = match dotenv::var("BIZMAP_ENTITIES") {
        Ok(path) => Dataset::load(&path).unwrap_or_else(|e| {
            log::error!("could not load companies from {path}: {e}");
            Dataset::default()
        }),
        Err(_) => {
            log::warn!("BIZMAP_ENTITIES is not set, starting with an empty map");
            Dataset::default()
        }
    };
    log::info!("{} companies loaded", dataset.entities.len());

    let access_token = dotenv::var("MAP_BOX_API_TOKEN").ok();

    eframe::run_native(
        "BizMap",
        native_options,
        Box::new(move |cc| {
            let tile_retriever = TileRetriever::new(access_token);
            Ok(Box::new(ui::my_app::MyApp::new(cc, config, dataset, tile_retriever)))
        }),
    )
}
