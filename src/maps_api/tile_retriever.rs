use crate::error::{EngineError, Result};
use crate::map::map_tile::{MapTile, TileKey};

/// Fetches base map raster tiles over HTTP.
#[derive(Debug, Clone)]
pub struct TileRetriever {
    client: reqwest::Client,
    access_token: Option<String>,
}

impl TileRetriever {
    pub fn new(access_token: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("bizmap/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self { client, access_token }
    }

    fn url(&self, key: &TileKey) -> String {
        let url = key.url();
        match &self.access_token {
            Some(token) => format!("{url}?access_token={token}"),
            None => url,
        }
    }

    /// Fetches and decodes one tile of the style named in `key`.
    pub async fn fetch_tile(&self, key: TileKey) -> Result<MapTile> {
        let url = self.url(&key);
        log::debug!("fetching tile {url}");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| EngineError::Tile(e.to_string()))?;

        if !response.status().is_success() {
            return Err(EngineError::Tile(format!("{url}: {}", response.status())));
        }

        let bytes = response.bytes().await.map_err(|e| EngineError::Tile(e.to_string()))?;
        MapTile::decode(key, &bytes)
    }
}
