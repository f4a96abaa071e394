use egui::{vec2, Rect};

use crate::error::{EngineError, Result};
use crate::map::geo::{tile_coords_to_geo_bounds, Coordinate, GeoBounds};
use crate::map::layers::BaseStyle;
use crate::map::viewport::Viewport;

/// A raster tile address: style plus `(z, x, y)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileKey {
    pub style: BaseStyle,
    pub zoom: u32,
    pub x: u32,
    pub y: u32,
}

impl TileKey {
    pub fn new(style: BaseStyle, zoom: u32, x: u32, y: u32) -> Self {
        Self { style, zoom, x, y }
    }

    pub fn bounds(&self) -> GeoBounds {
        tile_coords_to_geo_bounds(self.x, self.y, self.zoom)
    }

    pub fn url(&self) -> String {
        self.style.tile_url(self.zoom, self.x, self.y)
    }
}

/// A decoded base map tile. The texture is uploaded on first draw, since that needs the egui context.
pub struct MapTile {
    pub key: TileKey,
    size: [usize; 2],
    rgba: Vec<u8>,
    texture: Option<egui::TextureHandle>,
}

impl MapTile {
    /// Decodes PNG, JPEG or WebP bytes.
    pub fn decode(key: TileKey, bytes: &[u8]) -> Result<Self> {
        let image = image::load_from_memory(bytes).map_err(|e| EngineError::Tile(format!("{:?}: {e}", key)))?;
        let buffer = image.to_rgba8();
        let (width, height) = buffer.dimensions();
        Ok(Self {
            key,
            size: [width as usize, height as usize],
            rgba: buffer.into_raw(),
            texture: None,
        })
    }

    pub fn size(&self) -> [usize; 2] {
        self.size
    }

    pub fn texture(&mut self, ctx: &egui::Context) -> &egui::TextureHandle {
        let TileKey { style, zoom, x, y } = self.key;
        let (size, rgba) = (self.size, &self.rgba);
        self.texture.get_or_insert_with(|| {
            let color_image = egui::ColorImage::from_rgba_unmultiplied(size, rgba);
            ctx.load_texture(
                format!("tile_{}_{zoom}_{x}_{y}", style.label()),
                color_image,
                egui::TextureOptions::default(),
            )
        })
    }
}

/// Tiles covering the viewport at its integer zoom, with the screen rect each one fills.
/// Screen positions are relative to the viewport's top-left corner.
pub fn visible_tiles(viewport: &Viewport, style: BaseStyle) -> Vec<(TileKey, Rect)> {
    let zoom = (viewport.zoom().floor().max(0.0) as u32).min(style.max_zoom());
    let bounds = viewport.bounds();
    let mut tiles = Vec::new();
    for (x, y) in bounds.all_x_y_zoom(zoom) {
        let tile = tile_coords_to_geo_bounds(x, y, zoom);
        let nw = viewport.project(&Coordinate::new(tile.north(), tile.west()));
        let se = viewport.project(&Coordinate::new(tile.south(), tile.east()));
        // Tiles across the antimeridian are shifted by a world width toward the screen.
        let rect = Rect::from_min_max(nw, se);
        let world = viewport.world_size() as f32;
        let shift = ((viewport.size().x / 2.0 - rect.center().x) / world).round() * world;
        let rect = rect.translate(vec2(shift, 0.0));
        tiles.push((TileKey::new(style, zoom, x, y), rect));
    }
    tiles
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgba, RgbaImage};
    use std::io::Cursor;

    #[test]
    fn decodes_png_bytes() {
        let image = RgbaImage::from_pixel(4, 2, Rgba([10, 20, 30, 255]));
        let mut bytes = Vec::new();
        image.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png).unwrap();

        let tile = MapTile::decode(TileKey::new(BaseStyle::Streets, 1, 0, 1), &bytes).unwrap();
        assert_eq!(tile.size(), [4, 2]);
        assert_eq!(&tile.rgba[..4], &[10, 20, 30, 255]);
    }

    #[test]
    fn garbage_is_a_tile_error() {
        let result = MapTile::decode(TileKey::new(BaseStyle::Dark, 0, 0, 0), b"not an image");
        assert!(matches!(result, Err(EngineError::Tile(_))));
    }

    #[test]
    fn visible_tiles_cover_viewport() {
        let viewport = Viewport::new(Coordinate::new(0.0, 0.0), 1.0, vec2(512.0, 512.0)).with_tile_size(256.0);
        let tiles = visible_tiles(&viewport, BaseStyle::Streets);
        assert_eq!(tiles.len(), 4);
        let union = tiles.iter().fold(Rect::NOTHING, |acc, (_, r)| acc.union(*r));
        assert!((union.width() - 512.0).abs() < 0.5);
        assert!((union.height() - 512.0).abs() < 0.5);
    }
}
