pub mod cluster;
pub mod geo;
pub mod layers;
pub mod map_tile;
pub mod polyline;
pub mod viewport;
