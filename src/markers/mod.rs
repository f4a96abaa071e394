pub mod color;
pub mod drag;
pub mod glyph;
pub mod notice;
pub mod popup;
pub mod undo;
