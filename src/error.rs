//! Error types for the marker engine.
//!
//! Nothing here is fatal: the orchestrator turns every variant into state
//! (a fallback, a snap-back or a notice) and logs it.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("polyline error: {0}")]
    Polyline(#[from] PolylineError),

    #[error("location update for {entity_id} failed: {reason}")]
    LocationUpdate { entity_id: String, reason: String },

    #[error("configuration fetch failed: {0}")]
    ConfigFetch(String),

    #[error("metrics fetch failed: {0}")]
    MetricsFetch(String),

    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("tile error: {0}")]
    Tile(String),
}

/// Failures while decoding an encoded polyline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolylineError {
    /// The input ended in the middle of a varint group or a lat/lon pair.
    #[error("encoded polyline truncated at byte {offset}")]
    Truncated { offset: usize },

    /// A byte outside the printable range used by the encoding (63..=126).
    #[error("invalid byte 0x{byte:02x} at offset {offset}")]
    InvalidByte { offset: usize, byte: u8 },

    /// A single varint exceeded the width of a 32-bit delta.
    #[error("varint overflow at offset {offset}")]
    Overflow { offset: usize },
}
