//! Engine tunables. Every field has a default, so a partial JSON file is enough.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::map::polyline::{TruncationPolicy, DEFAULT_PRECISION};
use crate::markers::glyph::GlyphStyle;

#[derive(Debug, Default, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    pub cluster: ClusterConfig,
    pub drag: DragConfig,
    pub popup: PopupConfig,
    pub focus: FocusConfig,
    pub glyph: GlyphConfig,
    pub polyline: PolylineConfig,
    pub tooltip_fields: TooltipFields,
    pub notices: NoticeConfig,
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| EngineError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&json)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Cluster radius in screen pixels.
    pub radius: f64,
    pub min_zoom: u8,
    /// Above this zoom every point is drawn individually.
    pub max_zoom: u8,
    pub min_points: usize,
    /// Tile extent the radius is measured against.
    pub extent: f64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            radius: 60.0,
            min_zoom: 0,
            max_zoom: 16,
            min_points: 2,
            extent: 512.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DragConfig {
    #[serde(with = "duration_ms")]
    pub long_press: Duration,
    #[serde(with = "duration_ms")]
    pub undo_window: Duration,
    /// Smallest move, in degrees on either axis, that counts as a relocation.
    pub move_epsilon: f64,
    /// Pointer travel in pixels that gives up a pending long press; the map pans instead.
    pub arm_tolerance: f32,
}

impl Default for DragConfig {
    fn default() -> Self {
        Self {
            long_press: Duration::from_secs(3),
            undo_window: Duration::from_secs(15),
            move_epsilon: 1e-5,
            arm_tolerance: 8.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PopupConfig {
    #[serde(with = "duration_ms")]
    pub hover_close_delay: Duration,
    #[serde(with = "duration_ms")]
    pub close_fade: Duration,
}

impl Default for PopupConfig {
    fn default() -> Self {
        Self {
            hover_close_delay: Duration::from_millis(100),
            close_fade: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct FocusConfig {
    #[serde(with = "duration_ms")]
    pub pulse: Duration,
    pub fly_to_zoom: f64,
    #[serde(with = "duration_ms")]
    pub fly_duration: Duration,
}

impl Default for FocusConfig {
    fn default() -> Self {
        Self {
            pulse: Duration::from_secs(5),
            fly_to_zoom: 15.0,
            fly_duration: Duration::from_millis(1200),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct GlyphConfig {
    pub style: GlyphStyle,
    /// Width and height at `base_zoom`; the height of a pin is 1.3x its width.
    pub base_size: f32,
    pub base_zoom: f64,
    /// Growth per zoom level, as a fraction of `base_size`.
    pub zoom_step: f32,
    pub min_size: f32,
    pub max_size: f32,
    /// Metric badges show from this zoom on.
    pub reveal_zoom: f64,
    /// Extra width and height when a badge is drawn.
    pub badge_growth: f32,
}

impl Default for GlyphConfig {
    fn default() -> Self {
        Self {
            style: GlyphStyle::default(),
            base_size: 24.0,
            base_zoom: 12.0,
            zoom_step: 0.12,
            min_size: 14.0,
            max_size: 40.0,
            reveal_zoom: 14.0,
            badge_growth: 10.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PolylineConfig {
    pub precision: u32,
    pub truncation: TruncationPolicy,
}

impl Default for PolylineConfig {
    fn default() -> Self {
        Self {
            precision: DEFAULT_PRECISION,
            truncation: TruncationPolicy::Lenient,
        }
    }
}

/// Ordered field names shown in marker popups.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct TooltipFields(pub Vec<String>);

impl Default for TooltipFields {
    fn default() -> Self {
        Self(
            ["status", "sector", "turnover", "employees", "last_visit"]
                .into_iter()
                .map(String::from)
                .collect(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct NoticeConfig {
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

impl Default for NoticeConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(4),
        }
    }
}

/// Settings owned by the external config store, fetched at runtime.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RemoteSettings {
    pub tooltip_fields: Option<TooltipFields>,
    pub reveal_zoom: Option<f64>,
}

/// Serialises a `Duration` as whole milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
