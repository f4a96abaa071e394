//! Marker coloring by a selectable metric.

use std::collections::BTreeMap;

use egui::Color32;
use serde::{Deserialize, Serialize};

use crate::entity::{Entity, Metrics};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum ColorMode {
    #[default]
    Status,
    Affiliation,
    Turnover,
    BankPnl,
    Profit,
    Visits,
}

impl ColorMode {
    pub const ALL: [ColorMode; 6] = [
        ColorMode::Status,
        ColorMode::Affiliation,
        ColorMode::Turnover,
        ColorMode::BankPnl,
        ColorMode::Profit,
        ColorMode::Visits,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            ColorMode::Status => "Status",
            ColorMode::Affiliation => "Primary bank",
            ColorMode::Turnover => "Turnover",
            ColorMode::BankPnl => "Bank P&L",
            ColorMode::Profit => "Profit",
            ColorMode::Visits => "Visits",
        }
    }
}

/// Four-step scale, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Strongest,
    Strong,
    Weak,
    Weakest,
}

/// Turnover brackets; lower bounds are inclusive.
pub fn turnover_tier(turnover: Option<f64>) -> Option<Tier> {
    let value = turnover?;
    Some(if value >= 1_000_000.0 {
        Tier::Strongest
    } else if value >= 500_000.0 {
        Tier::Strong
    } else if value >= 100_000.0 {
        Tier::Weak
    } else {
        Tier::Weakest
    })
}

/// Shared by bank P&L and profit; bounds are exclusive.
pub fn earnings_tier(amount: Option<f64>) -> Option<Tier> {
    let value = amount?;
    Some(if value > 100_000.0 {
        Tier::Strongest
    } else if value > 0.0 {
        Tier::Strong
    } else if value > -50_000.0 {
        Tier::Weak
    } else {
        Tier::Weakest
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitBracket {
    Never,
    Few,
    Regular,
    Frequent,
}

pub fn visit_bracket(count: u32) -> VisitBracket {
    match count {
        0 => VisitBracket::Never,
        c if c >= 10 => VisitBracket::Frequent,
        c if c >= 5 => VisitBracket::Regular,
        _ => VisitBracket::Few,
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Palette {
    #[serde(with = "hex_color")]
    pub fallback: Color32,
    #[serde(with = "hex_color::array")]
    pub tiers: [Color32; 4],
    #[serde(with = "hex_color::array")]
    pub visits: [Color32; 4],
    #[serde(with = "hex_color::map")]
    pub statuses: BTreeMap<String, Color32>,
}

impl Default for Palette {
    fn default() -> Self {
        Self {
            fallback: Color32::from_rgb(0x9e, 0x9e, 0x9e),
            tiers: [
                Color32::from_rgb(0x1b, 0x5e, 0x20),
                Color32::from_rgb(0x43, 0xa0, 0x47),
                Color32::from_rgb(0xfb, 0x8c, 0x00),
                Color32::from_rgb(0xe5, 0x39, 0x35),
            ],
            // never, few, regular, frequent
            visits: [
                Color32::from_rgb(0xd3, 0x2f, 0x2f),
                Color32::from_rgb(0xff, 0xb3, 0x00),
                Color32::from_rgb(0x7c, 0xb3, 0x42),
                Color32::from_rgb(0x2e, 0x7d, 0x32),
            ],
            statuses: [
                ("client", Color32::from_rgb(0x2e, 0x7d, 0x32)),
                ("prospect", Color32::from_rgb(0x19, 0x76, 0xd2)),
                ("lead", Color32::from_rgb(0xff, 0xa0, 0x00)),
                ("inactive", Color32::from_rgb(0x61, 0x61, 0x61)),
            ]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect(),
        }
    }
}

impl Palette {
    pub fn tier(&self, tier: Tier) -> Color32 {
        match tier {
            Tier::Strongest => self.tiers[0],
            Tier::Strong => self.tiers[1],
            Tier::Weak => self.tiers[2],
            Tier::Weakest => self.tiers[3],
        }
    }

    pub fn visits(&self, bracket: VisitBracket) -> Color32 {
        match bracket {
            VisitBracket::Never => self.visits[0],
            VisitBracket::Few => self.visits[1],
            VisitBracket::Regular => self.visits[2],
            VisitBracket::Frequent => self.visits[3],
        }
    }
}

/// Display color of `entity` under `mode`. Total: missing data maps to `palette.fallback`.
pub fn color_for(entity: &Entity, mode: ColorMode, metrics: &Metrics, palette: &Palette) -> Color32 {
    let color = match mode {
        ColorMode::Status => entity
            .status
            .as_ref()
            .and_then(|s| palette.statuses.get(&s.to_lowercase()))
            .copied(),
        ColorMode::Affiliation => metrics
            .primary_affiliation(&entity.id)
            .and_then(|a| a.bank_color),
        ColorMode::Turnover => turnover_tier(entity.turnover).map(|t| palette.tier(t)),
        ColorMode::BankPnl => earnings_tier(entity.bank_pnl).map(|t| palette.tier(t)),
        ColorMode::Profit => earnings_tier(entity.profit).map(|t| palette.tier(t)),
        ColorMode::Visits => metrics
            .is_available()
            .then(|| palette.visits(visit_bracket(metrics.visit_count(&entity.id)))),
    };
    color.unwrap_or(palette.fallback)
}

/// Parses `#rgb`, `#rrggbb` or `#rrggbbaa`.
pub fn parse_hex(text: &str) -> Option<Color32> {
    let hex = text.trim().strip_prefix('#').unwrap_or(text.trim());
    if !hex.is_ascii() {
        return None;
    }
    let channel = |s: &str| u8::from_str_radix(s, 16).ok();
    match hex.len() {
        3 => {
            let mut it = hex.chars().map(|c| c.to_digit(16).map(|d| (d * 17) as u8));
            Some(Color32::from_rgb(it.next()??, it.next()??, it.next()??))
        }
        6 => Some(Color32::from_rgb(channel(&hex[0..2])?, channel(&hex[2..4])?, channel(&hex[4..6])?)),
        8 => Some(Color32::from_rgba_unmultiplied(
            channel(&hex[0..2])?,
            channel(&hex[2..4])?,
            channel(&hex[4..6])?,
            channel(&hex[6..8])?,
        )),
        _ => None,
    }
}

pub fn to_hex(color: Color32) -> String {
    let [r, g, b, a] = color.to_srgba_unmultiplied();
    if a == 255 {
        format!("#{r:02x}{g:02x}{b:02x}")
    } else {
        format!("#{r:02x}{g:02x}{b:02x}{a:02x}")
    }
}

/// Serde adapters storing colors as hex strings.
pub mod hex_color {
    use egui::Color32;
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    fn parse<E: Error>(text: &str) -> Result<Color32, E> {
        super::parse_hex(text).ok_or_else(|| E::custom(format!("invalid color {text:?}")))
    }

    pub fn serialize<S: Serializer>(color: &Color32, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::to_hex(*color))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Color32, D::Error> {
        let text = String::deserialize(deserializer)?;
        parse::<D::Error>(&text)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(color: &Option<Color32>, serializer: S) -> Result<S::Ok, S::Error> {
            match color {
                Some(c) => serializer.serialize_some(&super::super::to_hex(*c)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Color32>, D::Error> {
            match Option::<String>::deserialize(deserializer)? {
                Some(text) => parse::<D::Error>(&text).map(Some),
                None => Ok(None),
            }
        }
    }

    pub mod array {
        use super::*;
        use serde::ser::SerializeSeq;

        pub fn serialize<S: Serializer>(colors: &[Color32; 4], serializer: S) -> Result<S::Ok, S::Error> {
            let mut seq = serializer.serialize_seq(Some(colors.len()))?;
            for c in colors {
                seq.serialize_element(&super::super::to_hex(*c))?;
            }
            seq.end()
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[Color32; 4], D::Error> {
            let texts = <[String; 4]>::deserialize(deserializer)?;
            Ok([
                parse::<D::Error>(&texts[0])?,
                parse::<D::Error>(&texts[1])?,
                parse::<D::Error>(&texts[2])?,
                parse::<D::Error>(&texts[3])?,
            ])
        }
    }

    pub mod map {
        use super::*;
        use std::collections::BTreeMap;
        use serde::ser::SerializeMap;

        pub fn serialize<S: Serializer>(colors: &BTreeMap<String, Color32>, serializer: S) -> Result<S::Ok, S::Error> {
            let mut map = serializer.serialize_map(Some(colors.len()))?;
            for (k, c) in colors {
                map.serialize_entry(k, &super::super::to_hex(*c))?;
            }
            map.end()
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BTreeMap<String, Color32>, D::Error> {
            BTreeMap::<String, String>::deserialize(deserializer)?
                .into_iter()
                .map(|(k, text)| Ok((k, parse::<D::Error>(&text)?)))
                .collect()
        }
    }
}
