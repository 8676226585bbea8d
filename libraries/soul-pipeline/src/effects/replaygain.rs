//! ReplayGain settings and gain resolution
//!
//! The replaygain stages are part of the graph plan only when replaygain is
//! enabled before `Init`. Afterwards the mode, preamp and compression flag
//! can still be pushed into the running stages.
//!
//! # Gain Resolution
//!
//! - Track mode: track gain, falling back to album gain
//! - Album mode: album gain, falling back to track gain
//! - Off: neither (0 dB)
//!
//! The preamp is added on top of the resolved gain in every mode.

use crate::graph::{tags, TagList};
use serde::{Deserialize, Serialize};

/// Which stored gain the volume stage applies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplayGainMode {
    #[default]
    Track,
    Album,
    Off,
}

impl ReplayGainMode {
    /// Numeric mode as used by the owning engine's preferences (0 track, 1 album)
    pub fn from_index(index: i32) -> Self {
        match index {
            0 => ReplayGainMode::Track,
            1 => ReplayGainMode::Album,
            _ => ReplayGainMode::Off,
        }
    }

    pub fn album_mode(self) -> bool {
        self == ReplayGainMode::Album
    }
}

/// ReplayGain configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReplayGainSettings {
    pub enabled: bool,
    pub mode: ReplayGainMode,
    /// Added to the stored gain, in dB
    pub preamp_db: f64,
    /// Enables the soft limiter after the gain stage
    pub compression: bool,
}

impl Default for ReplayGainSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: ReplayGainMode::Track,
            preamp_db: 0.0,
            compression: true,
        }
    }
}

/// Gains read from a stream's tags
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StoredGain {
    pub track_gain_db: Option<f64>,
    pub album_gain_db: Option<f64>,
}

impl StoredGain {
    pub fn from_tags(tags: &TagList) -> Self {
        Self {
            track_gain_db: tags.get(tags::TRACK_GAIN).and_then(parse_gain_db),
            album_gain_db: tags.get(tags::ALBUM_GAIN).and_then(parse_gain_db),
        }
    }

    /// Gain in dB to apply for `mode` plus `preamp_db`
    pub fn resolve(&self, mode: ReplayGainMode, preamp_db: f64) -> f64 {
        let stored = match mode {
            ReplayGainMode::Track => self.track_gain_db.or(self.album_gain_db),
            ReplayGainMode::Album => self.album_gain_db.or(self.track_gain_db),
            ReplayGainMode::Off => None,
        };
        stored.unwrap_or(0.0) + preamp_db
    }
}

/// Parse a gain tag value such as `-3.45 dB` or `+1.2`
pub fn parse_gain_db(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    let number = trimmed
        .strip_suffix("dB")
        .or_else(|| trimmed.strip_suffix("db"))
        .or_else(|| trimmed.strip_suffix("DB"))
        .unwrap_or(trimmed)
        .trim();
    number.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Convert dB to a linear multiplier
#[inline]
pub fn db_to_linear(db: f64) -> f64 {
    10.0_f64.powf(db / 20.0)
}
