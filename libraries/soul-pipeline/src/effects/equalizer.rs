//! Equalizer settings
//!
//! Ten peaking bands with fixed centre frequencies. The owning engine works
//! on a slider scale; this module maps it to stage parameters:
//! - band gain: slider −100..=100 → dB (negative side ×0.24, positive ×0.12)
//! - preamp: slider 0..=100 → linear `(preamp + 100) × 0.01`
//!
//! A disabled equalizer keeps its stages in the graph at 0 dB and unity
//! preamp, so toggling never relinks anything.

use crate::graph::EqBand;
use serde::{Deserialize, Serialize};

/// Number of equalizer bands
pub const EQ_BAND_COUNT: usize = 10;

/// Band centre frequencies (Hz)
pub const EQ_BAND_FREQUENCIES: [f32; EQ_BAND_COUNT] = [
    60.0, 170.0, 310.0, 600.0, 1000.0, 3000.0, 6000.0, 12000.0, 14000.0, 16000.0,
];

/// Equalizer configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EqualizerSettings {
    pub enabled: bool,
    /// Slider value, 0..=100
    pub preamp: i32,
    /// Slider values, −100..=100
    pub gains: [i32; EQ_BAND_COUNT],
}

impl Default for EqualizerSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            preamp: 0,
            gains: [0; EQ_BAND_COUNT],
        }
    }
}

impl EqualizerSettings {
    /// Replace preamp and gains
    ///
    /// Extra gains are ignored and missing ones read as 0.
    pub fn set_params(&mut self, preamp: i32, gains: &[i32]) {
        if gains.len() != EQ_BAND_COUNT {
            tracing::warn!(
                expected = EQ_BAND_COUNT,
                got = gains.len(),
                "Equalizer gain count mismatch"
            );
        }
        self.preamp = preamp.clamp(0, 100);
        self.gains = [0; EQ_BAND_COUNT];
        for (slot, gain) in self.gains.iter_mut().zip(gains) {
            *slot = (*gain).clamp(-100, 100);
        }
    }

    /// Linear preamp factor applied before the bands
    pub fn preamp_volume(&self) -> f64 {
        if self.enabled {
            f64::from(self.preamp + 100) * 0.01
        } else {
            1.0
        }
    }

    /// Per-band gains in dB
    pub fn gains_db(&self) -> Vec<f32> {
        self.gains
            .iter()
            .map(|&g| if self.enabled { slider_to_db(g) } else { 0.0 })
            .collect()
    }

    /// Band layout with the current gains
    pub fn bands(&self) -> Vec<EqBand> {
        let mut last_frequency = 0.0;
        EQ_BAND_FREQUENCIES
            .iter()
            .zip(self.gains_db())
            .map(|(&frequency, gain_db)| {
                let bandwidth = frequency - last_frequency;
                last_frequency = frequency;
                EqBand {
                    frequency,
                    bandwidth,
                    gain_db,
                }
            })
            .collect()
    }
}

/// Slider position to dB
#[inline]
pub fn slider_to_db(gain: i32) -> f32 {
    let gain = gain as f32;
    if gain < 0.0 {
        gain * 0.24
    } else {
        gain * 0.12
    }
}
