//! Effects control: equalizer, replaygain, volume and fader
//!
//! [`EffectsController`] keeps the effect settings of one pipeline and turns
//! every change into [`StageUpdate`]s. It holds no graph reference; the
//! pipeline controller pushes the returned updates into whatever graph is
//! live, so the same settings survive a graph rebuild.

pub mod equalizer;
pub mod fader;
pub mod replaygain;
pub mod volume;

use crate::graph::{EqBand, StageUpdate};
use equalizer::EqualizerSettings;
use fader::{Fader, FaderCurve, FaderDirection};
use replaygain::{ReplayGainMode, ReplayGainSettings};
use std::time::{Duration, Instant};
use volume::Volume;

/// Result of advancing the fader
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FaderTick {
    /// New volume to push, if the fader moved
    pub update: Option<StageUpdate>,
    /// The completion notification is due now
    pub finished: bool,
}

/// Effect settings of one pipeline
#[derive(Debug, Clone)]
pub struct EffectsController {
    equalizer: EqualizerSettings,
    replaygain: ReplayGainSettings,
    volume: Volume,
    fader: Option<Fader>,
    /// Set when a fader completed; `FaderFinished` is due at this instant
    fudge_deadline: Option<Instant>,
    fader_fudge: Duration,
}

impl EffectsController {
    pub fn new(fader_fudge: Duration) -> Self {
        Self {
            equalizer: EqualizerSettings::default(),
            replaygain: ReplayGainSettings::default(),
            volume: Volume::default(),
            fader: None,
            fudge_deadline: None,
            fader_fudge,
        }
    }

    pub fn equalizer(&self) -> &EqualizerSettings {
        &self.equalizer
    }

    pub fn replaygain(&self) -> &ReplayGainSettings {
        &self.replaygain
    }

    pub fn volume_percent(&self) -> u8 {
        self.volume.level()
    }

    pub fn volume_modifier(&self) -> f64 {
        self.volume.modifier()
    }

    /// Gain applied by the volume stage
    pub fn applied_gain(&self) -> f64 {
        self.volume.gain()
    }

    pub fn equalizer_bands(&self) -> Vec<EqBand> {
        self.equalizer.bands()
    }

    pub fn equalizer_preamp(&self) -> f64 {
        self.equalizer.preamp_volume()
    }

    pub fn set_equalizer_enabled(&mut self, enabled: bool) -> Vec<StageUpdate> {
        self.equalizer.enabled = enabled;
        self.equalizer_updates()
    }

    pub fn set_equalizer_params(&mut self, preamp: i32, gains: &[i32]) -> Vec<StageUpdate> {
        self.equalizer.set_params(preamp, gains);
        self.equalizer_updates()
    }

    fn equalizer_updates(&self) -> Vec<StageUpdate> {
        vec![
            StageUpdate::EqualizerPreamp(self.equalizer.preamp_volume()),
            StageUpdate::EqualizerGains(self.equalizer.gains_db()),
        ]
    }

    /// Replace the whole replaygain configuration (before the graph exists)
    pub fn configure_replaygain(&mut self, settings: ReplayGainSettings) {
        self.replaygain = settings;
    }

    /// Change the live replaygain parameters
    pub fn update_replaygain(
        &mut self,
        mode: ReplayGainMode,
        preamp_db: f64,
        compression: bool,
    ) -> Vec<StageUpdate> {
        self.replaygain.mode = mode;
        self.replaygain.preamp_db = preamp_db;
        self.replaygain.compression = compression;
        vec![
            StageUpdate::ReplayGain { mode, preamp_db },
            StageUpdate::Limiter(compression),
        ]
    }

    pub fn set_volume(&mut self, percent: u8) -> StageUpdate {
        self.volume.set_level(percent);
        StageUpdate::Volume(self.volume.gain())
    }

    pub fn set_volume_modifier(&mut self, modifier: f64) -> StageUpdate {
        self.volume.set_modifier(modifier);
        StageUpdate::Volume(self.volume.gain())
    }

    pub fn is_fading(&self) -> bool {
        self.fader.is_some()
    }

    /// Start a fade, superseding any running fade or pending completion
    ///
    /// Returns the volume at the fade's starting point.
    pub fn start_fader(
        &mut self,
        duration: Duration,
        direction: FaderDirection,
        curve: FaderCurve,
        now: Instant,
    ) -> StageUpdate {
        let fader = Fader::start(duration, direction, curve, self.fader.as_ref(), now);
        self.fudge_deadline = None;
        let value = fader.value_at(now);
        self.fader = Some(fader);
        self.set_volume_modifier(value)
    }

    /// Advance the fader to `now`
    pub fn tick(&mut self, now: Instant) -> FaderTick {
        let mut tick = FaderTick::default();

        if let Some(fader) = &self.fader {
            let value = fader.value_at(now);
            let finished = fader.is_finished(now);
            if (value - self.volume.modifier()).abs() > f64::EPSILON {
                tick.update = Some(self.set_volume_modifier(value));
            }
            if finished {
                self.fader = None;
                self.fudge_deadline = Some(now + self.fader_fudge);
            }
        }

        if let Some(deadline) = self.fudge_deadline {
            if now >= deadline {
                self.fudge_deadline = None;
                tick.finished = true;
            }
        }

        tick
    }

    /// Instant at which the next tick has something to do
    pub fn next_deadline(&self) -> Option<Instant> {
        self.fudge_deadline
    }
}
