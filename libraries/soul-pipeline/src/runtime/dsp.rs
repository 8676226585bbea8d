//! Effects chain processing
//!
//! Runs the stages of an [`AudioChainPlan`] between decode and resample, in
//! plan order: ReplayGain volume, limiter, EQ preamp, equalizer, volume.
//! Queue and convert stages carry no per-sample work here; channel
//! conversion happens once in [`map_channels`].

use crate::effects::replaygain::{db_to_linear, ReplayGainMode, StoredGain};
use crate::error::{GraphError, GraphResult};
use crate::graph::{AudioChainPlan, EqBand, StageSpec, StageUpdate};
use crate::types::FrameFormat;
use std::f32::consts::PI;

/// Gains below this are treated as flat
const FLAT_GAIN_DB: f32 = 0.01;

/// Limiter knee, about -6 dBFS
const LIMITER_THRESHOLD: f32 = 0.5;

#[derive(Debug, Clone)]
struct ReplayGainStage {
    mode: ReplayGainMode,
    preamp_db: f64,
    stored: StoredGain,
    gain: f32,
}

impl ReplayGainStage {
    fn recompute(&mut self) {
        let db = self.stored.resolve(self.mode, self.preamp_db);
        self.gain = db_to_linear(db) as f32;
        tracing::debug!(mode = ?self.mode, gain_db = db, "ReplayGain updated");
    }
}

/// Peaking filter with per-channel history
#[derive(Debug, Clone)]
struct PeakingBand {
    band: EqBand,
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
    /// x1, x2, y1, y2 per channel
    history: Vec<[f32; 4]>,
}

impl PeakingBand {
    fn new(band: EqBand) -> Self {
        Self {
            band,
            b0: 1.0,
            b1: 0.0,
            b2: 0.0,
            a1: 0.0,
            a2: 0.0,
            history: Vec::new(),
        }
    }

    fn is_flat(&self) -> bool {
        self.band.gain_db.abs() < FLAT_GAIN_DB
    }

    fn update_coefficients(&mut self, sample_rate: f32) {
        if sample_rate < 1.0 || self.is_flat() {
            self.b0 = 1.0;
            self.b1 = 0.0;
            self.b2 = 0.0;
            self.a1 = 0.0;
            self.a2 = 0.0;
            return;
        }

        let a = 10.0_f32.powf(self.band.gain_db / 40.0);
        let frequency = self.band.frequency.min(sample_rate * 0.45);
        let q = if self.band.bandwidth > 0.0 {
            frequency / self.band.bandwidth
        } else {
            1.0
        };
        let omega = 2.0 * PI * frequency / sample_rate;
        let (sin_omega, cos_omega) = omega.sin_cos();
        let alpha = sin_omega / (2.0 * q);

        let a0 = 1.0 + alpha / a;
        self.b0 = (1.0 + alpha * a) / a0;
        self.b1 = (-2.0 * cos_omega) / a0;
        self.b2 = (1.0 - alpha * a) / a0;
        self.a1 = (-2.0 * cos_omega) / a0;
        self.a2 = (1.0 - alpha / a) / a0;
    }

    #[inline]
    fn process(&mut self, channel: usize, input: f32) -> f32 {
        let [x1, x2, y1, y2] = self.history[channel];
        let mut out = self.b0 * input + self.b1 * x1 + self.b2 * x2 - self.a1 * y1 - self.a2 * y2;
        if out.abs() < 1e-15 {
            out = 0.0;
        }
        self.history[channel] = [input, x1, out, y1];
        out
    }

    fn reset(&mut self) {
        self.history.iter_mut().for_each(|h| *h = [0.0; 4]);
    }
}

/// Soft clip above the knee
#[inline]
fn limit(sample: f32) -> f32 {
    let magnitude = sample.abs();
    if magnitude <= LIMITER_THRESHOLD {
        return sample;
    }
    let headroom = 1.0 - LIMITER_THRESHOLD;
    let limited = LIMITER_THRESHOLD + headroom * ((magnitude - LIMITER_THRESHOLD) / headroom).tanh();
    limited.copysign(sample)
}

pub struct EffectsChain {
    replaygain: Option<ReplayGainStage>,
    limiter: Option<bool>,
    preamp: f32,
    bands: Vec<PeakingBand>,
    volume: f32,
    format: Option<FrameFormat>,
}

impl EffectsChain {
    pub fn from_plan(plan: &AudioChainPlan) -> Self {
        let mut chain = Self {
            replaygain: None,
            limiter: None,
            preamp: 1.0,
            bands: Vec::new(),
            volume: 1.0,
            format: None,
        };

        for stage in &plan.stages {
            match stage {
                StageSpec::ReplayGainVolume { mode, preamp_db } => {
                    let mut rg = ReplayGainStage {
                        mode: *mode,
                        preamp_db: *preamp_db,
                        stored: StoredGain::default(),
                        gain: 1.0,
                    };
                    rg.recompute();
                    chain.replaygain = Some(rg);
                }
                StageSpec::ReplayGainLimiter { enabled } => chain.limiter = Some(*enabled),
                StageSpec::EqualizerPreamp { volume } => chain.preamp = *volume as f32,
                StageSpec::Equalizer { bands } => {
                    chain.bands = bands.iter().copied().map(PeakingBand::new).collect();
                }
                StageSpec::Volume { volume } => chain.volume = *volume as f32,
                StageSpec::Queue { .. }
                | StageSpec::Convert
                | StageSpec::Resample
                | StageSpec::Sink { .. } => {}
            }
        }
        chain
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    /// Gains read from the current decode stage's tags
    pub fn set_stored_gain(&mut self, stored: StoredGain) {
        if let Some(rg) = self.replaygain.as_mut() {
            rg.stored = stored;
            rg.recompute();
        }
    }

    pub fn apply(&mut self, update: StageUpdate) -> GraphResult<()> {
        match update {
            StageUpdate::Volume(volume) => self.volume = volume as f32,
            StageUpdate::EqualizerPreamp(volume) => self.preamp = volume as f32,
            StageUpdate::EqualizerGains(gains) => {
                if gains.len() != self.bands.len() {
                    return Err(GraphError::InvalidProperty {
                        element: "equalizer".to_string(),
                        property: "band-gains".to_string(),
                        value: format!("{} gains for {} bands", gains.len(), self.bands.len()),
                    });
                }
                let sample_rate = self.format.map(|f| f.sample_rate as f32);
                for (band, gain) in self.bands.iter_mut().zip(gains) {
                    band.band.gain_db = gain;
                    if let Some(rate) = sample_rate {
                        band.update_coefficients(rate);
                    }
                }
            }
            StageUpdate::ReplayGain { mode, preamp_db } => {
                let rg = self
                    .replaygain
                    .as_mut()
                    .ok_or_else(|| GraphError::MissingElement("rgvolume".to_string()))?;
                rg.mode = mode;
                rg.preamp_db = preamp_db;
                rg.recompute();
            }
            StageUpdate::Limiter(enabled) => {
                let limiter = self
                    .limiter
                    .as_mut()
                    .ok_or_else(|| GraphError::MissingElement("rglimiter".to_string()))?;
                *limiter = enabled;
            }
        }
        Ok(())
    }

    fn prepare(&mut self, format: FrameFormat) {
        if self.format == Some(format) {
            return;
        }
        self.format = Some(format);
        let channels = usize::from(format.channels);
        for band in &mut self.bands {
            band.history = vec![[0.0; 4]; channels];
            band.update_coefficients(format.sample_rate as f32);
        }
    }

    /// Run all stages over interleaved `samples` in place
    pub fn process(&mut self, samples: &mut [f32], format: FrameFormat) {
        self.prepare(format);
        let channels = usize::from(format.channels.max(1));

        let rg_gain = self.replaygain.as_ref().map_or(1.0, |rg| rg.gain);
        let limiting = self.limiter.unwrap_or(false);
        let preamp = self.preamp;
        let active: Vec<usize> = (0..self.bands.len())
            .filter(|&i| !self.bands[i].is_flat())
            .collect();

        for frame in samples.chunks_exact_mut(channels) {
            for (ch, sample) in frame.iter_mut().enumerate() {
                let mut value = *sample * rg_gain;
                if limiting {
                    value = limit(value);
                }
                value *= preamp;
                for &i in &active {
                    value = self.bands[i].process(ch, value);
                }
                *sample = value * self.volume;
            }
        }
    }

    /// Clear filter history, e.g. after a flushing seek
    pub fn reset(&mut self) {
        self.bands.iter_mut().for_each(PeakingBand::reset);
    }
}

/// Convert interleaved audio between channel counts
pub fn map_channels(samples: Vec<f32>, from: u16, to: u16) -> Vec<f32> {
    if from == to || from == 0 || to == 0 {
        return samples;
    }
    let (from, to) = (usize::from(from), usize::from(to));
    let frames = samples.len() / from;
    let mut out = Vec::with_capacity(frames * to);

    for frame in samples.chunks_exact(from) {
        if to == 1 {
            out.push(frame.iter().sum::<f32>() / from as f32);
        } else {
            out.extend((0..to).map(|ch| frame[ch % from]));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects::equalizer::EQ_BAND_FREQUENCIES;

    fn plan(replaygain: bool, gain_db: f32) -> AudioChainPlan {
        let mut stages = vec![StageSpec::Convert];
        if replaygain {
            stages.push(StageSpec::ReplayGainVolume {
                mode: ReplayGainMode::Track,
                preamp_db: 0.0,
            });
            stages.push(StageSpec::ReplayGainLimiter { enabled: true });
        }
        stages.push(StageSpec::EqualizerPreamp { volume: 1.0 });
        stages.push(StageSpec::Equalizer {
            bands: EQ_BAND_FREQUENCIES
                .iter()
                .map(|&frequency| EqBand {
                    frequency,
                    bandwidth: frequency,
                    gain_db,
                })
                .collect(),
        });
        stages.push(StageSpec::Volume { volume: 1.0 });
        AudioChainPlan { stages }
    }

    fn sine(freq: f32, rate: u32, frames: usize) -> Vec<f32> {
        (0..frames)
            .flat_map(|i| {
                let v = (2.0 * PI * freq * i as f32 / rate as f32).sin() * 0.25;
                [v, v]
            })
            .collect()
    }

    fn rms(samples: &[f32]) -> f32 {
        (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
    }

    #[test]
    fn flat_chain_is_identity() {
        let mut chain = EffectsChain::from_plan(&plan(false, 0.0));
        let input = sine(440.0, 44100, 512);
        let mut output = input.clone();
        chain.process(&mut output, FrameFormat::new(44100, 2));
        assert_eq!(input, output);
    }

    #[test]
    fn volume_update_scales_output() {
        let mut chain = EffectsChain::from_plan(&plan(false, 0.0));
        chain.apply(StageUpdate::Volume(0.5)).unwrap();
        let mut samples = vec![0.8, -0.4];
        chain.process(&mut samples, FrameFormat::new(44100, 2));
        assert!((samples[0] - 0.4).abs() < 1e-6);
        assert!((samples[1] + 0.2).abs() < 1e-6);
    }

    #[test]
    fn boosted_band_raises_level() {
        let mut chain = EffectsChain::from_plan(&plan(false, 0.0));
        let mut gains = vec![0.0; EQ_BAND_FREQUENCIES.len()];
        gains[5] = 12.0;
        chain.apply(StageUpdate::EqualizerGains(gains)).unwrap();

        let freq = EQ_BAND_FREQUENCIES[5];
        let input = sine(freq, 44100, 8192);
        let mut output = input.clone();
        chain.process(&mut output, FrameFormat::new(44100, 2));
        assert!(rms(&output[4096..]) > rms(&input[4096..]) * 2.0);

        assert!(chain.apply(StageUpdate::EqualizerGains(vec![1.0])).is_err());
    }

    #[test]
    fn replaygain_uses_stored_gain_and_limiter_bounds_output() {
        let mut chain = EffectsChain::from_plan(&plan(true, 0.0));
        chain.set_stored_gain(StoredGain {
            track_gain_db: Some(12.0),
            album_gain_db: None,
        });
        let mut samples = vec![0.9, -0.9];
        chain.process(&mut samples, FrameFormat::new(44100, 2));
        assert!(samples[0] < 1.0 && samples[0] > 0.9);
        assert!(samples[1] > -1.0 && samples[1] < -0.9);

        chain.apply(StageUpdate::Limiter(false)).unwrap();
        let mut samples = vec![0.9, -0.9];
        chain.process(&mut samples, FrameFormat::new(44100, 2));
        assert!(samples[0] > 3.0);
    }

    #[test]
    fn replaygain_updates_need_the_stage() {
        let mut chain = EffectsChain::from_plan(&plan(false, 0.0));
        assert!(matches!(
            chain.apply(StageUpdate::ReplayGain {
                mode: ReplayGainMode::Album,
                preamp_db: 3.0
            }),
            Err(GraphError::MissingElement(name)) if name == "rgvolume"
        ));
        assert!(chain.apply(StageUpdate::Limiter(true)).is_err());
    }

    #[test]
    fn channel_mapping() {
        assert_eq!(map_channels(vec![0.1, 0.2], 1, 2), vec![0.1, 0.1, 0.2, 0.2]);
        let mono = map_channels(vec![0.2, 0.4], 2, 1);
        assert_eq!(mono.len(), 1);
        assert!((mono[0] - 0.3).abs() < 1e-6);
        assert_eq!(map_channels(vec![1.0, 2.0, 3.0], 3, 2), vec![1.0, 2.0]);
    }
}
