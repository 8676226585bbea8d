//! `audioresample` stage
//!
//! Converts decoded audio to the sink rate with rubato's `SincFixedIn`.
//! Input arrives in arbitrary frame counts, so samples are buffered until a
//! full chunk is available. When the input rate changes (a new decode stage
//! with a different rate) the old resampler is flushed and rebuilt.

use crate::config::ResamplerSettings;
use crate::types::FrameFormat;
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use std::collections::VecDeque;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResampleError {
    #[error("Resampler setup failed: {0}")]
    Construction(String),

    #[error("Resampling failed: {0}")]
    Process(String),
}

pub type ResampleResult<T> = std::result::Result<T, ResampleError>;

pub struct ChainResampler {
    output_rate: u32,
    chunk_size: usize,
    sinc_len: usize,
    input: Option<FrameFormat>,
    resampler: Option<SincFixedIn<f32>>,
    input_buffer: VecDeque<f32>,
}

impl ChainResampler {
    pub fn new(output_rate: u32, settings: &ResamplerSettings) -> Self {
        Self {
            output_rate,
            chunk_size: settings.chunk_size.max(1),
            sinc_len: settings.sinc_len.max(8),
            input: None,
            resampler: None,
            input_buffer: VecDeque::new(),
        }
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }

    fn is_passthrough(&self) -> bool {
        self.input
            .map_or(true, |format| format.sample_rate == self.output_rate)
    }

    fn configure(&mut self, format: FrameFormat) -> ResampleResult<()> {
        self.input = Some(format);
        self.input_buffer.clear();
        if format.sample_rate == self.output_rate {
            self.resampler = None;
            return Ok(());
        }

        let params = SincInterpolationParameters {
            sinc_len: self.sinc_len,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Cubic,
            oversampling_factor: 256,
            window: WindowFunction::BlackmanHarris,
        };
        let ratio = f64::from(self.output_rate) / f64::from(format.sample_rate);
        let resampler = SincFixedIn::<f32>::new(
            ratio,
            1.0,
            params,
            self.chunk_size,
            usize::from(format.channels),
        )
        .map_err(|e| ResampleError::Construction(e.to_string()))?;

        tracing::debug!(
            from = format.sample_rate,
            to = self.output_rate,
            channels = format.channels,
            "Resampler configured"
        );
        self.resampler = Some(resampler);
        Ok(())
    }

    /// Resample interleaved `input` in `format`
    pub fn process(&mut self, input: &[f32], format: FrameFormat) -> ResampleResult<Vec<f32>> {
        let mut output = Vec::new();
        if self.input != Some(format) {
            if self.input.is_some() {
                output = self.flush()?;
            }
            self.configure(format)?;
        }

        let channels = usize::from(format.channels);
        if input.len() % channels != 0 {
            return Err(ResampleError::Process(format!(
                "Input buffer size {} is not a multiple of channel count {}",
                input.len(),
                channels
            )));
        }

        let Some(resampler) = self.resampler.as_mut() else {
            output.extend_from_slice(input);
            return Ok(output);
        };

        self.input_buffer.extend(input.iter().copied());
        loop {
            let needed_frames = resampler.input_frames_next();
            let needed_samples = needed_frames * channels;
            if self.input_buffer.len() < needed_samples {
                break;
            }

            let chunk: Vec<f32> = self.input_buffer.drain(..needed_samples).collect();
            let chans = deinterleave(&chunk, channels);
            let resampled = resampler
                .process(chans.as_slice(), None)
                .map_err(|e| ResampleError::Process(e.to_string()))?;
            output.extend(interleave(&resampled));
        }

        Ok(output)
    }

    /// Push out whatever is still buffered, e.g. at end of stream
    pub fn flush(&mut self) -> ResampleResult<Vec<f32>> {
        let Some(format) = self.input else {
            return Ok(Vec::new());
        };
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(self.input_buffer.drain(..).collect());
        };
        if self.input_buffer.is_empty() {
            return Ok(Vec::new());
        }

        let remaining: Vec<f32> = self.input_buffer.drain(..).collect();
        let chans = deinterleave(&remaining, usize::from(format.channels));
        let resampled = resampler
            .process_partial(Some(chans.as_slice()), None)
            .map_err(|e| ResampleError::Process(e.to_string()))?;
        Ok(interleave(&resampled))
    }

    /// Drop buffered input and filter state, e.g. after a seek
    pub fn reset(&mut self) {
        self.input_buffer.clear();
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
        }
    }

    /// Delay introduced by the filter, in output frames
    pub fn latency_frames(&self) -> usize {
        if self.is_passthrough() {
            return 0;
        }
        self.resampler.as_ref().map_or(0, |r| r.output_delay())
    }
}

/// [L, R, L, R, ...] to [[L, L, ...], [R, R, ...]]
fn deinterleave(interleaved: &[f32], channels: usize) -> Vec<Vec<f32>> {
    let frames = interleaved.len() / channels;
    let mut out = vec![Vec::with_capacity(frames); channels];
    for frame in interleaved.chunks_exact(channels) {
        for (ch, sample) in frame.iter().enumerate() {
            out[ch].push(*sample);
        }
    }
    out
}

fn interleave(channels: &[Vec<f32>]) -> Vec<f32> {
    let Some(first) = channels.first() else {
        return Vec::new();
    };
    let frames = first.len();
    let mut out = Vec::with_capacity(frames * channels.len());
    for i in 0..frames {
        for ch in channels {
            out.push(ch[i]);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> ResamplerSettings {
        ResamplerSettings {
            chunk_size: 256,
            sinc_len: 64,
        }
    }

    #[test]
    fn matching_rates_pass_through() {
        let mut resampler = ChainResampler::new(44100, &settings());
        let input = vec![0.25f32; 200];
        let out = resampler
            .process(&input, FrameFormat::new(44100, 2))
            .unwrap();
        assert_eq!(out, input);
        assert_eq!(resampler.latency_frames(), 0);
    }

    #[test]
    fn upsampling_roughly_doubles_frames() {
        let mut resampler = ChainResampler::new(48000, &settings());
        let format = FrameFormat::new(24000, 1);
        let input: Vec<f32> = (0..24000).map(|i| (i as f32 * 0.01).sin()).collect();

        let mut out = resampler.process(&input, format).unwrap();
        out.extend(resampler.flush().unwrap());

        let expected = 48000.0;
        let ratio = out.len() as f64 / expected;
        assert!((0.95..=1.05).contains(&ratio), "got {} samples", out.len());
    }

    #[test]
    fn format_change_flushes_and_reconfigures() {
        let mut resampler = ChainResampler::new(48000, &settings());
        resampler
            .process(&vec![0.0; 100], FrameFormat::new(44100, 2))
            .unwrap();
        let out = resampler
            .process(&vec![0.5; 100], FrameFormat::new(48000, 2))
            .unwrap();
        assert!(out.len() >= 100);
        assert_eq!(&out[out.len() - 100..], &[0.5; 100][..]);
    }

    #[test]
    fn interleave_roundtrip_keeps_channel_order() {
        let chans = deinterleave(&[1.0, 2.0, 3.0, 4.0], 2);
        assert_eq!(chans, vec![vec![1.0, 3.0], vec![2.0, 4.0]]);
        assert_eq!(interleave(&chans), vec![1.0, 2.0, 3.0, 4.0]);
    }
}
