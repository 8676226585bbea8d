//! Output sinks
//!
//! Sinks are written to from the streaming thread and consume audio at
//! their own pace. The streaming thread keeps roughly [`SINK_LEAD`] of
//! audio queued and sleeps for [`AudioSink::ready_in`] in between.

use crate::error::{GraphError, GraphResult};
use crate::types::{duration_to_nanos, FrameFormat, Nanos};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Audio kept queued ahead of the output
pub const SINK_LEAD: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Output device not found: {0}")]
    DeviceNotFound(String),

    #[error("Could not open output: {0}")]
    Open(String),

    #[error("Output stream failed: {0}")]
    Stream(String),
}

/// A running output
pub trait AudioSink: Send {
    /// Format the sink actually consumes
    fn format(&self) -> FrameFormat;

    fn play(&mut self) -> Result<(), SinkError>;

    fn pause(&mut self) -> Result<(), SinkError>;

    /// Queue interleaved samples in [`format`](Self::format)
    fn write(&mut self, samples: &[f32]) -> Result<(), SinkError>;

    /// How long until the sink wants more audio
    fn ready_in(&mut self) -> Duration;

    /// Audio queued but not yet played
    fn latency(&mut self) -> Nanos;

    /// Drop queued audio
    fn flush(&mut self);
}

/// Sink element named in the chain plan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    /// `fakesink`: discards audio in real time
    Null,
    /// `autoaudiosink` / `cpalsink`
    #[cfg(feature = "desktop")]
    Cpal,
}

impl SinkKind {
    pub fn resolve(element: &str) -> GraphResult<Self> {
        match element {
            "fakesink" => Ok(SinkKind::Null),
            #[cfg(feature = "desktop")]
            "autoaudiosink" | "cpalsink" => Ok(SinkKind::Cpal),
            other => Err(GraphError::MissingElement(other.to_string())),
        }
    }

    pub fn open(
        self,
        device: Option<&str>,
        format: FrameFormat,
    ) -> Result<Box<dyn AudioSink>, SinkError> {
        match self {
            SinkKind::Null => {
                if let Some(device) = device {
                    tracing::debug!(device, "fakesink ignores device");
                }
                Ok(Box::new(ClockedNullSink::new(format)))
            }
            #[cfg(feature = "desktop")]
            SinkKind::Cpal => Ok(Box::new(cpal_sink::CpalSink::open(device, format)?)),
        }
    }
}

/// Consumes audio at wall-clock rate without producing sound
pub struct ClockedNullSink {
    format: FrameFormat,
    queued: Nanos,
    playing_since: Option<Instant>,
}

impl ClockedNullSink {
    pub fn new(format: FrameFormat) -> Self {
        Self {
            format,
            queued: 0,
            playing_since: None,
        }
    }

    fn advance(&mut self) {
        if let Some(since) = self.playing_since {
            let now = Instant::now();
            let played = duration_to_nanos(now.duration_since(since));
            self.queued = self.queued.saturating_sub(played);
            self.playing_since = Some(now);
        }
    }
}

impl AudioSink for ClockedNullSink {
    fn format(&self) -> FrameFormat {
        self.format
    }

    fn play(&mut self) -> Result<(), SinkError> {
        if self.playing_since.is_none() {
            self.playing_since = Some(Instant::now());
        }
        Ok(())
    }

    fn pause(&mut self) -> Result<(), SinkError> {
        self.advance();
        self.playing_since = None;
        Ok(())
    }

    fn write(&mut self, samples: &[f32]) -> Result<(), SinkError> {
        self.advance();
        let frames = samples.len() / usize::from(self.format.channels.max(1));
        self.queued += self.format.frames_to_nanos(frames);
        Ok(())
    }

    fn ready_in(&mut self) -> Duration {
        self.advance();
        Duration::from_nanos(self.queued).saturating_sub(SINK_LEAD)
    }

    fn latency(&mut self) -> Nanos {
        self.advance();
        self.queued
    }

    fn flush(&mut self) {
        self.queued = 0;
        if self.playing_since.is_some() {
            self.playing_since = Some(Instant::now());
        }
    }
}

#[cfg(feature = "desktop")]
mod cpal_sink {
    use super::{AudioSink, SinkError, SINK_LEAD};
    use crate::types::{FrameFormat, Nanos};
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{Device, Stream, StreamConfig};
    use crossbeam_channel::{bounded, Receiver, Sender};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread::{self, JoinHandle};
    use std::time::Duration;

    enum AudioCommand {
        Play,
        Pause,
        Shutdown,
    }

    /// Shared between the sink and the cpal callback
    struct SharedQueue {
        samples: Mutex<VecDeque<f32>>,
        playing: AtomicBool,
    }

    /// cpal output driven from a dedicated audio thread
    ///
    /// The thread owns the `Stream`, which is not `Send` on every platform.
    pub struct CpalSink {
        command_tx: Sender<AudioCommand>,
        shared: Arc<SharedQueue>,
        format: FrameFormat,
        audio_thread: Option<JoinHandle<()>>,
    }

    impl CpalSink {
        pub fn open(device_name: Option<&str>, requested: FrameFormat) -> Result<Self, SinkError> {
            let device = pick_device(device_name)?;
            let shared = Arc::new(SharedQueue {
                samples: Mutex::new(VecDeque::new()),
                playing: AtomicBool::new(false),
            });
            let (command_tx, command_rx) = bounded::<AudioCommand>(32);
            let (ready_tx, ready_rx) = bounded::<Result<FrameFormat, SinkError>>(1);

            let shared_for_thread = Arc::clone(&shared);
            let audio_thread = thread::Builder::new()
                .name("soul-pipeline-cpal".to_string())
                .spawn(move || {
                    audio_thread_run(device, requested, shared_for_thread, command_rx, ready_tx);
                })
                .map_err(|e| SinkError::Open(e.to_string()))?;

            let format = ready_rx
                .recv()
                .map_err(|_| SinkError::Open("audio thread exited".to_string()))??;

            tracing::info!(
                sample_rate = format.sample_rate,
                channels = format.channels,
                "cpal output opened"
            );

            Ok(Self {
                command_tx,
                shared,
                format,
                audio_thread: Some(audio_thread),
            })
        }

        fn queued_samples(&self) -> usize {
            self.shared
                .samples
                .lock()
                .map(|queue| queue.len())
                .unwrap_or(0)
        }
    }

    fn pick_device(needle: Option<&str>) -> Result<Device, SinkError> {
        let host = cpal::default_host();
        if let Some(needle) = needle {
            let needle_lc = needle.to_lowercase();
            let devices = host
                .output_devices()
                .map_err(|e| SinkError::Open(e.to_string()))?;
            for device in devices {
                let matches = device
                    .description()
                    .ok()
                    .is_some_and(|d| d.name().to_lowercase().contains(&needle_lc));
                if matches {
                    return Ok(device);
                }
            }
            return Err(SinkError::DeviceNotFound(needle.to_string()));
        }
        host.default_output_device()
            .ok_or_else(|| SinkError::DeviceNotFound("default".to_string()))
    }

    fn build_stream(
        device: &Device,
        config: &StreamConfig,
        shared: &Arc<SharedQueue>,
    ) -> Result<Stream, SinkError> {
        let callback_shared = Arc::clone(shared);
        device
            .build_output_stream(
                config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    audio_callback(data, &callback_shared);
                },
                |err| tracing::error!(error = %err, "Audio stream error"),
                None,
            )
            .map_err(|e| SinkError::Open(e.to_string()))
    }

    fn audio_thread_run(
        device: Device,
        requested: FrameFormat,
        shared: Arc<SharedQueue>,
        command_rx: Receiver<AudioCommand>,
        ready_tx: Sender<Result<FrameFormat, SinkError>>,
    ) {
        let config = StreamConfig {
            channels: requested.channels,
            sample_rate: requested.sample_rate,
            buffer_size: cpal::BufferSize::Default,
        };

        let opened = build_stream(&device, &config, &shared)
            .map(|stream| (stream, requested))
            .or_else(|e| {
                tracing::debug!(error = %e, "Requested format refused; using device default");
                let default = device
                    .default_output_config()
                    .map_err(|e| SinkError::Open(e.to_string()))?;
                let format = FrameFormat::new(default.sample_rate(), default.channels());
                let stream = build_stream(&device, &default.config(), &shared)?;
                Ok((stream, format))
            });

        let stream = match opened {
            Ok((stream, format)) => {
                let _ = ready_tx.send(Ok(format));
                stream
            }
            Err(e) => {
                let _ = ready_tx.send(Err(e));
                return;
            }
        };

        while let Ok(cmd) = command_rx.recv() {
            match cmd {
                AudioCommand::Play => {
                    shared.playing.store(true, Ordering::Release);
                    if let Err(e) = stream.play() {
                        tracing::error!(error = %e, "Failed to start output stream");
                    }
                }
                AudioCommand::Pause => {
                    shared.playing.store(false, Ordering::Release);
                    if let Err(e) = stream.pause() {
                        tracing::warn!(error = %e, "Failed to pause output stream");
                    }
                }
                AudioCommand::Shutdown => break,
            }
        }
        drop(stream);
    }

    fn audio_callback(output: &mut [f32], shared: &SharedQueue) {
        if !shared.playing.load(Ordering::Acquire) {
            output.fill(0.0);
            return;
        }
        let Ok(mut queue) = shared.samples.lock() else {
            output.fill(0.0);
            return;
        };
        for sample in output.iter_mut() {
            *sample = queue.pop_front().unwrap_or(0.0);
        }
    }

    impl AudioSink for CpalSink {
        fn format(&self) -> FrameFormat {
            self.format
        }

        fn play(&mut self) -> Result<(), SinkError> {
            self.command_tx
                .send(AudioCommand::Play)
                .map_err(|_| SinkError::Stream("audio thread exited".to_string()))
        }

        fn pause(&mut self) -> Result<(), SinkError> {
            self.command_tx
                .send(AudioCommand::Pause)
                .map_err(|_| SinkError::Stream("audio thread exited".to_string()))
        }

        fn write(&mut self, samples: &[f32]) -> Result<(), SinkError> {
            let mut queue = self
                .shared
                .samples
                .lock()
                .map_err(|_| SinkError::Stream("sample queue poisoned".to_string()))?;
            queue.extend(samples.iter().copied());
            Ok(())
        }

        fn ready_in(&mut self) -> Duration {
            Duration::from_nanos(self.latency()).saturating_sub(SINK_LEAD)
        }

        fn latency(&mut self) -> Nanos {
            let channels = usize::from(self.format.channels.max(1));
            self.format.frames_to_nanos(self.queued_samples() / channels)
        }

        fn flush(&mut self) {
            if let Ok(mut queue) = self.shared.samples.lock() {
                queue.clear();
            }
        }
    }

    impl Drop for CpalSink {
        fn drop(&mut self) {
            let _ = self.command_tx.send(AudioCommand::Shutdown);
            if let Some(handle) = self.audio_thread.take() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_sink_is_missing_element() {
        assert!(matches!(
            SinkKind::resolve("pulsesink"),
            Err(GraphError::MissingElement(name)) if name == "pulsesink"
        ));
        assert_eq!(SinkKind::resolve("fakesink").unwrap(), SinkKind::Null);
    }

    #[test]
    fn null_sink_holds_audio_while_paused() {
        let mut sink = ClockedNullSink::new(FrameFormat::new(1000, 1));
        sink.write(&[0.0; 500]).unwrap();
        assert_eq!(sink.latency(), 500_000_000);
        assert_eq!(sink.ready_in(), Duration::from_millis(400));

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(sink.latency(), 500_000_000);

        sink.flush();
        assert_eq!(sink.latency(), 0);
        assert_eq!(sink.ready_in(), Duration::ZERO);
    }

    #[test]
    fn null_sink_drains_in_real_time_while_playing() {
        let mut sink = ClockedNullSink::new(FrameFormat::new(1000, 1));
        sink.write(&[0.0; 200]).unwrap();
        sink.play().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        let latency = sink.latency();
        assert!(latency < 200_000_000);
        assert!(latency > 0);
    }
}
