/// Pipeline configuration
use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PipelineSettings {
    /// Upper bound for `PipelineController::state()` queries
    #[serde(default = "default_state_timeout_ms")]
    pub state_timeout_ms: u64,

    /// Delay between a fade completing and `FaderFinished`
    #[serde(default = "default_fader_fudge_ms")]
    pub fader_fudge_ms: u64,

    /// Queue size in nanoseconds; 0 disables buffering
    #[serde(default)]
    pub buffer_duration_ns: u64,

    /// How long a drained source waits for its gapless replacement
    #[serde(default = "default_drain_grace_ms")]
    pub drain_grace_ms: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default = "default_output")]
    pub output: OutputSettings,

    #[serde(default = "default_resampler")]
    pub resampler: ResamplerSettings,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct OutputSettings {
    /// Sink element name (`autoaudiosink`, `cpalsink`, `fakesink`)
    #[serde(default = "default_sink")]
    pub sink: String,

    /// Device name substring; empty picks the default device
    #[serde(default)]
    pub device: String,

    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    #[serde(default = "default_channels")]
    pub channels: u16,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ResamplerSettings {
    /// Frames per resampler chunk
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    #[serde(default = "default_sinc_len")]
    pub sinc_len: usize,
}

impl PipelineSettings {
    /// Load settings from an optional TOML file and the environment
    ///
    /// Environment variables use the `SOUL_PIPELINE_` prefix and `__` for
    /// nesting, e.g. `SOUL_PIPELINE_OUTPUT__SINK=fakesink`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = config::Config::builder();

        if let Some(path) = path {
            if path.exists() {
                settings = settings.add_source(config::File::from(path));
            }
        }

        settings = settings.add_source(
            config::Environment::with_prefix("SOUL_PIPELINE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = settings
            .build()
            .map_err(|e| PipelineError::Config(e.to_string()))?;

        config
            .try_deserialize()
            .map_err(|e| PipelineError::Config(e.to_string()))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.state_timeout_ms == 0 {
            return Err(PipelineError::Config(
                "state_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.output.sample_rate == 0 || self.output.channels == 0 {
            return Err(PipelineError::Config(format!(
                "Invalid output format: {} Hz, {} channels",
                self.output.sample_rate, self.output.channels
            )));
        }
        if self.resampler.chunk_size == 0 {
            return Err(PipelineError::Config(
                "resampler.chunk_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn state_timeout(&self) -> Duration {
        Duration::from_millis(self.state_timeout_ms)
    }

    pub fn fader_fudge(&self) -> Duration {
        Duration::from_millis(self.fader_fudge_ms)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            state_timeout_ms: default_state_timeout_ms(),
            fader_fudge_ms: default_fader_fudge_ms(),
            buffer_duration_ns: 0,
            drain_grace_ms: default_drain_grace_ms(),
            user_agent: default_user_agent(),
            output: default_output(),
            resampler: default_resampler(),
        }
    }
}

// Default values
fn default_state_timeout_ms() -> u64 {
    10
}

fn default_fader_fudge_ms() -> u64 {
    2000
}

fn default_drain_grace_ms() -> u64 {
    500
}

fn default_user_agent() -> String {
    format!("soul-pipeline/{}", env!("CARGO_PKG_VERSION"))
}

fn default_output() -> OutputSettings {
    OutputSettings {
        sink: default_sink(),
        device: String::new(),
        sample_rate: default_sample_rate(),
        channels: default_channels(),
    }
}

fn default_sink() -> String {
    "autoaudiosink".to_string()
}

fn default_sample_rate() -> u32 {
    44100
}

fn default_channels() -> u16 {
    2
}

fn default_resampler() -> ResamplerSettings {
    ResamplerSettings {
        chunk_size: default_chunk_size(),
        sinc_len: default_sinc_len(),
    }
}

fn default_chunk_size() -> usize {
    1024
}

fn default_sinc_len() -> usize {
    128
}
