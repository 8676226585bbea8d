//! Graph plans
//!
//! [`GraphBuilder`] collects the build-time options (output, buffering,
//! user agent) and turns them plus the current effect settings into an
//! [`AudioChainPlan`] and a [`DecodePlan`]. It holds no runtime state; the
//! only thing it remembers after `Init` is that the options are frozen.

use super::description::{DescriptionError, ElementChain};
use super::{AudioChainPlan, DecodePlan, StageSpec};
use crate::config::PipelineSettings;
use crate::effects::EffectsController;
use crate::error::{PipelineError, Result};
use url::Url;

/// Queue low watermark in percent
const QUEUE_LOW_PERCENT: u32 = 33;

const CDDA_SCHEME: &str = "cdda";

#[derive(Debug, Clone)]
pub struct GraphBuilder {
    sink: String,
    device: Option<String>,
    buffer_duration_ns: u64,
    user_agent: String,
    built: bool,
}

impl GraphBuilder {
    pub fn new(settings: &PipelineSettings) -> Self {
        Self {
            sink: settings.output.sink.clone(),
            device: non_empty(&settings.output.device),
            buffer_duration_ns: settings.buffer_duration_ns,
            user_agent: settings.user_agent.clone(),
            built: false,
        }
    }

    /// Fails once the graph has been built
    pub fn ensure_unbuilt(&self, operation: &'static str) -> Result<()> {
        if self.built {
            tracing::warn!(operation, "Called after Init; ignoring");
            return Err(PipelineError::ContractViolation(operation));
        }
        Ok(())
    }

    pub fn mark_built(&mut self) {
        self.built = true;
    }

    pub fn is_built(&self) -> bool {
        self.built
    }

    /// Choose the sink element and device. Must be called before `Init`.
    pub fn set_output_device(&mut self, sink: &str, device: &str) -> Result<()> {
        self.ensure_unbuilt("set_output_device")?;
        self.sink = sink.to_string();
        self.device = non_empty(device);
        Ok(())
    }

    /// Queue size in nanoseconds, 0 for none. Must be called before `Init`.
    pub fn set_buffer_duration(&mut self, nanos: u64) -> Result<()> {
        self.ensure_unbuilt("set_buffer_duration")?;
        self.buffer_duration_ns = nanos;
        Ok(())
    }

    pub fn sink(&self) -> &str {
        &self.sink
    }

    pub fn device(&self) -> Option<&str> {
        self.device.as_deref()
    }

    pub fn buffer_duration_ns(&self) -> u64 {
        self.buffer_duration_ns
    }

    /// Effects chain from queue to sink
    pub fn chain_plan(&self, effects: &EffectsController) -> AudioChainPlan {
        let mut stages = vec![
            StageSpec::Queue {
                max_size_time_ns: self.buffer_duration_ns,
                use_buffering: self.buffer_duration_ns > 0,
                low_percent: QUEUE_LOW_PERCENT,
            },
            StageSpec::Convert,
        ];

        let replaygain = effects.replaygain();
        if replaygain.enabled {
            stages.push(StageSpec::ReplayGainVolume {
                mode: replaygain.mode,
                preamp_db: replaygain.preamp_db,
            });
            stages.push(StageSpec::ReplayGainLimiter {
                enabled: replaygain.compression,
            });
            stages.push(StageSpec::Convert);
        }

        stages.push(StageSpec::EqualizerPreamp {
            volume: effects.equalizer_preamp(),
        });
        stages.push(StageSpec::Equalizer {
            bands: effects.equalizer_bands(),
        });
        stages.push(StageSpec::Volume {
            volume: effects.applied_gain(),
        });
        stages.push(StageSpec::Resample);
        stages.push(StageSpec::Sink {
            element: self.sink.clone(),
            device: self.device.clone(),
        });

        AudioChainPlan { stages }
    }

    /// Decode stage for a URL
    ///
    /// `cdda://<device>/<track>` is split so the decode stage opens
    /// `cdda://<track>` on `<device>`.
    pub fn decode_plan_from_url(&self, url: &Url) -> Result<DecodePlan> {
        let (uri, source_device) = split_device_url(url)?;
        Ok(DecodePlan::Uri {
            uri,
            source_device,
            buffer_duration_ns: self.buffer_duration_ns,
            user_agent: self.user_agent.clone(),
        })
    }

    pub fn decode_plan_from_description(
        &self,
        description: &str,
    ) -> std::result::Result<DecodePlan, DescriptionError> {
        ElementChain::parse(description).map(DecodePlan::Description)
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

fn split_device_url(url: &Url) -> Result<(Url, Option<String>)> {
    if url.scheme() != CDDA_SCHEME {
        return Ok((url.clone(), None));
    }

    let raw = url.as_str();
    let rest = raw
        .strip_prefix("cdda://")
        .unwrap_or(raw)
        .trim_end_matches('/');
    let Some((device, track)) = rest.rsplit_once('/') else {
        return Ok((url.clone(), None));
    };
    if device.is_empty() || track.is_empty() {
        return Ok((url.clone(), None));
    }

    let uri = Url::parse(&format!("cdda://{track}")).map_err(|e| {
        PipelineError::InitializationFailure(format!("Invalid CD track in {url}: {e}"))
    })?;
    Ok((uri, Some(device.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects::replaygain::ReplayGainSettings;
    use std::time::Duration;

    fn builder() -> GraphBuilder {
        GraphBuilder::new(&PipelineSettings::default())
    }

    #[test]
    fn chain_without_replaygain_skips_rg_stages() {
        let effects = EffectsController::new(Duration::ZERO);
        let plan = builder().chain_plan(&effects);
        assert_eq!(
            plan.element_names(),
            vec![
                "queue",
                "audioconvert",
                "eq-preamp",
                "equalizer",
                "volume",
                "audioresample",
                "sink"
            ]
        );
        assert!(!plan.has_replaygain());
    }

    #[test]
    fn chain_with_replaygain_has_full_order() {
        let mut effects = EffectsController::new(Duration::ZERO);
        effects.configure_replaygain(ReplayGainSettings {
            enabled: true,
            ..Default::default()
        });
        let mut builder = builder();
        builder.set_buffer_duration(2_000_000_000).unwrap();
        let plan = builder.chain_plan(&effects);
        assert_eq!(
            plan.element_names(),
            vec![
                "queue",
                "audioconvert",
                "rgvolume",
                "rglimiter",
                "audioconvert",
                "eq-preamp",
                "equalizer",
                "volume",
                "audioresample",
                "sink"
            ]
        );
        assert!(matches!(
            plan.stages[0],
            StageSpec::Queue {
                max_size_time_ns: 2_000_000_000,
                use_buffering: true,
                low_percent: 33
            }
        ));
    }

    #[test]
    fn setters_after_build_are_contract_violations() {
        let mut builder = builder();
        builder.set_output_device("fakesink", "").unwrap();
        builder.mark_built();
        assert!(matches!(
            builder.set_output_device("autoaudiosink", "hw:0"),
            Err(PipelineError::ContractViolation("set_output_device"))
        ));
        assert!(builder.set_buffer_duration(1).is_err());
        assert_eq!(builder.sink(), "fakesink");
    }

    #[test]
    fn cdda_urls_are_split_into_track_and_device() {
        let url = Url::parse("cdda:///dev/sr0/4").unwrap();
        match builder().decode_plan_from_url(&url).unwrap() {
            DecodePlan::Uri {
                uri, source_device, ..
            } => {
                assert_eq!(uri.as_str(), "cdda://4");
                assert_eq!(source_device.as_deref(), Some("/dev/sr0"));
            }
            other => panic!("unexpected plan {other:?}"),
        }

        let plain = Url::parse("file:///music/a.flac").unwrap();
        let plan = builder().decode_plan_from_url(&plain).unwrap();
        assert_eq!(plan.uri(), Some(&plain));
    }

    #[test]
    fn malformed_description_is_rejected() {
        assert!(builder().decode_plan_from_description("audiotestsrc !").is_err());
        assert!(builder()
            .decode_plan_from_description("audiotestsrc num-buffers=10")
            .is_ok());
    }
}
