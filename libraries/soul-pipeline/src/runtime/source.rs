//! Decode stage sources
//!
//! A [`SourceSpec`] is resolved synchronously from a [`DecodePlan`] when the
//! stage is attached, so unknown elements and unsupported schemes fail
//! immediately. Opening the source (file access, probing, codec setup)
//! happens on the streaming thread during preroll; failures there are
//! reported on the bus as [`SourceError`]s.

use crate::error::{GraphError, GraphResult};
use crate::graph::description::{ElementChain, ElementDesc};
use crate::graph::{tags, DecodePlan, TagList};
use crate::types::{
    resource_error, stream_error, AudioFrame, ErrorDomain, FrameFormat, Nanos,
};
use std::f64::consts::TAU;
use std::path::{Path, PathBuf};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::{MetadataOptions, MetadataRevision, StandardTagKey};
use symphonia::core::probe::Hint;
use symphonia::core::units::{Time, TimeBase};
use thiserror::Error;
use url::Url;

/// Elements accepted after the source element of a raw description
const PASSTHROUGH_ELEMENTS: &[&str] = &[
    "decodebin",
    "audioconvert",
    "audioresample",
    "queue",
    "identity",
];

/// Failure while opening or reading a source
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct SourceError {
    pub domain: ErrorDomain,
    pub code: i32,
    pub message: String,
    pub debug: Option<String>,
}

impl SourceError {
    fn resource(code: i32, message: impl Into<String>) -> Self {
        Self {
            domain: ErrorDomain::Resource,
            code,
            message: message.into(),
            debug: None,
        }
    }

    fn stream(code: i32, message: impl Into<String>, debug: impl ToString) -> Self {
        Self {
            domain: ErrorDomain::Stream,
            code,
            message: message.into(),
            debug: Some(debug.to_string()),
        }
    }
}

/// Test tone waveform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wave {
    Sine,
    Square,
    Silence,
}

impl std::str::FromStr for Wave {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sine" | "0" => Ok(Wave::Sine),
            "square" | "1" => Ok(Wave::Square),
            "silence" | "4" => Ok(Wave::Silence),
            _ => Err(()),
        }
    }
}

/// `audiotestsrc` properties
#[derive(Debug, Clone, PartialEq)]
pub struct ToneParams {
    pub frequency: f64,
    pub volume: f64,
    pub wave: Wave,
    /// `None` generates forever
    pub num_buffers: Option<u64>,
    pub samples_per_buffer: usize,
    pub rate: u32,
    pub channels: u16,
}

impl ToneParams {
    fn from_element(element: &ElementDesc) -> GraphResult<Self> {
        let num_buffers: i64 = element
            .parse_property("num-buffers", -1)
            .map_err(|v| invalid_property(element, "num-buffers", v))?;
        let params = Self {
            frequency: element
                .parse_property("freq", 440.0)
                .map_err(|v| invalid_property(element, "freq", v))?,
            volume: element
                .parse_property("volume", 0.8)
                .map_err(|v| invalid_property(element, "volume", v))?,
            wave: element
                .parse_property("wave", Wave::Sine)
                .map_err(|v| invalid_property(element, "wave", v))?,
            num_buffers: u64::try_from(num_buffers).ok(),
            samples_per_buffer: element
                .parse_property("samplesperbuffer", 1024)
                .map_err(|v| invalid_property(element, "samplesperbuffer", v))?,
            rate: element
                .parse_property("rate", 44100)
                .map_err(|v| invalid_property(element, "rate", v))?,
            channels: element
                .parse_property("channels", 2)
                .map_err(|v| invalid_property(element, "channels", v))?,
        };

        if params.samples_per_buffer == 0 {
            return Err(invalid_property(element, "samplesperbuffer", "0".to_string()));
        }
        if params.rate == 0 {
            return Err(invalid_property(element, "rate", "0".to_string()));
        }
        if params.channels == 0 {
            return Err(invalid_property(element, "channels", "0".to_string()));
        }
        Ok(params)
    }
}

fn invalid_property(element: &ElementDesc, property: &str, value: String) -> GraphError {
    GraphError::InvalidProperty {
        element: element.factory.clone(),
        property: property.to_string(),
        value,
    }
}

/// What the streaming thread opens at preroll
#[derive(Debug, Clone, PartialEq)]
pub enum SourceSpec {
    File(PathBuf),
    Tone(ToneParams),
}

impl SourceSpec {
    /// Check that this runtime can build `plan`
    pub fn resolve(plan: &DecodePlan) -> GraphResult<Self> {
        match plan {
            DecodePlan::Uri { uri, .. } => Self::from_uri(uri),
            DecodePlan::Description(chain) => Self::from_chain(chain),
        }
    }

    fn from_uri(uri: &Url) -> GraphResult<Self> {
        if uri.scheme() != "file" {
            return Err(GraphError::UnsupportedSource(format!(
                "{}:// sources are not supported",
                uri.scheme()
            )));
        }
        uri.to_file_path()
            .map(SourceSpec::File)
            .map_err(|()| GraphError::UnsupportedSource(uri.to_string()))
    }

    fn from_chain(chain: &ElementChain) -> GraphResult<Self> {
        let source = chain
            .first()
            .ok_or_else(|| GraphError::MissingElement(String::new()))?;

        for element in &chain.elements[1..] {
            if !PASSTHROUGH_ELEMENTS.contains(&element.factory.as_str()) {
                return Err(GraphError::MissingElement(element.factory.clone()));
            }
        }

        match source.factory.as_str() {
            "audiotestsrc" => ToneParams::from_element(source).map(SourceSpec::Tone),
            "filesrc" => source
                .property("location")
                .map(|location| SourceSpec::File(PathBuf::from(location)))
                .ok_or_else(|| invalid_property(source, "location", String::new())),
            "uridecodebin" => {
                let raw = source.property("uri").unwrap_or_default();
                let uri = Url::parse(raw)
                    .map_err(|_| invalid_property(source, "uri", raw.to_string()))?;
                Self::from_uri(&uri)
            }
            other => Err(GraphError::MissingElement(other.to_string())),
        }
    }

    pub fn open(&self) -> Result<Box<dyn DecodeSource>, SourceError> {
        match self {
            SourceSpec::File(path) => Ok(Box::new(SymphoniaSource::open(path)?)),
            SourceSpec::Tone(params) => Ok(Box::new(ToneSource::new(params.clone()))),
        }
    }
}

/// An opened decode stage
pub trait DecodeSource: Send {
    fn format(&self) -> FrameFormat;

    fn tags(&self) -> TagList;

    fn duration(&self) -> Option<Nanos>;

    /// Next decoded frame, `None` once drained
    fn next_frame(&mut self) -> Result<Option<AudioFrame>, SourceError>;

    /// Seek to `position`; returns where the source actually landed
    fn seek(&mut self, position: Nanos) -> Result<Nanos, SourceError>;
}

fn time_to_nanos(time: Time) -> Nanos {
    time.seconds
        .saturating_mul(1_000_000_000)
        .saturating_add((time.frac * 1e9) as u64)
}

/// File decoding through symphonia
pub struct SymphoniaSource {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    time_base: Option<TimeBase>,
    frame_format: FrameFormat,
    duration: Option<Nanos>,
    tags: TagList,
    next_pts: Nanos,
}

impl SymphoniaSource {
    pub fn open(path: &Path) -> Result<Self, SourceError> {
        if !path.exists() {
            return Err(SourceError::resource(
                resource_error::NOT_FOUND,
                format!("Could not open resource for reading: {}", path.display()),
            ));
        }
        let file = std::fs::File::open(path).map_err(|e| SourceError {
            debug: Some(e.to_string()),
            ..SourceError::resource(
                resource_error::OPEN_READ,
                format!("Could not open {}", path.display()),
            )
        })?;

        let mss = MediaSourceStream::new(Box::new(file), Default::default());
        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let mut probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| {
                SourceError::stream(
                    stream_error::TYPE_NOT_FOUND,
                    "Could not determine type of stream",
                    e,
                )
            })?;

        let mut tags = TagList::new();
        if let Some(metadata) = probed.metadata.get() {
            if let Some(revision) = metadata.current() {
                collect_tags(revision, &mut tags);
            }
        }
        let mut format = probed.format;
        if let Some(revision) = format.metadata().current() {
            collect_tags(revision, &mut tags);
        }

        let track = format.default_track().ok_or_else(|| {
            SourceError::stream(stream_error::WRONG_TYPE, "No audio track", path.display())
        })?;
        let track_id = track.id;
        let params = track.codec_params.clone();

        let sample_rate = params.sample_rate.unwrap_or(44100);
        let channels = params.channels.map(|c| c.count() as u16).unwrap_or(2);
        let time_base = params.time_base;
        let duration = match (time_base, params.n_frames) {
            (Some(tb), Some(n_frames)) => Some(time_to_nanos(tb.calc_time(n_frames))),
            (None, Some(n_frames)) => {
                Some(FrameFormat::new(sample_rate, channels).frames_to_nanos(n_frames as usize))
            }
            _ => None,
        };

        let decoder = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(|e| {
                SourceError::stream(stream_error::CODEC_NOT_FOUND, "No decoder available", e)
            })?;

        tracing::debug!(
            path = %path.display(),
            sample_rate,
            channels,
            duration_ns = ?duration,
            "Opened file source"
        );

        Ok(Self {
            format,
            decoder,
            track_id,
            time_base,
            frame_format: FrameFormat::new(sample_rate, channels),
            duration,
            tags,
            next_pts: 0,
        })
    }
}

fn collect_tags(revision: &MetadataRevision, tag_list: &mut TagList) {
    for tag in revision.tags() {
        let name = match tag.std_key {
            Some(StandardTagKey::TrackTitle) => tags::TITLE,
            Some(StandardTagKey::Artist) => tags::ARTIST,
            Some(StandardTagKey::Album) => tags::ALBUM,
            Some(StandardTagKey::Comment) => tags::COMMENT,
            Some(StandardTagKey::ReplayGainTrackGain) => tags::TRACK_GAIN,
            Some(StandardTagKey::ReplayGainTrackPeak) => tags::TRACK_PEAK,
            Some(StandardTagKey::ReplayGainAlbumGain) => tags::ALBUM_GAIN,
            Some(StandardTagKey::ReplayGainAlbumPeak) => tags::ALBUM_PEAK,
            _ => continue,
        };
        tag_list.insert(name, tag.value.to_string());
    }
}

impl DecodeSource for SymphoniaSource {
    fn format(&self) -> FrameFormat {
        self.frame_format
    }

    fn tags(&self) -> TagList {
        self.tags.clone()
    }

    fn duration(&self) -> Option<Nanos> {
        self.duration
    }

    fn next_frame(&mut self) -> Result<Option<AudioFrame>, SourceError> {
        loop {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(None);
                }
                Err(SymphoniaError::ResetRequired) => {
                    self.decoder.reset();
                    continue;
                }
                Err(e) => {
                    return Err(SourceError::stream(
                        stream_error::DEMUX,
                        "Could not read packet",
                        e,
                    ));
                }
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            let pts = self
                .time_base
                .map(|tb| time_to_nanos(tb.calc_time(packet.ts())))
                .unwrap_or(self.next_pts);

            let decoded = match self.decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(SymphoniaError::DecodeError(e)) => {
                    tracing::warn!(error = e, "Skipping undecodable packet");
                    continue;
                }
                Err(e) => {
                    return Err(SourceError::stream(
                        stream_error::DECODE,
                        "Could not decode stream",
                        e,
                    ));
                }
            };
            if decoded.frames() == 0 {
                continue;
            }

            let spec = *decoded.spec();
            let mut sample_buf = SampleBuffer::<f32>::new(decoded.frames() as u64, spec);
            sample_buf.copy_interleaved_ref(decoded);

            let format = FrameFormat::new(spec.rate, spec.channels.count() as u16);
            let frame = AudioFrame::new(sample_buf.samples().to_vec(), format, Some(pts));
            self.next_pts = pts + frame.duration;
            return Ok(Some(frame));
        }
    }

    fn seek(&mut self, position: Nanos) -> Result<Nanos, SourceError> {
        let position = self.duration.map_or(position, |d| position.min(d));
        let time = Time::new(
            position / 1_000_000_000,
            (position % 1_000_000_000) as f64 / 1e9,
        );

        let seeked = self
            .format
            .seek(
                SeekMode::Accurate,
                SeekTo::Time {
                    time,
                    track_id: Some(self.track_id),
                },
            )
            .map_err(|e| SourceError {
                debug: Some(e.to_string()),
                ..SourceError::resource(resource_error::SEEK, "Seek failed")
            })?;
        self.decoder.reset();

        let actual = self
            .time_base
            .map(|tb| time_to_nanos(tb.calc_time(seeked.actual_ts)))
            .unwrap_or(position);
        self.next_pts = actual;
        Ok(actual)
    }
}

/// `audiotestsrc`
pub struct ToneSource {
    params: ToneParams,
    format: FrameFormat,
    produced_frames: u64,
    buffers: u64,
}

impl ToneSource {
    pub fn new(params: ToneParams) -> Self {
        Self {
            format: FrameFormat::new(params.rate, params.channels),
            params,
            produced_frames: 0,
            buffers: 0,
        }
    }

    fn sample_at(&self, frame: u64) -> f32 {
        let t = frame as f64 / f64::from(self.params.rate);
        let phase = (t * self.params.frequency).fract();
        let value = match self.params.wave {
            Wave::Sine => (TAU * phase).sin(),
            Wave::Square => {
                if phase < 0.5 {
                    1.0
                } else {
                    -1.0
                }
            }
            Wave::Silence => 0.0,
        };
        (value * self.params.volume) as f32
    }
}

impl DecodeSource for ToneSource {
    fn format(&self) -> FrameFormat {
        self.format
    }

    fn tags(&self) -> TagList {
        TagList::new()
    }

    fn duration(&self) -> Option<Nanos> {
        self.params.num_buffers.map(|buffers| {
            self.format
                .frames_to_nanos(buffers as usize * self.params.samples_per_buffer)
        })
    }

    fn next_frame(&mut self) -> Result<Option<AudioFrame>, SourceError> {
        if self
            .params
            .num_buffers
            .is_some_and(|limit| self.buffers >= limit)
        {
            return Ok(None);
        }

        let channels = usize::from(self.params.channels);
        let frames = self.params.samples_per_buffer;
        let mut samples = Vec::with_capacity(frames * channels);
        for i in 0..frames as u64 {
            let value = self.sample_at(self.produced_frames + i);
            samples.extend(std::iter::repeat(value).take(channels));
        }

        let pts = self.format.frames_to_nanos(self.produced_frames as usize);
        self.produced_frames += frames as u64;
        self.buffers += 1;
        Ok(Some(AudioFrame::new(samples, self.format, Some(pts))))
    }

    fn seek(&mut self, position: Nanos) -> Result<Nanos, SourceError> {
        let frame = self.format.nanos_to_frames(position);
        let spb = self.params.samples_per_buffer as u64;
        self.buffers = frame / spb;
        self.produced_frames = self.buffers * spb;
        Ok(self.format.frames_to_nanos(self.produced_frames as usize))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(description: &str) -> GraphResult<SourceSpec> {
        SourceSpec::resolve(&DecodePlan::Description(
            ElementChain::parse(description).unwrap(),
        ))
    }

    #[test]
    fn audiotestsrc_properties_are_parsed() {
        match tone("audiotestsrc freq=1000 num-buffers=3 samplesperbuffer=100 wave=silence ! audioconvert").unwrap() {
            SourceSpec::Tone(params) => {
                assert_eq!(params.frequency, 1000.0);
                assert_eq!(params.num_buffers, Some(3));
                assert_eq!(params.wave, Wave::Silence);
            }
            other => panic!("unexpected spec {other:?}"),
        }
    }

    #[test]
    fn unknown_elements_are_missing() {
        assert!(matches!(
            tone("nosuchsrc ! audioconvert"),
            Err(GraphError::MissingElement(name)) if name == "nosuchsrc"
        ));
        assert!(matches!(
            tone("audiotestsrc ! flanger"),
            Err(GraphError::MissingElement(name)) if name == "flanger"
        ));
        assert!(matches!(
            tone("audiotestsrc freq=loud"),
            Err(GraphError::InvalidProperty { .. })
        ));
    }

    #[test]
    fn network_uris_are_unsupported() {
        let plan = DecodePlan::Uri {
            uri: Url::parse("http://example.com/a.mp3").unwrap(),
            source_device: None,
            buffer_duration_ns: 0,
            user_agent: String::new(),
        };
        assert!(matches!(
            SourceSpec::resolve(&plan),
            Err(GraphError::UnsupportedSource(_))
        ));
    }

    #[test]
    fn tone_source_counts_buffers_and_seeks() {
        let mut source = ToneSource::new(ToneParams {
            frequency: 440.0,
            volume: 0.5,
            wave: Wave::Sine,
            num_buffers: Some(2),
            samples_per_buffer: 441,
            rate: 44100,
            channels: 2,
        });
        assert_eq!(source.duration(), Some(20_000_000));

        let first = source.next_frame().unwrap().unwrap();
        assert_eq!(first.pts, Some(0));
        assert_eq!(first.frame_count(), 441);
        assert!(first.samples.iter().all(|s| s.abs() <= 0.5));

        let second = source.next_frame().unwrap().unwrap();
        assert_eq!(second.pts, Some(10_000_000));
        assert!(source.next_frame().unwrap().is_none());

        assert_eq!(source.seek(10_000_000).unwrap(), 10_000_000);
        assert!(source.next_frame().unwrap().is_some());
    }

    #[test]
    fn missing_file_is_resource_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = SymphoniaSource::open(&dir.path().join("absent.flac"))
            .err()
            .unwrap();
        assert_eq!(err.domain, ErrorDomain::Resource);
        assert_eq!(err.code, resource_error::NOT_FOUND);
    }
}
