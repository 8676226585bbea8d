//! Media graph abstraction
//!
//! The controller never touches audio itself. It drives a graph through two
//! traits:
//!
//! - [`GraphRuntime`] instantiates a graph from an [`AudioChainPlan`] and the
//!   [`GraphHooks`] bound to the owning controller
//! - [`MediaGraph`] is one live graph: decode stage attachment, state
//!   requests, seeking, queries and live stage updates
//!
//! # Execution contexts
//!
//! A runtime owns a streaming context. From there it may only:
//! - call the [`StreamProbe`] in the hooks for every decoded frame and segment
//! - send [`GraphMessage`]s on the hook's bus sender
//! - read the [`DrainGate`]
//!
//! Everything else (state, flags, notifications) belongs to the control
//! context, which drains the bus channel.
//!
//! # Stage order
//!
//! ```text
//! decode → queue → convert → rgvolume → rglimiter → convert
//!        → eq preamp → equalizer → volume → resample → sink
//! ```

pub mod builder;
pub mod description;
pub mod handle;

use crate::effects::replaygain::ReplayGainMode;
use crate::error::GraphResult;
use crate::probe::StreamProbe;
use crate::types::{
    DecodeStageId, ErrorDomain, FrameFormat, GraphState, Nanos, StateQuery,
};
use crossbeam_channel::Sender;
use description::ElementChain;
use handle::StateChangeHandle;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

pub use builder::GraphBuilder;

/// Factory for media graphs
pub trait GraphRuntime: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Instantiate the effects chain and sink
    ///
    /// The hooks are registered exactly once, here; the graph keeps them for
    /// its whole lifetime. The decode stage is attached separately.
    fn create_graph(
        &self,
        chain: &AudioChainPlan,
        hooks: GraphHooks,
    ) -> GraphResult<Box<dyn MediaGraph>>;
}

/// One live media graph
pub trait MediaGraph: Send {
    /// Attach a decode stage, replacing the current one if present
    ///
    /// The new stage is brought to the graph's current state. Its output is
    /// linked asynchronously and announced with [`GraphMessage::DecodeLinked`].
    /// Unknown elements or unsupported sources fail synchronously.
    fn attach_decode_stage(&mut self, stage: DecodeStageId, plan: &DecodePlan) -> GraphResult<()>;

    /// Request a state transition without blocking
    fn request_state(&mut self, target: GraphState) -> StateChangeHandle;

    /// Current and pending state, waiting at most `timeout` for a transition
    /// in flight to settle
    fn query_state(&self, timeout: Duration) -> StateQuery;

    /// Flushing seek to `position` stream time; `false` if not accepted
    fn seek(&mut self, position: Nanos) -> bool;

    fn position(&self) -> Option<Nanos>;

    fn duration(&self) -> Option<Nanos>;

    /// Push new parameters into a running stage
    fn apply(&mut self, update: StageUpdate) -> GraphResult<()>;
}

/// Handlers bound to a controller, handed to the runtime at graph creation
#[derive(Clone)]
pub struct GraphHooks {
    pub bus: Sender<GraphMessage>,
    pub probe: Arc<StreamProbe>,
    pub drain_gate: DrainGate,
}

/// Set by the control context while a gapless follow-up is staged
///
/// When held, a drained decode stage waits briefly for its replacement
/// instead of ending the stream.
#[derive(Debug, Clone, Default)]
pub struct DrainGate(Arc<AtomicBool>);

impl DrainGate {
    pub fn hold(&self, held: bool) {
        self.0.store(held, Ordering::Release);
    }

    pub fn is_held(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Decode stage description
#[derive(Debug, Clone, PartialEq)]
pub enum DecodePlan {
    /// Generic file/network decode stage
    Uri {
        uri: Url,
        /// Device for device-backed sources
        source_device: Option<String>,
        buffer_duration_ns: u64,
        user_agent: String,
    },
    /// Raw element chain
    Description(ElementChain),
}

impl DecodePlan {
    pub fn uri(&self) -> Option<&Url> {
        match self {
            DecodePlan::Uri { uri, .. } => Some(uri),
            DecodePlan::Description(_) => None,
        }
    }
}

/// One equalizer band
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EqBand {
    pub frequency: f32,
    pub bandwidth: f32,
    pub gain_db: f32,
}

/// A stage of the effects chain with its initial parameters
#[derive(Debug, Clone, PartialEq)]
pub enum StageSpec {
    Queue {
        max_size_time_ns: u64,
        use_buffering: bool,
        low_percent: u32,
    },
    Convert,
    ReplayGainVolume {
        mode: ReplayGainMode,
        preamp_db: f64,
    },
    ReplayGainLimiter {
        enabled: bool,
    },
    EqualizerPreamp {
        volume: f64,
    },
    Equalizer {
        bands: Vec<EqBand>,
    },
    Volume {
        volume: f64,
    },
    Resample,
    Sink {
        element: String,
        device: Option<String>,
    },
}

impl StageSpec {
    /// Element name as it appears in logs
    pub fn element_name(&self) -> &'static str {
        match self {
            StageSpec::Queue { .. } => "queue",
            StageSpec::Convert => "audioconvert",
            StageSpec::ReplayGainVolume { .. } => "rgvolume",
            StageSpec::ReplayGainLimiter { .. } => "rglimiter",
            StageSpec::EqualizerPreamp { .. } => "eq-preamp",
            StageSpec::Equalizer { .. } => "equalizer",
            StageSpec::Volume { .. } => "volume",
            StageSpec::Resample => "audioresample",
            StageSpec::Sink { .. } => "sink",
        }
    }
}

/// The processing chain between the decode stage and the sink (inclusive)
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChainPlan {
    pub stages: Vec<StageSpec>,
}

impl AudioChainPlan {
    pub fn sink(&self) -> Option<(&str, Option<&str>)> {
        self.stages.iter().find_map(|stage| match stage {
            StageSpec::Sink { element, device } => Some((element.as_str(), device.as_deref())),
            _ => None,
        })
    }

    pub fn has_replaygain(&self) -> bool {
        self.stages
            .iter()
            .any(|s| matches!(s, StageSpec::ReplayGainVolume { .. }))
    }

    pub fn element_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(StageSpec::element_name).collect()
    }
}

/// Live parameter change for a running stage
#[derive(Debug, Clone, PartialEq)]
pub enum StageUpdate {
    Volume(f64),
    EqualizerPreamp(f64),
    /// Gains in dB, one per band in plan order
    EqualizerGains(Vec<f32>),
    ReplayGain {
        mode: ReplayGainMode,
        preamp_db: f64,
    },
    Limiter(bool),
}

/// Origin of a bus message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageSource {
    /// The graph itself
    Pipeline,
    /// A decode stage instance
    Decode(DecodeStageId),
    /// Any other element, by name
    Element(String),
}

/// Tag names understood by the dispatcher
pub mod tags {
    pub const TITLE: &str = "title";
    pub const ARTIST: &str = "artist";
    pub const ALBUM: &str = "album";
    pub const COMMENT: &str = "comment";
    pub const TRACK_GAIN: &str = "replaygain-track-gain";
    pub const TRACK_PEAK: &str = "replaygain-track-peak";
    pub const ALBUM_GAIN: &str = "replaygain-album-gain";
    pub const ALBUM_PEAK: &str = "replaygain-album-peak";
}

/// Ordered tag list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagList(Vec<(String, String)>);

impl TagList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        self.0.push((name.to_string(), value.into()));
    }

    /// First value for `name`
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Named field set carried by element messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Structure {
    pub name: String,
    pub fields: Vec<(String, String)>,
}

impl Structure {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, key: &str, value: impl Into<String>) -> Self {
        self.fields.push((key.to_string(), value.into()));
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Asynchronous message posted by the graph runtime
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    pub source: MessageSource,
    pub body: BusMessageBody,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BusMessageBody {
    Tag(TagList),
    Error {
        message: String,
        debug: Option<String>,
        domain: ErrorDomain,
        code: i32,
    },
    Element(Structure),
    StateChanged {
        old: GraphState,
        new: GraphState,
        pending: GraphState,
    },
    Eos,
}

impl BusMessage {
    pub fn new(source: MessageSource, body: BusMessageBody) -> Self {
        Self { source, body }
    }

    pub fn state_changed(old: GraphState, new: GraphState, pending: GraphState) -> Self {
        Self::new(
            MessageSource::Pipeline,
            BusMessageBody::StateChanged { old, new, pending },
        )
    }

    pub fn error(
        source: MessageSource,
        domain: ErrorDomain,
        code: i32,
        message: impl Into<String>,
        debug: Option<String>,
    ) -> Self {
        Self::new(
            source,
            BusMessageBody::Error {
                message: message.into(),
                debug,
                domain,
                code,
            },
        )
    }
}

/// Everything a graph reports to its controller
#[derive(Debug, Clone, PartialEq)]
pub enum GraphMessage {
    Bus(BusMessage),
    /// Decode output connected to the effects chain
    DecodeLinked {
        stage: DecodeStageId,
        format: FrameFormat,
    },
    /// Decode output could not be connected
    LinkFailed { stage: DecodeStageId, reason: String },
    /// The decode stage produced its last frame
    Drained { stage: DecodeStageId },
    /// A frame crossed the configured end offset
    EndOffsetReached { stage: DecodeStageId, generation: u64 },
    /// First segment of a decode stage began at `start`
    SegmentStarted { stage: DecodeStageId, start: Nanos },
}

impl From<BusMessage> for GraphMessage {
    fn from(message: BusMessage) -> Self {
        GraphMessage::Bus(message)
    }
}
