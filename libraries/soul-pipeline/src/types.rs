//! Core types shared across the pipeline crate

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Stream time in nanoseconds
pub type Nanos = u64;

/// Convert a stream time to a `Duration`
pub fn nanos_to_duration(nanos: Nanos) -> Duration {
    Duration::from_nanos(nanos)
}

/// Convert a `Duration` to stream time, saturating at `u64::MAX`
pub fn duration_to_nanos(duration: Duration) -> Nanos {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

static NEXT_PIPELINE_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_DECODE_STAGE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique pipeline identifier
///
/// Ids are never reused, so a late-arriving message can always be matched to
/// the instance that produced it (or to none, if that instance is gone).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PipelineId(u64);

impl PipelineId {
    /// Issue the next id
    pub fn next() -> Self {
        Self(NEXT_PIPELINE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PipelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pipeline-{}", self.0)
    }
}

/// Identifier of one decode stage instance inside a graph
///
/// A new id is issued every time the decode stage is replaced. Messages
/// stamped with an id other than the current one are stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DecodeStageId(u64);

impl DecodeStageId {
    pub fn next() -> Self {
        Self(NEXT_DECODE_STAGE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn from_u64(raw: u64) -> Self {
        Self(raw)
    }
}

/// Graph state as reported by the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum GraphState {
    /// No pending transition
    VoidPending,
    #[default]
    Null,
    Ready,
    Paused,
    Playing,
}

impl GraphState {
    /// States in which the graph has prerolled and accepts seeks
    pub fn is_prerolled(self) -> bool {
        matches!(self, GraphState::Paused | GraphState::Playing)
    }

    pub(crate) fn rank(self) -> u8 {
        match self {
            GraphState::VoidPending | GraphState::Null => 0,
            GraphState::Ready => 1,
            GraphState::Paused => 2,
            GraphState::Playing => 3,
        }
    }

    pub(crate) fn from_rank(rank: u8) -> Self {
        match rank {
            0 => GraphState::Null,
            1 => GraphState::Ready,
            2 => GraphState::Paused,
            _ => GraphState::Playing,
        }
    }

    /// Next state one step towards `target`, or `None` when already there
    pub(crate) fn step_towards(self, target: GraphState) -> Option<GraphState> {
        let (from, to) = (self.rank(), target.rank());
        match from.cmp(&to) {
            std::cmp::Ordering::Less => Some(GraphState::from_rank(from + 1)),
            std::cmp::Ordering::Greater => Some(GraphState::from_rank(from - 1)),
            std::cmp::Ordering::Equal => None,
        }
    }
}

/// Outcome of a state change request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateChangeReturn {
    Failure,
    Success,
    /// The transition continues in the background
    Async,
    /// Success, but the graph cannot preroll (live source)
    NoPreroll,
}

impl StateChangeReturn {
    pub fn is_success(self) -> bool {
        matches!(self, StateChangeReturn::Success | StateChangeReturn::NoPreroll)
    }
}

/// Result of a bounded state query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateQuery {
    pub result: StateChangeReturn,
    pub current: GraphState,
    pub pending: GraphState,
}

/// Controller lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineLifecycle {
    /// No successful `Init` yet
    Unbuilt,
    /// Graph built, decode output not connected yet
    Initialized,
    /// Decode output connected, graph not prerolled
    Linked,
    Ready,
    Paused,
    Playing,
    /// Latched after an unrecoverable error
    Invalid,
    /// Torn down
    Null,
}

/// Metadata extracted from a tag message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaBundle {
    pub title: String,
    pub artist: String,
    pub album: String,
    pub comment: String,
}

impl MetaBundle {
    pub fn is_empty(&self) -> bool {
        self.title.is_empty()
            && self.artist.is_empty()
            && self.album.is_empty()
            && self.comment.is_empty()
    }
}

/// Error domains reported with stream errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorDomain {
    Core,
    Library,
    Resource,
    Stream,
}

impl ErrorDomain {
    /// Numeric domain code carried in notifications
    pub fn code(self) -> i32 {
        match self {
            ErrorDomain::Core => 1,
            ErrorDomain::Library => 2,
            ErrorDomain::Resource => 3,
            ErrorDomain::Stream => 4,
        }
    }
}

/// Core domain error codes
pub mod core_error {
    pub const FAILED: i32 = 1;
    pub const NOT_IMPLEMENTED: i32 = 3;
    pub const STATE_CHANGE: i32 = 4;
    pub const PAD: i32 = 5;
    pub const NEGOTIATION: i32 = 7;
    pub const MISSING_PLUGIN: i32 = 12;
}

/// Resource domain error codes
pub mod resource_error {
    pub const FAILED: i32 = 1;
    pub const NOT_FOUND: i32 = 3;
    pub const BUSY: i32 = 4;
    pub const OPEN_READ: i32 = 5;
    pub const OPEN_WRITE: i32 = 6;
    pub const READ: i32 = 9;
    pub const WRITE: i32 = 10;
    pub const SEEK: i32 = 11;
}

/// Stream domain error codes
pub mod stream_error {
    pub const FAILED: i32 = 1;
    pub const TYPE_NOT_FOUND: i32 = 4;
    pub const WRONG_TYPE: i32 = 5;
    pub const CODEC_NOT_FOUND: i32 = 6;
    pub const DECODE: i32 = 7;
    pub const DEMUX: i32 = 9;
    pub const FORMAT: i32 = 11;
}

/// Layout of the samples in an [`AudioFrame`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl FrameFormat {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    /// Duration of `frames` frames at this rate
    pub fn frames_to_nanos(&self, frames: usize) -> Nanos {
        if self.sample_rate == 0 {
            return 0;
        }
        (frames as u128 * 1_000_000_000 / u128::from(self.sample_rate)) as Nanos
    }

    /// Frame count covering `nanos` at this rate
    pub fn nanos_to_frames(&self, nanos: Nanos) -> u64 {
        (u128::from(nanos) * u128::from(self.sample_rate) / 1_000_000_000) as u64
    }
}

/// One buffer of decoded audio
///
/// Samples are interleaved `f32`. The sample storage is shared, so handing a
/// frame to several consumers never copies audio.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub samples: Arc<[f32]>,
    pub format: FrameFormat,
    /// Stream time of the first sample
    pub pts: Option<Nanos>,
    pub duration: Nanos,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, format: FrameFormat, pts: Option<Nanos>) -> Self {
        let frames = samples.len() / usize::from(format.channels.max(1));
        let duration = format.frames_to_nanos(frames);
        Self {
            samples: samples.into(),
            format,
            pts,
            duration,
        }
    }

    pub fn frame_count(&self) -> usize {
        self.samples.len() / usize::from(self.format.channels.max(1))
    }
}
