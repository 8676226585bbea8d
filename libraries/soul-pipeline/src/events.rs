//! Pipeline Events
//!
//! Outbound notifications delivered to the owning engine. Events are
//! produced on the control context while it pumps the controller
//! (`poll`, `dispatch_pending`, `wait_and_dispatch`) and are read from the
//! receiver returned by `PipelineController::events()`:
//! - End of stream (with or without a gapless follow-up)
//! - Metadata found in the stream
//! - Unrecoverable errors (at most one per instance)
//! - Fader completion

use crate::types::{MetaBundle, PipelineId};
use serde::{Deserialize, Serialize};

/// Events emitted by a pipeline controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PipelineEvent {
    /// The current source ended
    ///
    /// `has_next_track` is true when playback already continued into the
    /// staged next source without a gap.
    EndOfStreamReached {
        pipeline_id: PipelineId,
        has_next_track: bool,
    },

    /// Tags were found in the current stream
    MetadataFound {
        pipeline_id: PipelineId,
        bundle: MetaBundle,
    },

    /// The instance hit an unrecoverable error and is no longer valid
    ///
    /// Message, domain and code are carried verbatim from the runtime.
    Error {
        pipeline_id: PipelineId,
        message: String,
        domain: i32,
        code: i32,
    },

    /// A fade ran to completion
    FaderFinished { pipeline_id: PipelineId },
}

impl PipelineEvent {
    /// Id of the pipeline that produced this event
    pub fn pipeline_id(&self) -> PipelineId {
        match self {
            PipelineEvent::EndOfStreamReached { pipeline_id, .. }
            | PipelineEvent::MetadataFound { pipeline_id, .. }
            | PipelineEvent::Error { pipeline_id, .. }
            | PipelineEvent::FaderFinished { pipeline_id } => *pipeline_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_pipeline_id() {
        let id = PipelineId::next();
        let event = PipelineEvent::EndOfStreamReached {
            pipeline_id: id,
            has_next_track: true,
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: PipelineEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.pipeline_id(), id);
        assert_eq!(back, event);
    }
}
