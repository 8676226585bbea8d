//! State tracking and seek gating
//!
//! [`StateController`] remembers what the graph reported, not what was
//! requested: `initialized` follows pipeline-level state changes (prerolled
//! means `Paused` or `Playing`), `linked` follows decode-stage linking.
//! A seek is only forwarded to the graph once both hold; before that it is
//! kept as the single pending seek and replayed when they do.

use crate::graph::handle::StateChangeHandle;
use crate::graph::MediaGraph;
use crate::types::{GraphState, Nanos, PipelineLifecycle, StateChangeReturn};
use std::time::Duration;

/// What happened to a seek request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekOutcome {
    /// Swallowed by the one-shot suppression after a decode replacement
    Suppressed,
    /// Stored until the graph is linked and prerolled
    Queued,
    /// Forwarded to the graph; carries its answer
    Issued(bool),
}

impl SeekOutcome {
    /// Value reported to the caller of `seek`
    pub fn accepted(self) -> bool {
        match self {
            SeekOutcome::Suppressed | SeekOutcome::Queued => true,
            SeekOutcome::Issued(accepted) => accepted,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StateController {
    initialized: bool,
    linked: bool,
    pending_seek: Option<Nanos>,
    ignore_next_seek: bool,
    last_state: GraphState,
    requested: Option<GraphState>,
    timeout: Duration,
}

impl StateController {
    pub fn new(timeout: Duration) -> Self {
        Self {
            initialized: false,
            linked: false,
            pending_seek: None,
            ignore_next_seek: false,
            last_state: GraphState::Null,
            requested: None,
            timeout,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_linked(&self) -> bool {
        self.linked
    }

    pub fn pending_seek(&self) -> Option<Nanos> {
        self.pending_seek
    }

    pub fn requested_target(&self) -> Option<GraphState> {
        self.requested
    }

    /// Ask the graph for `target` and remember it
    pub fn request(&mut self, graph: &mut dyn MediaGraph, target: GraphState) -> StateChangeHandle {
        self.requested = Some(target);
        tracing::debug!(?target, "Requesting state");
        graph.request_state(target)
    }

    /// Answer for requests that cannot reach a graph
    pub fn refuse(target: GraphState) -> StateChangeHandle {
        StateChangeHandle::ready(target, StateChangeReturn::Failure)
    }

    /// Swallow the next call to [`seek`](Self::seek)
    pub fn suppress_next_seek(&mut self) {
        self.ignore_next_seek = true;
    }

    /// Decode replacement finished; seeks reach the graph again
    pub fn clear_seek_suppression(&mut self) {
        self.ignore_next_seek = false;
    }

    pub fn is_seek_suppressed(&self) -> bool {
        self.ignore_next_seek
    }

    /// Seek now, later, or not at all
    pub fn seek(&mut self, graph: &mut dyn MediaGraph, position: Nanos) -> SeekOutcome {
        if self.ignore_next_seek {
            self.ignore_next_seek = false;
            tracing::debug!(position, "Seek suppressed after decode replacement");
            return SeekOutcome::Suppressed;
        }

        if !self.linked || !self.initialized {
            if let Some(previous) = self.pending_seek.replace(position) {
                tracing::debug!(previous, position, "Replacing pending seek");
            } else {
                tracing::debug!(position, "Queueing seek until linked");
            }
            return SeekOutcome::Queued;
        }

        self.pending_seek = None;
        SeekOutcome::Issued(graph.seek(position))
    }

    /// Store a seek to replay once linked, bypassing suppression
    pub fn queue_seek(&mut self, position: Nanos) {
        self.pending_seek = Some(position);
    }

    /// Decode output is connected
    pub fn on_linked(&mut self, graph: &mut dyn MediaGraph) {
        self.linked = true;
        self.replay_pending(graph);
    }

    /// Pipeline-level state change reported on the bus
    pub fn on_state(&mut self, graph: &mut dyn MediaGraph, state: GraphState) {
        self.last_state = state;
        self.initialized = state.is_prerolled();
        self.replay_pending(graph);
    }

    fn replay_pending(&mut self, graph: &mut dyn MediaGraph) {
        if !self.linked || !self.initialized {
            return;
        }
        if let Some(position) = self.pending_seek.take() {
            let accepted = graph.seek(position);
            tracing::debug!(position, accepted, "Replayed pending seek");
        }
    }

    /// Forget link and preroll state before a new graph is built
    pub fn reset_for_rebuild(&mut self) {
        self.initialized = false;
        self.linked = false;
        self.last_state = GraphState::Null;
    }

    /// Decode output was swapped on a live graph
    pub fn unlink(&mut self) {
        self.linked = false;
    }

    /// Bounded state query; `Null` on failure, last known state on timeout
    pub fn current_state(&self, graph: Option<&dyn MediaGraph>) -> GraphState {
        let Some(graph) = graph else {
            return GraphState::Null;
        };
        let query = graph.query_state(self.timeout);
        match query.result {
            StateChangeReturn::Failure => GraphState::Null,
            StateChangeReturn::Async => self.last_state,
            StateChangeReturn::Success | StateChangeReturn::NoPreroll => query.current,
        }
    }

    pub fn lifecycle(&self, built: bool, valid: bool, torn_down: bool) -> PipelineLifecycle {
        if torn_down {
            return PipelineLifecycle::Null;
        }
        if !valid {
            return PipelineLifecycle::Invalid;
        }
        if !built {
            return PipelineLifecycle::Unbuilt;
        }
        if !self.linked {
            return PipelineLifecycle::Initialized;
        }
        match self.last_state {
            GraphState::Ready => PipelineLifecycle::Ready,
            GraphState::Paused => PipelineLifecycle::Paused,
            GraphState::Playing => PipelineLifecycle::Playing,
            GraphState::Null | GraphState::VoidPending => PipelineLifecycle::Linked,
        }
    }
}
