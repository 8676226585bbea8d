//! Software graph runtime
//!
//! A [`GraphRuntime`] that needs no external media framework: symphonia for
//! decoding, rubato for resampling and cpal for output (with the `desktop`
//! feature). Each graph runs its own streaming thread; the [`MediaGraph`]
//! handle forwards commands to it over a bounded channel.
//!
//! Supported decode stages:
//! - `file://` URIs and `filesrc location=... ! decodebin`
//! - `uridecodebin uri=file://...`
//! - `audiotestsrc` with `freq`, `volume`, `wave`, `num-buffers`,
//!   `samplesperbuffer`, `rate` and `channels`
//!
//! Supported sinks: `fakesink`, plus `autoaudiosink`/`cpalsink` with the
//! `desktop` feature.

pub mod dsp;
pub mod resample;
pub mod sink;
pub mod source;
mod streaming;

use crate::config::{PipelineSettings, ResamplerSettings};
use crate::error::{GraphError, GraphResult};
use crate::graph::handle::StateChangeHandle;
use crate::graph::{AudioChainPlan, DecodePlan, GraphHooks, GraphRuntime, MediaGraph, StageUpdate};
use crate::types::{DecodeStageId, FrameFormat, GraphState, Nanos, StateChangeReturn, StateQuery};
use crossbeam_channel::{bounded, Sender};
use sink::SinkKind;
use source::SourceSpec;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use streaming::{Command, Streamer, StreamingConfig};

/// Longest a control call waits for the streaming thread to answer
const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

const UNKNOWN: u64 = u64::MAX;

/// Graph runtime backed by symphonia, rubato and cpal
#[derive(Debug, Clone)]
pub struct SoftwareRuntime {
    output: FrameFormat,
    resampler: ResamplerSettings,
    drain_grace: Duration,
}

impl SoftwareRuntime {
    pub fn new(settings: &PipelineSettings) -> Self {
        Self {
            output: FrameFormat::new(settings.output.sample_rate, settings.output.channels),
            resampler: settings.resampler.clone(),
            drain_grace: settings.drain_grace(),
        }
    }
}

impl GraphRuntime for SoftwareRuntime {
    fn name(&self) -> &str {
        "software"
    }

    fn create_graph(
        &self,
        chain: &AudioChainPlan,
        hooks: GraphHooks,
    ) -> GraphResult<Box<dyn MediaGraph>> {
        let (element, device) = chain
            .sink()
            .ok_or_else(|| GraphError::MissingElement("sink".to_string()))?;
        let config = StreamingConfig {
            sink: SinkKind::resolve(element)?,
            device: device.map(str::to_string),
            output: self.output,
            resampler: self.resampler.clone(),
            drain_grace: self.drain_grace,
        };

        tracing::debug!(
            elements = ?chain.element_names(),
            sink = element,
            "Creating software graph"
        );
        Ok(Box::new(SoftwareGraph::spawn(config, chain, hooks)?))
    }
}

#[derive(Debug, Clone, Copy)]
struct StateSnapshot {
    current: GraphState,
    pending: GraphState,
    result: StateChangeReturn,
}

/// State published by the streaming thread for bounded queries
pub(crate) struct GraphShared {
    snapshot: Mutex<StateSnapshot>,
    settled: Condvar,
    position: AtomicU64,
    duration: AtomicU64,
}

impl GraphShared {
    fn new() -> Self {
        Self {
            snapshot: Mutex::new(StateSnapshot {
                current: GraphState::Null,
                pending: GraphState::VoidPending,
                result: StateChangeReturn::Success,
            }),
            settled: Condvar::new(),
            position: AtomicU64::new(UNKNOWN),
            duration: AtomicU64::new(UNKNOWN),
        }
    }

    pub(crate) fn publish(
        &self,
        current: GraphState,
        pending: GraphState,
        result: StateChangeReturn,
    ) {
        if let Ok(mut snapshot) = self.snapshot.lock() {
            *snapshot = StateSnapshot {
                current,
                pending,
                result,
            };
        }
        self.settled.notify_all();
    }

    pub(crate) fn set_position(&self, position: Option<Nanos>) {
        self.position.store(position.unwrap_or(UNKNOWN), Ordering::Release);
    }

    pub(crate) fn set_duration(&self, duration: Option<Nanos>) {
        self.duration.store(duration.unwrap_or(UNKNOWN), Ordering::Release);
    }

    fn query(&self, timeout: Duration) -> StateQuery {
        let failed = StateQuery {
            result: StateChangeReturn::Failure,
            current: GraphState::Null,
            pending: GraphState::VoidPending,
        };
        let Ok(guard) = self.snapshot.lock() else {
            return failed;
        };
        let Ok((snapshot, _)) = self
            .settled
            .wait_timeout_while(guard, timeout, |s| s.pending != GraphState::VoidPending)
        else {
            return failed;
        };

        let result = match snapshot.result {
            StateChangeReturn::Failure => StateChangeReturn::Failure,
            _ if snapshot.pending != GraphState::VoidPending => StateChangeReturn::Async,
            _ => StateChangeReturn::Success,
        };
        StateQuery {
            result,
            current: snapshot.current,
            pending: snapshot.pending,
        }
    }
}

fn load(value: &AtomicU64) -> Option<Nanos> {
    match value.load(Ordering::Acquire) {
        UNKNOWN => None,
        nanos => Some(nanos),
    }
}

/// Handle to a graph running on its own streaming thread
pub struct SoftwareGraph {
    commands: Sender<Command>,
    shared: Arc<GraphShared>,
    thread: Option<JoinHandle<()>>,
}

impl SoftwareGraph {
    fn spawn(
        config: StreamingConfig,
        chain: &AudioChainPlan,
        hooks: GraphHooks,
    ) -> GraphResult<Self> {
        let shared = Arc::new(GraphShared::new());
        let (commands, command_rx) = bounded::<Command>(32);
        let streamer = Streamer::new(config, chain, hooks, Arc::clone(&shared), command_rx);

        let thread = thread::Builder::new()
            .name("soul-pipeline-stream".to_string())
            .spawn(move || streamer.run())?;

        Ok(Self {
            commands,
            shared,
            thread: Some(thread),
        })
    }

    fn send(&self, command: Command) -> GraphResult<()> {
        self.commands
            .send_timeout(command, REPLY_TIMEOUT)
            .map_err(|_| GraphError::Shutdown)
    }
}

impl MediaGraph for SoftwareGraph {
    fn attach_decode_stage(&mut self, stage: DecodeStageId, plan: &DecodePlan) -> GraphResult<()> {
        let spec = SourceSpec::resolve(plan)?;
        self.send(Command::AttachDecode { stage, spec })
    }

    fn request_state(&mut self, target: GraphState) -> StateChangeHandle {
        if target == GraphState::VoidPending {
            return StateChangeHandle::ready(target, StateChangeReturn::Failure);
        }
        let (handle, resolver) = StateChangeHandle::pending(target);
        if self.send(Command::SetState { target, resolver }).is_err() {
            tracing::warn!(?target, "Streaming thread gone; state request dropped");
        }
        handle
    }

    fn query_state(&self, timeout: Duration) -> StateQuery {
        self.shared.query(timeout)
    }

    fn seek(&mut self, position: Nanos) -> bool {
        let (reply, answer) = bounded(1);
        if self.send(Command::Seek { position, reply }).is_err() {
            return false;
        }
        answer.recv_timeout(REPLY_TIMEOUT).unwrap_or(false)
    }

    fn position(&self) -> Option<Nanos> {
        load(&self.shared.position)
    }

    fn duration(&self) -> Option<Nanos> {
        load(&self.shared.duration)
    }

    fn apply(&mut self, update: StageUpdate) -> GraphResult<()> {
        let (reply, answer) = bounded(1);
        self.send(Command::Update { update, reply })?;
        answer
            .recv_timeout(REPLY_TIMEOUT)
            .map_err(|_| GraphError::Shutdown)?
    }
}

impl Drop for SoftwareGraph {
    fn drop(&mut self) {
        let started = Instant::now();
        let _ = self.commands.send_timeout(Command::Shutdown, REPLY_TIMEOUT);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("Streaming thread panicked");
            }
        }
        tracing::trace!(elapsed = ?started.elapsed(), "Software graph dropped");
    }
}

impl std::fmt::Debug for SoftwareGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareGraph")
            .field("position", &self.position())
            .field("duration", &self.duration())
            .finish()
    }
}
