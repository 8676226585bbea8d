//! Streaming thread of a [`SoftwareGraph`](super::SoftwareGraph)
//!
//! Owns the decode source, effects chain, resampler and sink. Talks to the
//! control context only through the command channel, the shared state
//! snapshot and the hooks' bus sender.
//!
//! State steps one at a time towards the requested target:
//!
//! | Step | Work |
//! |------|------|
//! | Null → Ready | open the sink |
//! | Ready → Paused | open the decode source (preroll), announce link and tags |
//! | Paused → Playing | start the sink |
//! | Playing → Paused | pause the sink |
//! | Paused → Ready | drop the source, flush queued audio |
//! | Ready → Null | close the sink |

use super::dsp::{map_channels, EffectsChain};
use super::resample::ChainResampler;
use super::sink::{AudioSink, SinkKind};
use super::source::{DecodeSource, SourceError, SourceSpec};
use super::GraphShared;
use crate::config::ResamplerSettings;
use crate::effects::replaygain::StoredGain;
use crate::error::GraphResult;
use crate::graph::handle::StateChangeResolver;
use crate::graph::{
    AudioChainPlan, BusMessage, BusMessageBody, GraphHooks, GraphMessage, MessageSource,
    StageUpdate,
};
use crate::probe::ProbeVerdict;
use crate::types::{
    core_error, resource_error, AudioFrame, DecodeStageId, ErrorDomain, FrameFormat, GraphState,
    Nanos, StateChangeReturn,
};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Frames rendered per wakeup before commands are checked again
const MAX_FRAMES_PER_PUMP: usize = 16;

/// Poll interval while a drained stage waits for its replacement
const DRAIN_POLL: Duration = Duration::from_millis(10);

pub(crate) enum Command {
    SetState {
        target: GraphState,
        resolver: StateChangeResolver,
    },
    AttachDecode {
        stage: DecodeStageId,
        spec: SourceSpec,
    },
    Seek {
        position: Nanos,
        reply: Sender<bool>,
    },
    Update {
        update: StageUpdate,
        reply: Sender<GraphResult<()>>,
    },
    Shutdown,
}

#[derive(Debug, Clone)]
pub(crate) struct StreamingConfig {
    pub sink: SinkKind,
    pub device: Option<String>,
    pub output: FrameFormat,
    pub resampler: ResamplerSettings,
    pub drain_grace: Duration,
}

struct DecodeStage {
    id: DecodeStageId,
    spec: SourceSpec,
    source: Option<Box<dyn DecodeSource>>,
    drained: bool,
}

enum Wake {
    Command(Command),
    Timeout,
    Disconnected,
}

pub(crate) struct Streamer {
    config: StreamingConfig,
    hooks: GraphHooks,
    shared: Arc<GraphShared>,
    commands: Receiver<Command>,

    current: GraphState,
    target: GraphState,
    resolver: Option<StateChangeResolver>,

    chain: EffectsChain,
    resampler: Option<ChainResampler>,
    sink: Option<Box<dyn AudioSink>>,
    stage: Option<DecodeStage>,

    /// Stream time at the end of the last rendered frame
    rendered_end: Option<Nanos>,
    /// Waiting for a gapless replacement after the source drained
    drain_deadline: Option<Instant>,
    /// End of stream follows once the sink has played out
    eos_pending: bool,
    /// An error was posted; no more audio until the stage is replaced
    stalled: bool,
}

impl Streamer {
    pub(crate) fn new(
        config: StreamingConfig,
        chain: &AudioChainPlan,
        hooks: GraphHooks,
        shared: Arc<GraphShared>,
        commands: Receiver<Command>,
    ) -> Self {
        Self {
            config,
            hooks,
            shared,
            commands,
            current: GraphState::Null,
            target: GraphState::Null,
            resolver: None,
            chain: EffectsChain::from_plan(chain),
            resampler: None,
            sink: None,
            stage: None,
            rendered_end: None,
            drain_deadline: None,
            eos_pending: false,
            stalled: false,
        }
    }

    pub(crate) fn run(mut self) {
        tracing::debug!("Streaming thread started");
        loop {
            match self.wait() {
                Wake::Command(Command::Shutdown) | Wake::Disconnected => break,
                Wake::Command(command) => self.handle(command),
                Wake::Timeout => {}
            }
            self.advance_state();
            self.pump();
        }
        self.shutdown();
        tracing::debug!("Streaming thread stopped");
    }

    fn wait(&mut self) -> Wake {
        let timeout = self.next_wakeup();
        let received = match timeout {
            None => self.commands.recv().map_err(|_| RecvTimeoutError::Disconnected),
            Some(timeout) => self.commands.recv_timeout(timeout),
        };
        match received {
            Ok(command) => Wake::Command(command),
            Err(RecvTimeoutError::Timeout) => Wake::Timeout,
            Err(RecvTimeoutError::Disconnected) => Wake::Disconnected,
        }
    }

    fn next_wakeup(&mut self) -> Option<Duration> {
        if self.resolver.is_some() && self.current != self.target {
            return Some(Duration::ZERO);
        }

        let now = Instant::now();
        let mut wakeup: Option<Duration> = None;
        let mut consider = |d: Duration| {
            wakeup = Some(wakeup.map_or(d, |w| w.min(d)));
        };

        if self.is_streaming() {
            if let Some(sink) = self.sink.as_mut() {
                consider(sink.ready_in());
            }
        }
        if self.eos_pending && self.current == GraphState::Playing {
            let queued = self.sink.as_mut().map_or(0, |sink| sink.latency());
            consider(Duration::from_nanos(queued));
        }
        if let Some(deadline) = self.drain_deadline {
            consider(deadline.saturating_duration_since(now).min(DRAIN_POLL));
        }
        wakeup
    }

    fn is_streaming(&self) -> bool {
        self.current == GraphState::Playing
            && !self.stalled
            && self
                .stage
                .as_ref()
                .is_some_and(|stage| stage.source.is_some() && !stage.drained)
    }

    fn post(&self, message: impl Into<GraphMessage>) {
        let _ = self.hooks.bus.send(message.into());
    }

    fn post_error(
        &self,
        source: MessageSource,
        domain: ErrorDomain,
        code: i32,
        message: impl Into<String>,
        debug: Option<String>,
    ) {
        let message = message.into();
        tracing::warn!(?source, ?domain, code, %message, "Streaming error");
        self.post(BusMessage::error(source, domain, code, message, debug));
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::SetState { target, resolver } => self.set_target(target, resolver),
            Command::AttachDecode { stage, spec } => self.attach(stage, spec),
            Command::Seek { position, reply } => {
                let accepted = self.seek(position);
                let _ = reply.send(accepted);
            }
            Command::Update { update, reply } => {
                let _ = reply.send(self.chain.apply(update));
            }
            Command::Shutdown => {}
        }
    }

    fn set_target(&mut self, target: GraphState, resolver: StateChangeResolver) {
        // A superseded request resolves as a failure when dropped here
        self.resolver = None;
        self.target = target;

        if self.current == target {
            resolver.resolve(StateChangeReturn::Success);
            self.shared
                .publish(self.current, GraphState::VoidPending, StateChangeReturn::Success);
        } else {
            self.resolver = Some(resolver);
            self.shared
                .publish(self.current, target, StateChangeReturn::Async);
        }
    }

    fn advance_state(&mut self) {
        if self.resolver.is_none() {
            return;
        }

        while let Some(next) = self.current.step_towards(self.target) {
            if !self.enter(next) {
                self.target = self.current;
                if let Some(resolver) = self.resolver.take() {
                    resolver.resolve(StateChangeReturn::Failure);
                }
                self.shared
                    .publish(self.current, GraphState::VoidPending, StateChangeReturn::Failure);
                return;
            }

            let old = self.current;
            self.current = next;
            let pending = if next == self.target {
                GraphState::VoidPending
            } else {
                self.target
            };
            tracing::debug!(?old, new = ?next, "State changed");
            self.post(BusMessage::state_changed(old, next, pending));
            self.shared
                .publish(next, pending, StateChangeReturn::Async);
        }

        if let Some(resolver) = self.resolver.take() {
            resolver.resolve(StateChangeReturn::Success);
        }
        self.shared
            .publish(self.current, GraphState::VoidPending, StateChangeReturn::Success);
    }

    /// Perform one state step; `false` if it failed
    fn enter(&mut self, next: GraphState) -> bool {
        match (self.current, next) {
            (GraphState::Null | GraphState::VoidPending, GraphState::Ready) => self.open_sink(),
            (GraphState::Ready, GraphState::Paused) => self.preroll(),
            (GraphState::Paused, GraphState::Playing) => {
                let Some(sink) = self.sink.as_mut() else {
                    return false;
                };
                match sink.play() {
                    Ok(()) => true,
                    Err(e) => {
                        self.post_error(
                            MessageSource::Element("sink".to_string()),
                            ErrorDomain::Resource,
                            resource_error::WRITE,
                            e.to_string(),
                            None,
                        );
                        false
                    }
                }
            }
            (GraphState::Playing, GraphState::Paused) => {
                if let Some(sink) = self.sink.as_mut() {
                    if let Err(e) = sink.pause() {
                        tracing::warn!(error = %e, "Sink refused to pause");
                    }
                }
                true
            }
            (GraphState::Paused, GraphState::Ready) => {
                self.reset_stream();
                if let Some(stage) = self.stage.as_mut() {
                    stage.source = None;
                    stage.drained = false;
                }
                self.shared.set_position(None);
                true
            }
            (GraphState::Ready, GraphState::Null) => {
                self.sink = None;
                self.resampler = None;
                true
            }
            (from, to) => {
                tracing::warn!(?from, ?to, "Unexpected state step");
                false
            }
        }
    }

    fn open_sink(&mut self) -> bool {
        match self
            .config
            .sink
            .open(self.config.device.as_deref(), self.config.output)
        {
            Ok(sink) => {
                let format = sink.format();
                self.resampler = Some(ChainResampler::new(
                    format.sample_rate,
                    &self.config.resampler,
                ));
                self.sink = Some(sink);
                true
            }
            Err(e) => {
                self.post_error(
                    MessageSource::Element("sink".to_string()),
                    ErrorDomain::Resource,
                    resource_error::OPEN_WRITE,
                    e.to_string(),
                    None,
                );
                false
            }
        }
    }

    /// Open the decode stage if it is not open yet
    fn preroll(&mut self) -> bool {
        match self.stage.as_ref() {
            Some(stage) if stage.source.is_none() => self.open_stage(),
            _ => true,
        }
    }

    fn open_stage(&mut self) -> bool {
        let Some(stage) = self.stage.as_mut() else {
            return true;
        };
        let id = stage.id;

        match stage.spec.open() {
            Ok(source) => {
                let format = source.format();
                let tags = source.tags();
                self.shared.set_duration(source.duration());
                stage.source = Some(source);
                stage.drained = false;
                self.stalled = false;

                tracing::debug!(
                    stage = id.as_u64(),
                    sample_rate = format.sample_rate,
                    channels = format.channels,
                    "Decode stage linked"
                );
                self.post(GraphMessage::DecodeLinked { stage: id, format });
                self.hooks.probe.on_segment(id, 0);

                self.chain.set_stored_gain(StoredGain::from_tags(&tags));
                if !tags.is_empty() {
                    self.post(BusMessage::new(
                        MessageSource::Decode(id),
                        BusMessageBody::Tag(tags),
                    ));
                }
                true
            }
            Err(e) => {
                self.post_source_error(id, e);
                false
            }
        }
    }

    fn post_source_error(&mut self, stage: DecodeStageId, error: SourceError) {
        self.stalled = true;
        self.post_error(
            MessageSource::Decode(stage),
            error.domain,
            error.code,
            error.message,
            error.debug,
        );
    }

    fn attach(&mut self, id: DecodeStageId, spec: SourceSpec) {
        tracing::debug!(stage = id.as_u64(), "Attaching decode stage");
        self.stage = Some(DecodeStage {
            id,
            spec,
            source: None,
            drained: false,
        });
        self.drain_deadline = None;
        self.eos_pending = false;

        if self.current.is_prerolled() && self.open_stage() {
            self.post(BusMessage::state_changed(
                self.current,
                self.current,
                GraphState::VoidPending,
            ));
        }
    }

    fn seek(&mut self, position: Nanos) -> bool {
        let Some(source) = self.stage.as_mut().and_then(|s| s.source.as_mut()) else {
            return false;
        };
        match source.seek(position) {
            Ok(actual) => {
                tracing::debug!(requested = position, actual, "Seeked");
                self.reset_stream();
                if let Some(stage) = self.stage.as_mut() {
                    stage.drained = false;
                }
                self.rendered_end = Some(actual);
                self.shared.set_position(Some(actual));
                true
            }
            Err(e) => {
                tracing::warn!(position, error = %e, "Seek rejected");
                false
            }
        }
    }

    /// Drop everything between the source and the speaker
    fn reset_stream(&mut self) {
        if let Some(sink) = self.sink.as_mut() {
            sink.flush();
        }
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
        }
        self.chain.reset();
        self.drain_deadline = None;
        self.eos_pending = false;
        self.rendered_end = None;
    }

    fn pump(&mut self) {
        self.update_position();
        self.check_timers();

        for _ in 0..MAX_FRAMES_PER_PUMP {
            if !self.is_streaming() {
                return;
            }
            let wants_more = self
                .sink
                .as_mut()
                .is_some_and(|sink| sink.ready_in().is_zero());
            if !wants_more {
                return;
            }

            let Some(stage) = self.stage.as_mut() else {
                return;
            };
            let id = stage.id;
            let Some(source) = stage.source.as_mut() else {
                return;
            };

            match source.next_frame() {
                Ok(Some(frame)) => {
                    if self.hooks.probe.on_frame(id, &frame) == ProbeVerdict::Pass {
                        self.render(&frame);
                    }
                }
                Ok(None) => self.on_drained(id),
                Err(e) => self.post_source_error(id, e),
            }
        }
    }

    fn render(&mut self, frame: &AudioFrame) {
        let (Some(sink), Some(resampler)) = (self.sink.as_mut(), self.resampler.as_mut()) else {
            return;
        };

        let mut samples = frame.samples.to_vec();
        self.chain.process(&mut samples, frame.format);

        let out_channels = sink.format().channels;
        let samples = map_channels(samples, frame.format.channels, out_channels);
        let mapped = FrameFormat::new(frame.format.sample_rate, out_channels);

        let resampled = match resampler.process(&samples, mapped) {
            Ok(resampled) => resampled,
            Err(e) => {
                self.stalled = true;
                self.post_error(
                    MessageSource::Element("audioresample".to_string()),
                    ErrorDomain::Core,
                    core_error::NEGOTIATION,
                    e.to_string(),
                    None,
                );
                return;
            }
        };

        if let Err(e) = sink.write(&resampled) {
            self.stalled = true;
            self.post_error(
                MessageSource::Element("sink".to_string()),
                ErrorDomain::Resource,
                resource_error::WRITE,
                e.to_string(),
                None,
            );
            return;
        }

        if let Some(pts) = frame.pts {
            self.rendered_end = Some(pts + frame.duration);
        }
    }

    fn update_position(&mut self) {
        let (Some(end), Some(sink)) = (self.rendered_end, self.sink.as_mut()) else {
            return;
        };
        self.shared
            .set_position(Some(end.saturating_sub(sink.latency())));
    }

    fn on_drained(&mut self, id: DecodeStageId) {
        if let Some(stage) = self.stage.as_mut() {
            stage.drained = true;
        }
        tracing::debug!(stage = id.as_u64(), "Decode stage drained");
        self.post(GraphMessage::Drained { stage: id });

        if self.hooks.drain_gate.is_held() {
            self.drain_deadline = Some(Instant::now() + self.config.drain_grace);
        } else {
            self.finish_stream();
        }
    }

    /// Play out what is queued, then report end of stream
    fn finish_stream(&mut self) {
        self.drain_deadline = None;
        self.eos_pending = true;
        let (Some(sink), Some(resampler)) = (self.sink.as_mut(), self.resampler.as_mut()) else {
            return;
        };
        match resampler.flush() {
            Ok(tail) if !tail.is_empty() => {
                if let Err(e) = sink.write(&tail) {
                    tracing::warn!(error = %e, "Dropping resampler tail");
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Resampler flush failed"),
        }
    }

    fn check_timers(&mut self) {
        if let Some(deadline) = self.drain_deadline {
            if !self.hooks.drain_gate.is_held() || Instant::now() >= deadline {
                tracing::debug!("No replacement arrived; ending stream");
                self.finish_stream();
            }
        }

        if !self.eos_pending || self.current != GraphState::Playing {
            return;
        }
        let queued = self.sink.as_mut().map_or(0, |sink| sink.latency());
        if queued == 0 {
            self.eos_pending = false;
            tracing::debug!("End of stream");
            self.post(BusMessage::new(MessageSource::Pipeline, BusMessageBody::Eos));
        }
    }

    fn shutdown(&mut self) {
        self.resolver = None;
        self.stage = None;
        self.sink = None;
        self.shared
            .publish(GraphState::Null, GraphState::VoidPending, StateChangeReturn::Success);
    }
}
