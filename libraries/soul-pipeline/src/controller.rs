//! Pipeline controller
//!
//! [`PipelineController`] owns one media graph and everything needed to
//! drive it: build options, effect settings, state tracking, gapless
//! transitions, bus dispatch and the buffer fan-out.
//!
//! # Lifecycle
//!
//! ```text
//! Unbuilt ──init──▶ Initialized ──linked──▶ Linked ──▶ Ready / Paused / Playing
//!    │                   │                    │
//!    └───────────────────┴──── error ─────────┴──▶ Invalid
//! ```
//!
//! Dropping the controller tears the graph down (`Null`).
//!
//! # Pumping
//!
//! Nothing happens behind the owner's back. Bus messages are dispatched and
//! the fader advances only while the owner calls [`poll`](PipelineController::poll),
//! [`dispatch_pending`](PipelineController::dispatch_pending) or
//! [`wait_and_dispatch`](PipelineController::wait_and_dispatch). Notifications
//! are read from [`events`](PipelineController::events).

use crate::bus::{BusEventDispatcher, Dispatch, DispatchContext};
use crate::config::PipelineSettings;
use crate::effects::fader::{Clock, FaderCurve, FaderDirection, MonotonicClock};
use crate::effects::replaygain::ReplayGainSettings;
use crate::effects::EffectsController;
use crate::error::{PipelineError, Result};
use crate::events::PipelineEvent;
use crate::fanout::{BufferConsumer, BufferFanout};
use crate::gapless::{EndTrigger, GaplessTransitionManager, NextSource, Transition};
use crate::graph::handle::StateChangeHandle;
use crate::graph::{
    DecodePlan, DrainGate, GraphBuilder, GraphHooks, GraphMessage, GraphRuntime, MediaGraph,
    StageUpdate,
};
use crate::probe::{SegmentBounds, StreamProbe};
use crate::state::StateController;
use crate::types::{
    core_error, resource_error, DecodeStageId, ErrorDomain, GraphState, Nanos, PipelineId,
    PipelineLifecycle,
};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::cell::Cell;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Upper bound between fader steps while a fade runs
const FADER_STEP: Duration = Duration::from_millis(10);

/// Drives one media graph on behalf of an owning engine
pub struct PipelineController {
    id: PipelineId,
    runtime: Arc<dyn GraphRuntime>,
    settings: PipelineSettings,
    clock: Arc<dyn Clock>,

    builder: GraphBuilder,
    effects: EffectsController,
    state: StateController,
    gapless: GaplessTransitionManager,
    dispatcher: BusEventDispatcher,
    fanout: Arc<BufferFanout>,
    drain_gate: DrainGate,

    graph: Option<Box<dyn MediaGraph>>,
    bus: Option<Receiver<GraphMessage>>,
    stage: Option<DecodeStageId>,
    events_rx: Receiver<PipelineEvent>,

    segment_start: Nanos,
    source_device: Option<String>,
    last_known_position: Cell<Nanos>,
    end_reported: bool,
    valid: bool,
    torn_down: bool,
}

impl PipelineController {
    pub fn new(runtime: Arc<dyn GraphRuntime>, settings: PipelineSettings) -> Self {
        Self::with_clock(runtime, settings, Arc::new(MonotonicClock))
    }

    /// Controller whose fader reads time from `clock`
    pub fn with_clock(
        runtime: Arc<dyn GraphRuntime>,
        settings: PipelineSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let id = PipelineId::next();
        let (events_tx, events_rx): (Sender<PipelineEvent>, _) = crossbeam_channel::unbounded();
        let drain_gate = DrainGate::default();
        let bounds = Arc::new(SegmentBounds::new());

        tracing::debug!(pipeline = %id, runtime = runtime.name(), "Pipeline created");

        Self {
            id,
            builder: GraphBuilder::new(&settings),
            effects: EffectsController::new(settings.fader_fudge()),
            state: StateController::new(settings.state_timeout()),
            gapless: GaplessTransitionManager::new(bounds, drain_gate.clone()),
            dispatcher: BusEventDispatcher::new(id, events_tx),
            fanout: Arc::new(BufferFanout::new(id)),
            drain_gate,
            graph: None,
            bus: None,
            stage: None,
            events_rx,
            segment_start: 0,
            source_device: None,
            last_known_position: Cell::new(0),
            end_reported: false,
            valid: true,
            torn_down: false,
            runtime,
            settings,
            clock,
        }
    }

    // ===== Build options (before Init) =====

    /// Select the output sink element and device
    ///
    /// Must be called before `init_*`; afterwards it returns
    /// `ContractViolation` and changes nothing.
    pub fn set_output_device(&mut self, sink: &str, device: &str) -> Result<()> {
        self.builder.set_output_device(sink, device)
    }

    /// Queue size in nanoseconds (0 disables buffering)
    ///
    /// Must be called before `init_*`.
    pub fn set_buffer_duration(&mut self, nanos: u64) -> Result<()> {
        self.builder.set_buffer_duration(nanos)
    }

    /// Configure replaygain
    ///
    /// Before `init_*` every field may change. Afterwards mode, preamp and
    /// compression are pushed into the running stages, but toggling
    /// `enabled` is a `ContractViolation` because the stages are planned at
    /// build time.
    pub fn set_replaygain(&mut self, settings: ReplayGainSettings) -> Result<()> {
        if !self.builder.is_built() {
            self.effects.configure_replaygain(settings);
            return Ok(());
        }
        if settings.enabled != self.effects.replaygain().enabled {
            tracing::warn!(pipeline = %self.id, "Replaygain cannot be toggled after Init");
            return Err(PipelineError::ContractViolation("set_replaygain"));
        }
        let updates =
            self.effects
                .update_replaygain(settings.mode, settings.preamp_db, settings.compression);
        if settings.enabled {
            self.apply_all(updates);
        }
        Ok(())
    }

    // ===== Init =====

    /// Build the graph for `url`
    ///
    /// `end_offset` (nanoseconds, 0 for none) is where playback stops even if
    /// the source continues. On failure the instance stays invalid for good.
    pub fn init_from_url(&mut self, url: Url, end_offset: Nanos) -> Result<()> {
        self.builder.ensure_unbuilt("init")?;
        self.builder.mark_built();

        let plan = match self.builder.decode_plan_from_url(&url) {
            Ok(plan) => plan,
            Err(e) => return Err(self.fail_init(e.to_string())),
        };
        if let DecodePlan::Uri { source_device, .. } = &plan {
            self.source_device = source_device.clone();
        }
        self.gapless.set_current(Some(url), end_offset);

        if let Err(e) = self.build_graph(&plan) {
            return Err(self.fail_init(e.to_string()));
        }
        tracing::info!(pipeline = %self.id, url = ?self.gapless.url().map(Url::as_str), end_offset, "Pipeline initialized");
        Ok(())
    }

    /// Build the graph from a raw element chain (diagnostics and tests)
    ///
    /// A malformed description fails without any notification.
    pub fn init_from_description(&mut self, description: &str) -> Result<()> {
        self.builder.ensure_unbuilt("init")?;
        self.builder.mark_built();

        let plan = match self.builder.decode_plan_from_description(description) {
            Ok(plan) => plan,
            Err(e) => return Err(self.fail_init(e.to_string())),
        };
        self.gapless.set_current(None, 0);

        if let Err(e) = self.build_graph(&plan) {
            return Err(self.fail_init(e.to_string()));
        }
        tracing::info!(pipeline = %self.id, description, "Pipeline initialized");
        Ok(())
    }

    fn fail_init(&mut self, reason: String) -> PipelineError {
        tracing::warn!(pipeline = %self.id, %reason, "Init failed");
        self.valid = false;
        PipelineError::InitializationFailure(reason)
    }

    /// Instantiate a fresh graph with its own bus and attach `plan`
    fn build_graph(&mut self, plan: &DecodePlan) -> Result<()> {
        let (bus_tx, bus_rx) = crossbeam_channel::unbounded();
        let probe = Arc::new(StreamProbe::new(
            Arc::clone(&self.fanout),
            Arc::clone(self.gapless.bounds()),
            bus_tx.clone(),
        ));
        let hooks = GraphHooks {
            bus: bus_tx,
            probe,
            drain_gate: self.drain_gate.clone(),
        };

        let chain = self.builder.chain_plan(&self.effects);
        tracing::debug!(pipeline = %self.id, stages = ?chain.element_names(), "Building graph");

        let mut graph = self.runtime.create_graph(&chain, hooks)?;
        let stage = DecodeStageId::next();
        graph.attach_decode_stage(stage, plan)?;

        self.state.reset_for_rebuild();
        self.graph = Some(graph);
        self.bus = Some(bus_rx);
        self.stage = Some(stage);
        self.segment_start = 0;
        self.last_known_position.set(0);
        self.end_reported = false;
        Ok(())
    }

    // ===== Control surface =====

    /// Request a state transition
    ///
    /// An invalid or unbuilt instance answers `Failure` immediately.
    pub fn request_state(&mut self, target: GraphState) -> StateChangeHandle {
        if !self.valid {
            return StateController::refuse(target);
        }
        match self.graph.as_deref_mut() {
            Some(graph) => self.state.request(graph, target),
            None => StateController::refuse(target),
        }
    }

    /// Seek to `position` nanoseconds
    ///
    /// Before the graph is linked and prerolled the seek is queued (the last
    /// one wins) and `true` is returned.
    pub fn seek(&mut self, position: Nanos) -> bool {
        if !self.valid {
            return false;
        }
        let Some(graph) = self.graph.as_deref_mut() else {
            return false;
        };
        let outcome = self.state.seek(graph, position);
        if matches!(outcome, crate::state::SeekOutcome::Issued(true)) {
            self.last_known_position.set(position);
        }
        outcome.accepted()
    }

    pub fn set_equalizer_enabled(&mut self, enabled: bool) {
        let updates = self.effects.set_equalizer_enabled(enabled);
        self.apply_all(updates);
    }

    /// Preamp 0..=100 and one gain -100..=100 per band
    pub fn set_equalizer_params(&mut self, preamp: i32, gains: &[i32]) {
        let updates = self.effects.set_equalizer_params(preamp, gains);
        self.apply_all(updates);
    }

    /// Volume in percent (0-100)
    pub fn set_volume(&mut self, percent: u8) {
        let update = self.effects.set_volume(percent);
        self.apply(update);
    }

    pub fn set_volume_modifier(&mut self, modifier: f64) {
        let update = self.effects.set_volume_modifier(modifier);
        self.apply(update);
    }

    /// Start a fade; a fade already running is superseded without finishing
    pub fn start_fader(&mut self, duration: Duration, direction: FaderDirection, curve: FaderCurve) {
        let update = self
            .effects
            .start_fader(duration, direction, curve, self.clock.now());
        tracing::debug!(pipeline = %self.id, ?duration, ?direction, ?curve, "Fader started");
        self.apply(update);
    }

    /// Stage the source to continue with when the current one ends
    pub fn set_next_url(&mut self, url: Url, begin: Nanos, end: Nanos) {
        self.gapless.set_next_url(url, begin, end);
    }

    pub fn add_consumer(&self, consumer: &Arc<dyn BufferConsumer>) {
        self.fanout.add_consumer(consumer);
    }

    pub fn remove_consumer(&self, consumer: &Arc<dyn BufferConsumer>) -> bool {
        self.fanout.remove_consumer(consumer)
    }

    pub fn remove_all_consumers(&self) {
        self.fanout.remove_all_consumers();
    }

    fn apply(&mut self, update: StageUpdate) {
        let Some(graph) = self.graph.as_deref_mut() else {
            return;
        };
        if let Err(e) = graph.apply(update) {
            tracing::warn!(pipeline = %self.id, error = %e, "Stage update rejected");
        }
    }

    fn apply_all(&mut self, updates: Vec<StageUpdate>) {
        for update in updates {
            self.apply(update);
        }
    }

    // ===== Queries =====

    pub fn id(&self) -> PipelineId {
        self.id
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Stream position in nanoseconds; the last known one if the graph
    /// cannot answer
    pub fn position(&self) -> Nanos {
        if self.state.is_initialized() {
            if let Some(position) = self.graph.as_deref().and_then(|g| g.position()) {
                self.last_known_position.set(position);
            }
        }
        self.last_known_position.get()
    }

    /// Length of the current segment in nanoseconds, 0 if unknown
    pub fn length(&self) -> Nanos {
        self.graph
            .as_deref()
            .and_then(|g| g.duration())
            .unwrap_or(0)
    }

    /// Current graph state, waiting at most the configured state timeout
    pub fn state(&self) -> GraphState {
        self.state.current_state(self.graph.as_deref())
    }

    pub fn lifecycle(&self) -> PipelineLifecycle {
        self.state
            .lifecycle(self.graph.is_some(), self.valid, self.torn_down)
    }

    pub fn segment_start(&self) -> Nanos {
        self.segment_start
    }

    pub fn redirect_url(&self) -> Option<&Url> {
        self.dispatcher.redirect_url()
    }

    pub fn source_device(&self) -> Option<&str> {
        self.source_device.as_deref()
    }

    pub fn url(&self) -> Option<&Url> {
        self.gapless.url()
    }

    pub fn end_offset(&self) -> Nanos {
        self.gapless.end_offset()
    }

    pub fn has_next_valid_url(&self) -> bool {
        self.gapless.has_next_valid_url()
    }

    /// Gain currently applied by the volume stage
    pub fn volume_gain(&self) -> f64 {
        self.effects.applied_gain()
    }

    pub fn effects(&self) -> &EffectsController {
        &self.effects
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Notification stream for this pipeline
    pub fn events(&self) -> Receiver<PipelineEvent> {
        self.events_rx.clone()
    }

    // ===== Pumping =====

    /// Advance the fader and dispatch every queued bus message
    ///
    /// Returns the number of bus messages dispatched.
    pub fn poll(&mut self) -> usize {
        let dispatched = self.dispatch_pending();
        self.tick_fader();
        dispatched
    }

    /// Dispatch every queued bus message without waiting
    pub fn dispatch_pending(&mut self) -> usize {
        let mut dispatched = 0;
        while let Some(message) = self.bus.as_ref().and_then(|bus| bus.try_recv().ok()) {
            self.handle_message(message);
            dispatched += 1;
        }
        dispatched
    }

    /// Wait up to `timeout` for a bus message, then poll
    ///
    /// Returns early when a message arrives or the fader needs a step.
    pub fn wait_and_dispatch(&mut self, timeout: Duration) -> usize {
        let mut wait = timeout;
        if self.effects.is_fading() {
            wait = wait.min(FADER_STEP);
        }
        if let Some(deadline) = self.effects.next_deadline() {
            wait = wait.min(deadline.saturating_duration_since(self.clock.now()));
        }

        let received = match &self.bus {
            Some(bus) => match bus.recv_timeout(wait) {
                Ok(message) => Some(message),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => {
                    std::thread::sleep(wait);
                    None
                }
            },
            None => {
                std::thread::sleep(wait);
                None
            }
        };

        let mut dispatched = 0;
        if let Some(message) = received {
            self.handle_message(message);
            dispatched += 1;
        }
        dispatched + self.poll()
    }

    fn tick_fader(&mut self) {
        let tick = self.effects.tick(self.clock.now());
        if let Some(update) = tick.update {
            self.apply(update);
        }
        if tick.finished {
            tracing::debug!(pipeline = %self.id, "Fader finished");
            self.dispatcher
                .emit(PipelineEvent::FaderFinished { pipeline_id: self.id });
        }
    }

    fn handle_message(&mut self, message: GraphMessage) {
        let ctx = DispatchContext {
            current_stage: self.stage,
            ignore_tags: self.gapless.ignore_tags(),
        };

        match self.dispatcher.dispatch(message, ctx) {
            Dispatch::Handled => {}
            Dispatch::Failed => self.invalidate(),
            Dispatch::PipelineState(state) => self.on_pipeline_state(state),
            Dispatch::EndOfStream => self.on_end_of_stream(),
            Dispatch::DecodeLinked { stage, format } => {
                tracing::debug!(
                    pipeline = %self.id,
                    stage = stage.as_u64(),
                    sample_rate = format.sample_rate,
                    channels = format.channels,
                    "Decode output linked"
                );
                if let Some(graph) = self.graph.as_deref_mut() {
                    self.state.on_linked(graph);
                }
                self.finish_replacement_if_ready();
            }
            Dispatch::Drained => self.transition(EndTrigger::Drained),
            Dispatch::EndOffsetReached { generation } => {
                if generation == self.gapless.bounds().generation() {
                    self.transition(EndTrigger::EndOffset);
                } else {
                    tracing::debug!(pipeline = %self.id, generation, "End offset report for replaced bounds");
                }
            }
            Dispatch::SegmentStarted { start } => {
                self.segment_start = start;
            }
        }
    }

    fn on_pipeline_state(&mut self, state: GraphState) {
        if let Some(graph) = self.graph.as_deref_mut() {
            self.state.on_state(graph, state);
        }
        self.finish_replacement_if_ready();
    }

    /// Re-enable tags and seeks once the replacement stage is linked and
    /// prerolled
    fn finish_replacement_if_ready(&mut self) {
        if self.gapless.replacement_stage().is_some()
            && self.gapless.replacement_stage() == self.stage
            && self.state.is_linked()
            && self.state.is_initialized()
        {
            self.gapless.finish_replacement();
            self.state.clear_seek_suppression();
            tracing::debug!(pipeline = %self.id, "Decode replacement complete");
        }
    }

    fn on_end_of_stream(&mut self) {
        if self.end_reported {
            return;
        }
        self.end_reported = true;
        tracing::info!(pipeline = %self.id, "End of stream");
        self.emit_end_of_stream(false);
    }

    fn emit_end_of_stream(&self, has_next_track: bool) {
        self.dispatcher.emit(PipelineEvent::EndOfStreamReached {
            pipeline_id: self.id,
            has_next_track,
        });
    }

    fn transition(&mut self, trigger: EndTrigger) {
        if !self.valid {
            return;
        }
        match self.gapless.decide(trigger) {
            Transition::Wait => {}
            Transition::EndOfStream => self.on_end_of_stream(),
            Transition::ContinueInPlace => {
                self.gapless.commit();
                self.state.suppress_next_seek();
                self.emit_end_of_stream(true);
            }
            Transition::ReplaceDecode(next) => self.replace_decode_stage(next),
            Transition::Rebuild(next) => self.rebuild(next),
        }
    }

    /// Swap the decode stage; effects chain and sink keep running
    fn replace_decode_stage(&mut self, next: NextSource) {
        tracing::info!(pipeline = %self.id, url = %next.url, "Replacing decode stage");
        let plan = match self.builder.decode_plan_from_url(&next.url) {
            Ok(plan) => plan,
            Err(e) => {
                self.fail(e.to_string(), ErrorDomain::Resource, resource_error::NOT_FOUND);
                return;
            }
        };

        let stage = DecodeStageId::next();
        self.stage = Some(stage);
        self.segment_start = 0;
        self.gapless.begin_replacement(stage);
        self.state.suppress_next_seek();
        self.state.unlink();

        let attached = match self.graph.as_deref_mut() {
            Some(graph) => graph.attach_decode_stage(stage, &plan),
            None => Err(crate::error::GraphError::Shutdown),
        };
        if let Err(e) = attached {
            self.fail(e.to_string(), ErrorDomain::Core, core_error::MISSING_PLUGIN);
            return;
        }

        if let DecodePlan::Uri { source_device, .. } = plan {
            self.source_device = source_device;
        }
        self.gapless.commit();
        self.end_reported = false;
        self.emit_end_of_stream(true);
    }

    /// Tear the graph down and build it again for `next`
    fn rebuild(&mut self, next: NextSource) {
        tracing::info!(pipeline = %self.id, url = %next.url, begin = next.begin, "Rebuilding graph");
        self.teardown_graph();

        let plan = match self.builder.decode_plan_from_url(&next.url) {
            Ok(plan) => plan,
            Err(e) => {
                self.fail(e.to_string(), ErrorDomain::Resource, resource_error::NOT_FOUND);
                return;
            }
        };
        self.gapless.commit();
        if let DecodePlan::Uri { source_device, .. } = &plan {
            self.source_device = source_device.clone();
        }

        if let Err(e) = self.build_graph(&plan) {
            self.fail(e.to_string(), ErrorDomain::Core, core_error::FAILED);
            return;
        }
        if next.begin > 0 {
            self.state.queue_seek(next.begin);
        }
        self.state.suppress_next_seek();
        if let Some(stage) = self.stage {
            self.gapless.begin_replacement(stage);
        }

        if let (Some(target), Some(graph)) =
            (self.state.requested_target(), self.graph.as_deref_mut())
        {
            // The handle is not needed; progress arrives on the bus
            let _ = self.state.request(graph, target);
        }
        self.emit_end_of_stream(true);
    }

    fn fail(&mut self, message: String, domain: ErrorDomain, code: i32) {
        self.dispatcher.report_error(message, domain, code);
        self.invalidate();
    }

    fn invalidate(&mut self) {
        if self.valid {
            tracing::error!(pipeline = %self.id, "Pipeline invalidated");
        }
        self.valid = false;
        self.gapless.clear_next();
    }

    /// Bring the current graph to `Null` within the state timeout and drop it
    fn teardown_graph(&mut self) {
        let Some(mut graph) = self.graph.take() else {
            return;
        };
        self.bus = None;
        self.stage = None;
        let handle = graph.request_state(GraphState::Null);
        if let Err(e) = handle.wait_timeout(self.settings.state_timeout()) {
            tracing::debug!(pipeline = %self.id, error = %e, "Graph did not reach Null in time");
        }
    }
}

impl Drop for PipelineController {
    fn drop(&mut self) {
        self.teardown_graph();
        self.torn_down = true;
        tracing::debug!(pipeline = %self.id, "Pipeline torn down");
    }
}

impl std::fmt::Debug for PipelineController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineController")
            .field("id", &self.id)
            .field("lifecycle", &self.lifecycle())
            .field("url", &self.gapless.url().map(Url::as_str))
            .field("end_offset", &self.gapless.end_offset())
            .finish()
    }
}
