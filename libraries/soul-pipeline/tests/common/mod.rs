//! Shared helpers for controller integration tests
//!
//! [`MockRuntime`] records every call the controller makes and lets a test
//! play the streaming context by posting bus messages through the hooks of
//! the most recently built graph.

#![allow(dead_code)]

use soul_pipeline::error::GraphResult;
use soul_pipeline::graph::handle::StateChangeHandle;
use soul_pipeline::graph::{
    AudioChainPlan, BusMessage, BusMessageBody, DecodePlan, GraphHooks, GraphMessage,
    GraphRuntime, MediaGraph, MessageSource, StageUpdate, TagList,
};
use soul_pipeline::types::{
    DecodeStageId, ErrorDomain, FrameFormat, GraphState, Nanos, StateChangeReturn, StateQuery,
};
use soul_pipeline::{PipelineController, PipelineSettings};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

// ===== Mock runtime =====

#[derive(Default)]
pub struct MockLog {
    pub graphs_created: usize,
    pub graphs_dropped: usize,
    pub chains: Vec<AudioChainPlan>,
    pub attaches: Vec<(DecodeStageId, DecodePlan)>,
    pub seeks: Vec<Nanos>,
    pub updates: Vec<StageUpdate>,
    pub states: Vec<GraphState>,
    pub hooks: Option<GraphHooks>,
    pub current: GraphState,
    pub reject_seeks: bool,
}

/// Runtime whose graphs do nothing but record
#[derive(Clone, Default)]
pub struct MockRuntime {
    log: Arc<Mutex<MockLog>>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self) -> MutexGuard<'_, MockLog> {
        self.log.lock().unwrap()
    }

    pub fn graphs_created(&self) -> usize {
        self.log().graphs_created
    }

    pub fn seeks(&self) -> Vec<Nanos> {
        self.log().seeks.clone()
    }

    pub fn updates(&self) -> Vec<StageUpdate> {
        self.log().updates.clone()
    }

    pub fn attach_count(&self) -> usize {
        self.log().attaches.len()
    }

    pub fn last_plan(&self) -> Option<DecodePlan> {
        self.log().attaches.last().map(|(_, plan)| plan.clone())
    }

    /// Decode stage attached most recently
    pub fn stage(&self) -> DecodeStageId {
        self.log()
            .attaches
            .last()
            .map(|(stage, _)| *stage)
            .expect("no decode stage attached")
    }

    pub fn hooks(&self) -> GraphHooks {
        self.log().hooks.clone().expect("no graph built")
    }

    pub fn gate_held(&self) -> bool {
        self.hooks().drain_gate.is_held()
    }

    pub fn post(&self, message: impl Into<GraphMessage>) {
        self.hooks().bus.send(message.into()).unwrap();
    }

    /// Announce that the current decode stage linked
    pub fn link(&self) {
        self.post(GraphMessage::DecodeLinked {
            stage: self.stage(),
            format: FrameFormat::new(44100, 2),
        });
    }

    /// Announce a pipeline-level transition to `state`
    pub fn reach(&self, state: GraphState) {
        let old = {
            let mut log = self.log();
            std::mem::replace(&mut log.current, state)
        };
        self.post(BusMessage::state_changed(old, state, GraphState::VoidPending));
    }

    pub fn drained(&self) {
        self.post(GraphMessage::Drained {
            stage: self.stage(),
        });
    }

    /// Report the end offset for the bounds generation currently published
    pub fn end_offset_reached(&self) {
        let generation = self.hooks().probe.bounds().generation();
        self.post(GraphMessage::EndOffsetReached {
            stage: self.stage(),
            generation,
        });
    }

    pub fn tags(&self, tags: TagList) {
        self.post(BusMessage::new(
            MessageSource::Decode(self.stage()),
            BusMessageBody::Tag(tags),
        ));
    }

    pub fn error(&self, message: &str) {
        self.post(BusMessage::error(
            MessageSource::Decode(self.stage()),
            ErrorDomain::Stream,
            soul_pipeline::types::stream_error::DECODE,
            message,
            None,
        ));
    }

    pub fn eos(&self) {
        self.post(BusMessage::new(MessageSource::Pipeline, BusMessageBody::Eos));
    }
}

impl GraphRuntime for MockRuntime {
    fn name(&self) -> &str {
        "mock"
    }

    fn create_graph(
        &self,
        chain: &AudioChainPlan,
        hooks: GraphHooks,
    ) -> GraphResult<Box<dyn MediaGraph>> {
        let mut log = self.log();
        log.graphs_created += 1;
        log.chains.push(chain.clone());
        log.hooks = Some(hooks);
        log.current = GraphState::Null;
        Ok(Box::new(MockGraph {
            log: Arc::clone(&self.log),
        }))
    }
}

struct MockGraph {
    log: Arc<Mutex<MockLog>>,
}

impl MediaGraph for MockGraph {
    fn attach_decode_stage(&mut self, stage: DecodeStageId, plan: &DecodePlan) -> GraphResult<()> {
        self.log.lock().unwrap().attaches.push((stage, plan.clone()));
        Ok(())
    }

    fn request_state(&mut self, target: GraphState) -> StateChangeHandle {
        self.log.lock().unwrap().states.push(target);
        StateChangeHandle::ready(target, StateChangeReturn::Async)
    }

    fn query_state(&self, _timeout: Duration) -> StateQuery {
        StateQuery {
            result: StateChangeReturn::Success,
            current: self.log.lock().unwrap().current,
            pending: GraphState::VoidPending,
        }
    }

    fn seek(&mut self, position: Nanos) -> bool {
        let mut log = self.log.lock().unwrap();
        log.seeks.push(position);
        !log.reject_seeks
    }

    fn position(&self) -> Option<Nanos> {
        None
    }

    fn duration(&self) -> Option<Nanos> {
        None
    }

    fn apply(&mut self, update: StageUpdate) -> GraphResult<()> {
        self.log.lock().unwrap().updates.push(update);
        Ok(())
    }
}

impl Drop for MockGraph {
    fn drop(&mut self) {
        if let Ok(mut log) = self.log.lock() {
            log.graphs_dropped += 1;
        }
    }
}

// ===== Controller helpers =====

pub fn controller(runtime: &MockRuntime) -> PipelineController {
    PipelineController::new(Arc::new(runtime.clone()), PipelineSettings::default())
}

pub fn url(s: &str) -> url::Url {
    url::Url::parse(s).unwrap()
}

/// Link and preroll the current stage, then dispatch
pub fn bring_up(pipeline: &mut PipelineController, runtime: &MockRuntime, state: GraphState) {
    runtime.link();
    runtime.reach(state);
    pipeline.dispatch_pending();
}

pub fn drain_events(pipeline: &PipelineController) -> Vec<soul_pipeline::PipelineEvent> {
    pipeline.events().try_iter().collect()
}
