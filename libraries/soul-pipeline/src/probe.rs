//! Streaming-context probe
//!
//! The runtime calls a [`StreamProbe`] for every decoded frame and for the
//! start of every segment. The probe:
//! - records the first segment start of each decode stage
//! - enforces the end offset, dropping frames past it
//! - reports the end-offset crossing to the control context
//! - hands passing frames to the [`BufferFanout`]
//!
//! It only reads control-owned values ([`SegmentBounds`]); everything that
//! changes controller state travels as a [`GraphMessage`].

use crate::fanout::BufferFanout;
use crate::graph::GraphMessage;
use crate::types::{AudioFrame, DecodeStageId, Nanos};
use crossbeam_channel::Sender;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// What the runtime should do with a probed frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeVerdict {
    Pass,
    Drop,
}

/// End-offset bounds written by the control context
///
/// `generation` changes whenever the bounds are replaced, so a crossing is
/// reported once per bound rather than once per frame.
#[derive(Debug, Default)]
pub struct SegmentBounds {
    end_offset: AtomicU64,
    /// End of a staged same-source continuation, 0 if none
    continuation_end: AtomicU64,
    generation: AtomicU64,
}

impl SegmentBounds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the end offset (0 disables it) and clear any continuation
    pub fn set_end_offset(&self, end_offset: Nanos) {
        self.end_offset.store(end_offset, Ordering::Release);
        self.continuation_end.store(0, Ordering::Release);
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Allow frames up to `end` past the current end offset
    pub fn set_continuation(&self, end: Option<Nanos>) {
        self.continuation_end.store(end.unwrap_or(0), Ordering::Release);
    }

    pub fn end_offset(&self) -> Nanos {
        self.end_offset.load(Ordering::Acquire)
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn continuation_end(&self) -> Nanos {
        self.continuation_end.load(Ordering::Acquire)
    }
}

/// Per-graph probe bound to one controller
pub struct StreamProbe {
    fanout: Arc<BufferFanout>,
    bounds: Arc<SegmentBounds>,
    bus: Sender<GraphMessage>,
    // Streaming-thread cursor
    stage: AtomicU64,
    segment_start: AtomicU64,
    segment_received: AtomicBool,
    reported_generation: AtomicU64,
}

impl StreamProbe {
    pub fn new(
        fanout: Arc<BufferFanout>,
        bounds: Arc<SegmentBounds>,
        bus: Sender<GraphMessage>,
    ) -> Self {
        Self {
            fanout,
            bounds,
            bus,
            stage: AtomicU64::new(0),
            segment_start: AtomicU64::new(0),
            segment_received: AtomicBool::new(false),
            reported_generation: AtomicU64::new(u64::MAX),
        }
    }

    /// Reset the cursor when frames of a new decode stage show up
    fn enter_stage(&self, stage: DecodeStageId) {
        if self.stage.swap(stage.as_u64(), Ordering::AcqRel) != stage.as_u64() {
            self.segment_start.store(0, Ordering::Release);
            self.segment_received.store(false, Ordering::Release);
        }
    }

    /// A segment began on `stage`; only the first one per stage counts
    pub fn on_segment(&self, stage: DecodeStageId, start: Nanos) {
        self.enter_stage(stage);
        if !self.segment_received.swap(true, Ordering::AcqRel) {
            self.segment_start.store(start, Ordering::Release);
            let _ = self.bus.send(GraphMessage::SegmentStarted { stage, start });
        }
    }

    /// Inspect one decoded frame from `stage`
    pub fn on_frame(&self, stage: DecodeStageId, frame: &AudioFrame) -> ProbeVerdict {
        self.enter_stage(stage);

        let end_offset = self.bounds.end_offset();
        if end_offset > 0 {
            if let Some(pts) = frame.pts {
                let segment_start = self.segment_start.load(Ordering::Acquire);
                let frame_end = pts.saturating_sub(segment_start) + frame.duration;
                if frame_end > end_offset {
                    let generation = self.bounds.generation();
                    if self.reported_generation.swap(generation, Ordering::AcqRel) != generation
                    {
                        let _ = self
                            .bus
                            .send(GraphMessage::EndOffsetReached { stage, generation });
                    }

                    let continuation = self.bounds.continuation_end();
                    let covered = continuation > 0 && frame_end <= continuation;
                    if !covered {
                        return ProbeVerdict::Drop;
                    }
                }
            }
        }

        self.fanout.deliver(frame);
        ProbeVerdict::Pass
    }

    pub fn segment_start(&self) -> Nanos {
        self.segment_start.load(Ordering::Acquire)
    }

    pub fn bounds(&self) -> &Arc<SegmentBounds> {
        &self.bounds
    }
}

impl std::fmt::Debug for StreamProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamProbe")
            .field("stage", &self.stage.load(Ordering::Relaxed))
            .field("segment_start", &self.segment_start())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FrameFormat, PipelineId};

    const MS: Nanos = 1_000_000;

    fn frame_at(pts_ms: u64) -> AudioFrame {
        // 10ms of stereo audio at 1 kHz
        let mut frame = AudioFrame::new(vec![0.0; 20], FrameFormat::new(1000, 2), None);
        frame.pts = Some(pts_ms * MS);
        frame
    }

    fn probe() -> (StreamProbe, Arc<SegmentBounds>, crossbeam_channel::Receiver<GraphMessage>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let bounds = Arc::new(SegmentBounds::new());
        let fanout = Arc::new(BufferFanout::new(PipelineId::next()));
        (StreamProbe::new(fanout, Arc::clone(&bounds), tx), bounds, rx)
    }

    #[test]
    fn first_segment_per_stage_is_recorded() {
        let (probe, _bounds, rx) = probe();
        let stage = DecodeStageId::next();
        probe.on_segment(stage, 5 * MS);
        probe.on_segment(stage, 9 * MS);
        assert_eq!(probe.segment_start(), 5 * MS);

        let next = DecodeStageId::next();
        probe.on_segment(next, 7 * MS);
        assert_eq!(probe.segment_start(), 7 * MS);
        assert_eq!(rx.try_iter().count(), 2);
    }

    #[test]
    fn frames_past_end_offset_are_dropped_and_reported_once() {
        let (probe, bounds, rx) = probe();
        let stage = DecodeStageId::next();
        bounds.set_end_offset(100 * MS);
        probe.on_segment(stage, 0);
        rx.try_iter().for_each(drop);

        assert_eq!(probe.on_frame(stage, &frame_at(80)), ProbeVerdict::Pass);
        assert_eq!(probe.on_frame(stage, &frame_at(90)), ProbeVerdict::Pass);
        assert_eq!(probe.on_frame(stage, &frame_at(95)), ProbeVerdict::Drop);
        assert_eq!(probe.on_frame(stage, &frame_at(105)), ProbeVerdict::Drop);

        let reports: Vec<_> = rx.try_iter().collect();
        assert_eq!(reports.len(), 1);
        assert!(matches!(
            reports[0],
            GraphMessage::EndOffsetReached { generation, .. } if generation == bounds.generation()
        ));
    }

    #[test]
    fn continuation_lets_frames_through() {
        let (probe, bounds, _rx) = probe();
        let stage = DecodeStageId::next();
        bounds.set_end_offset(100 * MS);
        bounds.set_continuation(Some(200 * MS));
        assert_eq!(probe.on_frame(stage, &frame_at(120)), ProbeVerdict::Pass);
        assert_eq!(probe.on_frame(stage, &frame_at(195)), ProbeVerdict::Drop);
    }

    #[test]
    fn end_offset_is_relative_to_segment_start() {
        let (probe, bounds, _rx) = probe();
        let stage = DecodeStageId::next();
        bounds.set_end_offset(100 * MS);
        probe.on_segment(stage, 1000 * MS);
        assert_eq!(probe.on_frame(stage, &frame_at(1080)), ProbeVerdict::Pass);
        assert_eq!(probe.on_frame(stage, &frame_at(1100)), ProbeVerdict::Drop);
    }
}
