//! Soul Pipeline
//!
//! Per-track audio pipeline controller for Soul Player.
//!
//! This crate provides:
//! - Graph lifecycle: build, link, state transitions with bounded queries
//! - Gapless playback: decode-stage replacement, same-source continuation,
//!   full rebuild for non-contiguous follow-ups
//! - Effects: ReplayGain, 10-band equalizer, volume and timed fades
//! - Buffer fan-out of decoded audio to any number of consumers
//! - Bus message translation into [`PipelineEvent`]s
//!
//! # Architecture
//!
//! [`PipelineController`] is the only public entry point and is driven from
//! one control thread. It owns a media graph created by a [`GraphRuntime`];
//! the graph's streaming thread reports back through a channel that the
//! controller drains in [`poll`](PipelineController::poll) or
//! [`wait_and_dispatch`](PipelineController::wait_and_dispatch).
//!
//! [`SoftwareRuntime`] is the bundled runtime (symphonia + rubato, cpal with
//! the `desktop` feature). Tests and embedders can supply their own.
//!
//! # Example
//!
//! ```rust,no_run
//! use soul_pipeline::{GraphState, PipelineController, PipelineEvent, PipelineSettings, SoftwareRuntime};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # fn example() -> soul_pipeline::Result<()> {
//! let settings = PipelineSettings::load(None)?;
//! let runtime = Arc::new(SoftwareRuntime::new(&settings));
//! let mut pipeline = PipelineController::new(runtime, settings);
//!
//! pipeline.init_from_description("audiotestsrc num-buffers=100")?;
//! pipeline.request_state(GraphState::Playing);
//!
//! let events = pipeline.events();
//! loop {
//!     pipeline.wait_and_dispatch(Duration::from_millis(50));
//!     if let Ok(PipelineEvent::EndOfStreamReached { .. }) = events.try_recv() {
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod config;
pub mod controller;
pub mod effects;
pub mod error;
pub mod events;
pub mod fanout;
pub mod gapless;
pub mod graph;
pub mod probe;
pub mod runtime;
pub mod state;
pub mod types;

pub use config::PipelineSettings;
pub use controller::PipelineController;
pub use effects::fader::{FaderCurve, FaderDirection};
pub use effects::replaygain::{ReplayGainMode, ReplayGainSettings};
pub use error::{GraphError, PipelineError, Result};
pub use events::PipelineEvent;
pub use fanout::BufferConsumer;
pub use graph::{GraphRuntime, MediaGraph};
pub use runtime::SoftwareRuntime;
pub use types::{
    AudioFrame, FrameFormat, GraphState, MetaBundle, Nanos, PipelineId, PipelineLifecycle,
    StateChangeReturn,
};
