//! Bus message dispatch
//!
//! Turns [`GraphMessage`]s drained from a graph's bus into outward
//! [`PipelineEvent`]s and into [`Dispatch`] verdicts the controller acts on.
//! Tag, error and redirect handling live entirely here; state, linking and
//! gapless messages are only classified.

use crate::events::PipelineEvent;
use crate::graph::{tags, BusMessage, BusMessageBody, GraphMessage, MessageSource, Structure, TagList};
use crate::types::{DecodeStageId, ErrorDomain, FrameFormat, GraphState, MetaBundle, Nanos, PipelineId};
use crossbeam_channel::Sender;
use url::Url;

/// Debug text the runtime attaches to the error that follows a redirect
const REDIRECT_ERROR_DEBUG: &str =
    "A redirect message was posted on the bus and should have been handled by the application.";

/// Element message announcing a redirect
const REDIRECT_MESSAGE: &str = "redirect";
const REDIRECT_LOCATION: &str = "new-location";

/// What the controller has to do after a message was dispatched
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// Nothing left to do
    Handled,
    /// An error was reported; the instance is now invalid
    Failed,
    /// Pipeline-level state transition completed
    PipelineState(GraphState),
    EndOfStream,
    DecodeLinked {
        stage: DecodeStageId,
        format: FrameFormat,
    },
    Drained,
    EndOffsetReached {
        generation: u64,
    },
    SegmentStarted {
        start: Nanos,
    },
}

/// Per-message view of the control state the dispatcher needs
#[derive(Debug, Clone, Copy, Default)]
pub struct DispatchContext {
    pub current_stage: Option<DecodeStageId>,
    pub ignore_tags: bool,
}

impl DispatchContext {
    fn is_stale(&self, stage: DecodeStageId) -> bool {
        self.current_stage != Some(stage)
    }
}

/// Classifies bus messages and emits notifications for one pipeline
#[derive(Debug)]
pub struct BusEventDispatcher {
    id: PipelineId,
    events: Sender<PipelineEvent>,
    redirect_url: Option<Url>,
    error_reported: bool,
}

impl BusEventDispatcher {
    pub fn new(id: PipelineId, events: Sender<PipelineEvent>) -> Self {
        Self {
            id,
            events,
            redirect_url: None,
            error_reported: false,
        }
    }

    pub fn redirect_url(&self) -> Option<&Url> {
        self.redirect_url.as_ref()
    }

    pub fn error_reported(&self) -> bool {
        self.error_reported
    }

    pub fn dispatch(&mut self, message: GraphMessage, ctx: DispatchContext) -> Dispatch {
        match message {
            GraphMessage::Bus(bus) => self.dispatch_bus(bus, ctx),
            GraphMessage::DecodeLinked { stage, format } => {
                if ctx.is_stale(stage) {
                    return self.stale("decode-linked", stage);
                }
                Dispatch::DecodeLinked { stage, format }
            }
            GraphMessage::LinkFailed { stage, reason } => {
                if ctx.is_stale(stage) {
                    return self.stale("link-failed", stage);
                }
                self.report_error(
                    format!("Failed to link decode output: {reason}"),
                    ErrorDomain::Core,
                    crate::types::core_error::PAD,
                )
            }
            GraphMessage::Drained { stage } => {
                if ctx.is_stale(stage) {
                    return self.stale("drained", stage);
                }
                Dispatch::Drained
            }
            GraphMessage::EndOffsetReached { stage, generation } => {
                if ctx.is_stale(stage) {
                    return self.stale("end-offset", stage);
                }
                Dispatch::EndOffsetReached { generation }
            }
            GraphMessage::SegmentStarted { stage, start } => {
                if ctx.is_stale(stage) {
                    return self.stale("segment", stage);
                }
                Dispatch::SegmentStarted { start }
            }
        }
    }

    fn stale(&self, kind: &'static str, stage: DecodeStageId) -> Dispatch {
        tracing::debug!(pipeline = %self.id, kind, stage = stage.as_u64(), "Dropping message from stale decode stage");
        Dispatch::Handled
    }

    fn dispatch_bus(&mut self, message: BusMessage, ctx: DispatchContext) -> Dispatch {
        if let MessageSource::Decode(stage) = message.source {
            if ctx.is_stale(stage) {
                return self.stale("bus", stage);
            }
        }

        match message.body {
            BusMessageBody::Tag(tag_list) => {
                self.on_tags(&tag_list, ctx);
                Dispatch::Handled
            }
            BusMessageBody::Error {
                message,
                debug,
                domain,
                code,
            } => {
                if self.redirect_url.is_some()
                    && debug
                        .as_deref()
                        .is_some_and(|d| d.contains(REDIRECT_ERROR_DEBUG))
                {
                    tracing::debug!(pipeline = %self.id, "Ignoring error raised for a handled redirect");
                    return Dispatch::Handled;
                }
                if let Some(details) = &debug {
                    tracing::debug!(pipeline = %self.id, details = %details, "Error details");
                }
                self.report_error(message, domain, code)
            }
            BusMessageBody::Element(structure) => {
                self.on_element(&structure);
                Dispatch::Handled
            }
            BusMessageBody::StateChanged { old, new, pending } => {
                if message.source != MessageSource::Pipeline {
                    return Dispatch::Handled;
                }
                tracing::debug!(pipeline = %self.id, ?old, ?new, ?pending, "State changed");
                Dispatch::PipelineState(new)
            }
            BusMessageBody::Eos => Dispatch::EndOfStream,
        }
    }

    fn on_tags(&self, tag_list: &TagList, ctx: DispatchContext) {
        let field = |name: &str| {
            tag_list
                .get(name)
                .map(|value| value.trim().to_string())
                .unwrap_or_default()
        };
        let bundle = MetaBundle {
            title: field(tags::TITLE),
            artist: field(tags::ARTIST),
            album: field(tags::ALBUM),
            comment: field(tags::COMMENT),
        };

        if ctx.ignore_tags {
            tracing::debug!(pipeline = %self.id, "Ignoring tags during decode stage replacement");
            return;
        }
        if bundle.is_empty() {
            return;
        }
        self.emit(PipelineEvent::MetadataFound {
            pipeline_id: self.id,
            bundle,
        });
    }

    fn on_element(&mut self, structure: &Structure) {
        if structure.name != REDIRECT_MESSAGE {
            return;
        }
        let Some(location) = structure.get(REDIRECT_LOCATION) else {
            return;
        };
        match Url::parse(location) {
            Ok(url) => {
                tracing::info!(pipeline = %self.id, url = %url, "Redirect received");
                self.redirect_url = Some(url);
            }
            Err(e) => {
                tracing::warn!(pipeline = %self.id, location, error = %e, "Ignoring malformed redirect");
            }
        }
    }

    /// Surface an unrecoverable error, at most once per pipeline
    pub fn report_error(&mut self, message: String, domain: ErrorDomain, code: i32) -> Dispatch {
        if self.error_reported {
            tracing::debug!(pipeline = %self.id, %message, "Suppressing follow-up error");
            return Dispatch::Failed;
        }
        self.error_reported = true;
        tracing::error!(pipeline = %self.id, %message, domain = domain.code(), code, "Pipeline error");
        self.emit(PipelineEvent::Error {
            pipeline_id: self.id,
            message,
            domain: domain.code(),
            code,
        });
        Dispatch::Failed
    }

    pub fn emit(&self, event: PipelineEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!(pipeline = %self.id, "Event receiver dropped");
        }
    }
}
