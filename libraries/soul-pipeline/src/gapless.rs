//! Gapless transitions
//!
//! Holds the current and the preloaded next source and decides, when the
//! current one ends, how playback moves on:
//!
//! | Situation | Transition |
//! |-----------|------------|
//! | end offset crossed, next is the same source starting where this ends | continue in place |
//! | next begins where this ends | replace only the decode stage |
//! | next begins elsewhere | rebuild the whole graph |
//! | no next source | end of stream |
//!
//! The manager also publishes the values the streaming context reads: the
//! end-offset bounds and the drain gate.

use crate::graph::DrainGate;
use crate::probe::SegmentBounds;
use crate::types::{DecodeStageId, Nanos};
use std::sync::Arc;
use url::Url;

/// Preloaded next source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextSource {
    pub url: Url,
    pub begin: Nanos,
    /// 0 plays to the end of the source
    pub end: Nanos,
}

/// Why the current source is ending
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndTrigger {
    EndOffset,
    Drained,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Keep decoding the same stream; only the bounds move
    ContinueInPlace,
    /// Swap the decode stage on the live graph
    ReplaceDecode(NextSource),
    /// Tear the graph down and build it for the next source
    Rebuild(NextSource),
    /// Nothing staged; the stream ends here
    EndOfStream,
    /// Nothing to do yet
    Wait,
}

#[derive(Debug)]
pub struct GaplessTransitionManager {
    url: Option<Url>,
    end_offset: Nanos,
    next: Option<NextSource>,
    bounds: Arc<SegmentBounds>,
    drain_gate: DrainGate,
    ignore_tags: bool,
    replacement: Option<DecodeStageId>,
}

impl GaplessTransitionManager {
    pub fn new(bounds: Arc<SegmentBounds>, drain_gate: DrainGate) -> Self {
        Self {
            url: None,
            end_offset: 0,
            next: None,
            bounds,
            drain_gate,
            ignore_tags: false,
            replacement: None,
        }
    }

    /// Record the source the graph was built for
    pub fn set_current(&mut self, url: Option<Url>, end_offset: Nanos) {
        self.url = url;
        self.set_end_offset(end_offset);
    }

    fn set_end_offset(&mut self, end_offset: Nanos) {
        self.end_offset = end_offset;
        self.bounds.set_end_offset(end_offset);
        self.publish_continuation();
    }

    pub fn url(&self) -> Option<&Url> {
        self.url.as_ref()
    }

    pub fn end_offset(&self) -> Nanos {
        self.end_offset
    }

    pub fn next(&self) -> Option<&NextSource> {
        self.next.as_ref()
    }

    pub fn bounds(&self) -> &Arc<SegmentBounds> {
        &self.bounds
    }

    /// Stage the next source
    pub fn set_next_url(&mut self, url: Url, begin: Nanos, end: Nanos) {
        tracing::debug!(url = %url, begin, end, "Next source staged");
        self.next = Some(NextSource { url, begin, end });
        self.drain_gate.hold(true);
        self.publish_continuation();
    }

    pub fn clear_next(&mut self) {
        self.next = None;
        self.drain_gate.hold(false);
        self.bounds.set_continuation(None);
    }

    pub fn has_next_valid_url(&self) -> bool {
        self.next.is_some()
    }

    /// Next source begins exactly where the current one ends
    pub fn is_contiguous(&self) -> bool {
        self.next
            .as_ref()
            .is_some_and(|next| next.begin == self.end_offset)
    }

    fn continues_in_place(&self) -> bool {
        self.is_contiguous()
            && self.end_offset > 0
            && self.next.as_ref().map(|next| &next.url) == self.url.as_ref()
    }

    fn publish_continuation(&self) {
        let continuation = match &self.next {
            Some(next) if self.continues_in_place() => {
                Some(if next.end == 0 { u64::MAX } else { next.end })
            }
            _ => None,
        };
        self.bounds.set_continuation(continuation);
    }

    pub fn decide(&self, trigger: EndTrigger) -> Transition {
        let Some(next) = &self.next else {
            return match trigger {
                EndTrigger::EndOffset => Transition::EndOfStream,
                // The runtime follows up with end-of-stream on its own
                EndTrigger::Drained => Transition::Wait,
            };
        };

        if trigger == EndTrigger::EndOffset && self.continues_in_place() {
            return Transition::ContinueInPlace;
        }
        if self.is_contiguous() {
            Transition::ReplaceDecode(next.clone())
        } else {
            Transition::Rebuild(next.clone())
        }
    }

    /// Make the staged next source current
    ///
    /// While a decode replacement is in flight the drain gate stays held
    /// until [`finish_replacement`](Self::finish_replacement).
    pub fn commit(&mut self) -> Option<NextSource> {
        let next = self.next.take()?;
        if self.replacement.is_none() {
            self.drain_gate.hold(false);
        }
        self.url = Some(next.url.clone());
        self.set_end_offset(next.end);
        tracing::info!(url = %next.url, end = next.end, "Moved to next source");
        Some(next)
    }

    /// Tags are suppressed until `stage` is linked and prerolled
    pub fn begin_replacement(&mut self, stage: DecodeStageId) {
        self.ignore_tags = true;
        self.replacement = Some(stage);
    }

    pub fn finish_replacement(&mut self) {
        self.ignore_tags = false;
        self.replacement = None;
        if self.next.is_none() {
            self.drain_gate.hold(false);
        }
    }

    pub fn replacement_stage(&self) -> Option<DecodeStageId> {
        self.replacement
    }

    pub fn ignore_tags(&self) -> bool {
        self.ignore_tags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn manager() -> (GaplessTransitionManager, DrainGate) {
        let gate = DrainGate::default();
        let manager = GaplessTransitionManager::new(Arc::new(SegmentBounds::new()), gate.clone());
        (manager, gate)
    }

    #[test]
    fn contiguous_next_replaces_decode_stage() {
        let (mut gapless, gate) = manager();
        gapless.set_current(Some(url("file:///a.flac")), 0);
        gapless.set_next_url(url("file:///b.flac"), 0, 0);
        assert!(gate.is_held());
        assert!(matches!(
            gapless.decide(EndTrigger::Drained),
            Transition::ReplaceDecode(next) if next.url.as_str() == "file:///b.flac"
        ));
    }

    #[test]
    fn gate_stays_held_until_replacement_links() {
        let (mut gapless, gate) = manager();
        gapless.set_current(Some(url("file:///a.flac")), 0);
        gapless.set_next_url(url("file:///b.flac"), 0, 0);

        gapless.begin_replacement(DecodeStageId::next());
        gapless.commit();
        assert!(gate.is_held());
        assert!(gapless.ignore_tags());

        gapless.finish_replacement();
        assert!(!gate.is_held());
        assert!(!gapless.ignore_tags());
    }

    #[test]
    fn non_contiguous_next_rebuilds() {
        let (mut gapless, _gate) = manager();
        gapless.set_current(Some(url("file:///a.flac")), 0);
        gapless.set_next_url(url("file:///b.flac"), 30_000, 0);
        assert_eq!(gapless.next().map(|next| next.begin), Some(30_000));
        assert!(matches!(gapless.decide(EndTrigger::Drained), Transition::Rebuild(_)));
    }

    #[test]
    fn same_source_continuation_stays_in_place() {
        let (mut gapless, _gate) = manager();
        let album = url("file:///album.flac");
        gapless.set_current(Some(album.clone()), 1_000);
        gapless.set_next_url(album, 1_000, 2_000);
        assert_eq!(gapless.decide(EndTrigger::EndOffset), Transition::ContinueInPlace);

        let generation = gapless.bounds().generation();
        gapless.commit();
        assert_eq!(gapless.end_offset(), 2_000);
        assert_eq!(gapless.bounds().end_offset(), 2_000);
        assert!(gapless.bounds().generation() > generation);
        assert!(!gapless.has_next_valid_url());
    }

    #[test]
    fn nothing_staged_ends_or_waits() {
        let (mut gapless, gate) = manager();
        gapless.set_current(Some(url("file:///a.flac")), 500);
        assert_eq!(gapless.decide(EndTrigger::EndOffset), Transition::EndOfStream);
        assert_eq!(gapless.decide(EndTrigger::Drained), Transition::Wait);

        gapless.set_next_url(url("file:///b.flac"), 500, 0);
        gapless.clear_next();
        assert!(!gate.is_held());
        assert_eq!(gapless.decide(EndTrigger::Drained), Transition::Wait);
    }
}
