//! Gapless transition tests
//!
//! Drive the controller through the three ways a source can hand over to
//! the next one and check what reaches the graph and the event stream.

mod common;

use common::{bring_up, controller, drain_events, url, MockRuntime};
use soul_pipeline::graph::{tags, GraphMessage, TagList};
use soul_pipeline::{GraphState, PipelineEvent};

const SECOND: u64 = 1_000_000_000;

fn end_events(events: &[PipelineEvent]) -> Vec<bool> {
    events
        .iter()
        .filter_map(|event| match event {
            PipelineEvent::EndOfStreamReached { has_next_track, .. } => Some(*has_next_track),
            _ => None,
        })
        .collect()
}

fn titles(events: &[PipelineEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            PipelineEvent::MetadataFound { bundle, .. } => Some(bundle.title.clone()),
            _ => None,
        })
        .collect()
}

#[test]
fn contiguous_next_swaps_decode_stage_on_live_graph() {
    let runtime = MockRuntime::new();
    let mut pipeline = controller(&runtime);
    pipeline.init_from_url(url("file:///music/a.flac"), 0).unwrap();
    bring_up(&mut pipeline, &runtime, GraphState::Playing);

    pipeline.set_next_url(url("file:///music/b.flac"), 0, 0);
    assert!(runtime.gate_held());
    assert!(pipeline.has_next_valid_url());

    runtime.drained();
    pipeline.dispatch_pending();

    assert_eq!(runtime.graphs_created(), 1);
    assert_eq!(runtime.attach_count(), 2);
    assert_eq!(pipeline.url().map(|u| u.as_str()), Some("file:///music/b.flac"));
    assert!(!pipeline.has_next_valid_url());
    assert_eq!(end_events(&drain_events(&pipeline)), vec![true]);

    // Gate stays held until the new stage links
    assert!(runtime.gate_held());
    runtime.link();
    pipeline.dispatch_pending();
    assert!(!runtime.gate_held());
}

#[test]
fn tags_are_ignored_until_replacement_links() {
    let runtime = MockRuntime::new();
    let mut pipeline = controller(&runtime);
    pipeline.init_from_url(url("file:///music/a.flac"), 0).unwrap();
    bring_up(&mut pipeline, &runtime, GraphState::Playing);

    runtime.tags(TagList::new().with(tags::TITLE, "First"));
    pipeline.dispatch_pending();
    assert_eq!(titles(&drain_events(&pipeline)), vec!["First".to_string()]);

    pipeline.set_next_url(url("file:///music/b.flac"), 0, 0);
    runtime.drained();
    pipeline.dispatch_pending();
    drain_events(&pipeline);

    runtime.tags(TagList::new().with(tags::TITLE, "Too early"));
    pipeline.dispatch_pending();
    assert!(titles(&drain_events(&pipeline)).is_empty());

    runtime.link();
    runtime.tags(TagList::new().with(tags::TITLE, "Second"));
    pipeline.dispatch_pending();
    assert_eq!(titles(&drain_events(&pipeline)), vec!["Second".to_string()]);
}

#[test]
fn messages_from_replaced_stage_are_dropped() {
    let runtime = MockRuntime::new();
    let mut pipeline = controller(&runtime);
    pipeline.init_from_url(url("file:///music/a.flac"), 0).unwrap();
    bring_up(&mut pipeline, &runtime, GraphState::Playing);
    let old_stage = runtime.stage();

    pipeline.set_next_url(url("file:///music/b.flac"), 0, 0);
    runtime.drained();
    pipeline.dispatch_pending();
    runtime.link();
    pipeline.dispatch_pending();
    drain_events(&pipeline);

    pipeline.set_next_url(url("file:///music/c.flac"), 0, 0);
    runtime.post(GraphMessage::Drained { stage: old_stage });
    pipeline.dispatch_pending();

    assert_eq!(runtime.attach_count(), 2);
    assert!(drain_events(&pipeline).is_empty());
    assert!(pipeline.has_next_valid_url());
}

#[test]
fn seek_during_replacement_is_swallowed() {
    let runtime = MockRuntime::new();
    let mut pipeline = controller(&runtime);
    pipeline.init_from_url(url("file:///music/a.flac"), 0).unwrap();
    bring_up(&mut pipeline, &runtime, GraphState::Playing);

    pipeline.set_next_url(url("file:///music/b.flac"), 0, 0);
    runtime.drained();
    pipeline.dispatch_pending();

    assert!(pipeline.seek(2 * SECOND));
    runtime.link();
    pipeline.dispatch_pending();
    assert!(runtime.seeks().is_empty());

    assert!(pipeline.seek(3 * SECOND));
    assert_eq!(runtime.seeks(), vec![3 * SECOND]);
}

#[test]
fn seek_after_relink_reaches_graph() {
    let runtime = MockRuntime::new();
    let mut pipeline = controller(&runtime);
    pipeline.init_from_url(url("file:///music/a.flac"), 0).unwrap();
    bring_up(&mut pipeline, &runtime, GraphState::Playing);

    pipeline.set_next_url(url("file:///music/b.flac"), 0, 0);
    runtime.drained();
    pipeline.dispatch_pending();
    bring_up(&mut pipeline, &runtime, GraphState::Playing);

    assert!(pipeline.seek(42 * SECOND));
    assert_eq!(runtime.seeks(), vec![42 * SECOND]);
}

#[test]
fn seek_after_rebuild_reaches_graph() {
    let runtime = MockRuntime::new();
    let mut pipeline = controller(&runtime);
    pipeline.init_from_url(url("file:///music/a.flac"), 0).unwrap();
    pipeline.request_state(GraphState::Playing);
    bring_up(&mut pipeline, &runtime, GraphState::Playing);

    pipeline.set_next_url(url("file:///music/b.flac"), SECOND, 0);
    runtime.drained();
    pipeline.dispatch_pending();
    assert_eq!(runtime.graphs_created(), 2);
    bring_up(&mut pipeline, &runtime, GraphState::Playing);
    assert_eq!(runtime.seeks(), vec![SECOND]);

    assert!(pipeline.seek(42 * SECOND));
    assert_eq!(runtime.seeks(), vec![SECOND, 42 * SECOND]);
}

#[test]
fn non_contiguous_next_rebuilds_and_seeks_to_begin() {
    let runtime = MockRuntime::new();
    let mut pipeline = controller(&runtime);
    pipeline.init_from_url(url("file:///music/a.flac"), 0).unwrap();
    pipeline.request_state(GraphState::Playing);
    bring_up(&mut pipeline, &runtime, GraphState::Playing);

    pipeline.set_next_url(url("file:///music/b.flac"), 5 * SECOND, 0);
    runtime.drained();
    pipeline.dispatch_pending();

    assert_eq!(runtime.graphs_created(), 2);
    assert_eq!(runtime.log().graphs_dropped, 1);
    assert_eq!(end_events(&drain_events(&pipeline)), vec![true]);
    assert_eq!(runtime.log().states.last(), Some(&GraphState::Playing));
    assert_eq!(pipeline.url().map(|u| u.as_str()), Some("file:///music/b.flac"));

    bring_up(&mut pipeline, &runtime, GraphState::Playing);
    assert_eq!(runtime.seeks(), vec![5 * SECOND]);
}

#[test]
fn same_source_continuation_keeps_decoding() {
    let runtime = MockRuntime::new();
    let mut pipeline = controller(&runtime);
    let album = url("file:///music/album.flac");
    pipeline.init_from_url(album.clone(), 10 * SECOND).unwrap();
    bring_up(&mut pipeline, &runtime, GraphState::Playing);

    pipeline.set_next_url(album, 10 * SECOND, 20 * SECOND);
    runtime.end_offset_reached();
    pipeline.dispatch_pending();

    assert_eq!(runtime.graphs_created(), 1);
    assert_eq!(runtime.attach_count(), 1);
    assert_eq!(pipeline.end_offset(), 20 * SECOND);
    assert_eq!(end_events(&drain_events(&pipeline)), vec![true]);
    assert!(!runtime.gate_held());

    // The next crossing, with nothing staged, ends the stream exactly once
    runtime.end_offset_reached();
    runtime.eos();
    pipeline.dispatch_pending();
    assert_eq!(end_events(&drain_events(&pipeline)), vec![false]);
}

#[test]
fn end_offset_report_for_replaced_bounds_is_ignored() {
    let runtime = MockRuntime::new();
    let mut pipeline = controller(&runtime);
    let album = url("file:///music/album.flac");
    pipeline.init_from_url(album.clone(), 10 * SECOND).unwrap();
    bring_up(&mut pipeline, &runtime, GraphState::Playing);

    let stale_generation = runtime.hooks().probe.bounds().generation();
    pipeline.set_next_url(album, 10 * SECOND, 20 * SECOND);
    runtime.end_offset_reached();
    pipeline.dispatch_pending();
    drain_events(&pipeline);

    runtime.post(GraphMessage::EndOffsetReached {
        stage: runtime.stage(),
        generation: stale_generation,
    });
    pipeline.dispatch_pending();
    assert!(drain_events(&pipeline).is_empty());
}

#[test]
fn drained_without_next_waits_for_runtime_eos() {
    let runtime = MockRuntime::new();
    let mut pipeline = controller(&runtime);
    pipeline.init_from_url(url("file:///music/a.flac"), 0).unwrap();
    bring_up(&mut pipeline, &runtime, GraphState::Playing);

    runtime.drained();
    pipeline.dispatch_pending();
    assert!(drain_events(&pipeline).is_empty());

    runtime.eos();
    runtime.eos();
    pipeline.dispatch_pending();
    assert_eq!(end_events(&drain_events(&pipeline)), vec![false]);
}
