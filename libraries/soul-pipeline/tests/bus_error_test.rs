//! Error and metadata dispatch tests

mod common;

use common::{bring_up, controller, drain_events, url, MockRuntime};
use soul_pipeline::graph::{tags, BusMessage, GraphMessage, MessageSource, TagList};
use soul_pipeline::types::{resource_error, stream_error, ErrorDomain};
use soul_pipeline::{GraphState, MetaBundle, PipelineEvent, PipelineLifecycle};

fn errors(events: &[PipelineEvent]) -> Vec<(String, i32, i32)> {
    events
        .iter()
        .filter_map(|event| match event {
            PipelineEvent::Error {
                message,
                domain,
                code,
                ..
            } => Some((message.clone(), *domain, *code)),
            _ => None,
        })
        .collect()
}

#[test]
fn first_error_is_reported_verbatim_and_invalidates() {
    let runtime = MockRuntime::new();
    let mut pipeline = controller(&runtime);
    pipeline.init_from_url(url("file:///music/a.flac"), 0).unwrap();
    bring_up(&mut pipeline, &runtime, GraphState::Playing);

    runtime.error("Could not decode stream");
    runtime.post(BusMessage::error(
        MessageSource::Element("sink".to_string()),
        ErrorDomain::Resource,
        resource_error::WRITE,
        "Output device vanished",
        None,
    ));
    pipeline.dispatch_pending();

    let reported = errors(&drain_events(&pipeline));
    assert_eq!(
        reported,
        vec![(
            "Could not decode stream".to_string(),
            ErrorDomain::Stream.code(),
            stream_error::DECODE
        )]
    );
    assert!(!pipeline.is_valid());
    assert_eq!(pipeline.lifecycle(), PipelineLifecycle::Invalid);
}

#[test]
fn invalid_pipeline_stops_gapless_handover() {
    let runtime = MockRuntime::new();
    let mut pipeline = controller(&runtime);
    pipeline.init_from_url(url("file:///music/a.flac"), 0).unwrap();
    bring_up(&mut pipeline, &runtime, GraphState::Playing);
    pipeline.set_next_url(url("file:///music/b.flac"), 0, 0);

    runtime.error("Could not decode stream");
    pipeline.dispatch_pending();
    assert!(!pipeline.has_next_valid_url());
    assert!(!runtime.gate_held());

    pipeline.set_next_url(url("file:///music/c.flac"), 0, 0);
    runtime.drained();
    pipeline.dispatch_pending();
    assert_eq!(runtime.attach_count(), 1);
}

#[test]
fn link_failure_is_an_error() {
    let runtime = MockRuntime::new();
    let mut pipeline = controller(&runtime);
    pipeline.init_from_url(url("file:///music/a.flac"), 0).unwrap();

    runtime.post(GraphMessage::LinkFailed {
        stage: runtime.stage(),
        reason: "no compatible format".to_string(),
    });
    pipeline.dispatch_pending();

    assert_eq!(errors(&drain_events(&pipeline)).len(), 1);
    assert!(!pipeline.is_valid());
}

#[test]
fn tags_become_trimmed_metadata() {
    let runtime = MockRuntime::new();
    let mut pipeline = controller(&runtime);
    pipeline.init_from_url(url("file:///music/a.flac"), 0).unwrap();
    bring_up(&mut pipeline, &runtime, GraphState::Playing);

    runtime.tags(
        TagList::new()
            .with(tags::TITLE, "  Blue Monday ")
            .with(tags::ARTIST, "New Order")
            .with(tags::TRACK_GAIN, "-6.5 dB"),
    );
    runtime.tags(TagList::new().with(tags::TRACK_GAIN, "-6.5 dB"));
    pipeline.dispatch_pending();

    let bundles: Vec<MetaBundle> = drain_events(&pipeline)
        .into_iter()
        .filter_map(|event| match event {
            PipelineEvent::MetadataFound { bundle, .. } => Some(bundle),
            _ => None,
        })
        .collect();
    assert_eq!(
        bundles,
        vec![MetaBundle {
            title: "Blue Monday".to_string(),
            artist: "New Order".to_string(),
            album: String::new(),
            comment: String::new(),
        }]
    );
}

#[test]
fn events_carry_pipeline_id() {
    let runtime = MockRuntime::new();
    let mut pipeline = controller(&runtime);
    pipeline.init_from_url(url("file:///music/a.flac"), 0).unwrap();
    bring_up(&mut pipeline, &runtime, GraphState::Playing);

    runtime.tags(TagList::new().with(tags::ALBUM, "Power, Corruption & Lies"));
    runtime.eos();
    pipeline.dispatch_pending();

    let events = drain_events(&pipeline);
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| e.pipeline_id() == pipeline.id()));
}
