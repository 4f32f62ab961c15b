mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{frame_number, source, wait_for, AlwaysFails, OnePerson, Tally, ScriptedConnection};
use multicam_sentinel::pipeline::{Backoff, CameraWorker, WorkerHandle};
use multicam_sentinel::{
    DetectionPipeline, FanoutDistributor, PipelineConfig, SourceConnection, WorkerConfig,
    WorkerState,
};

fn config(max_attempts: u32, backoff: Backoff) -> WorkerConfig {
    WorkerConfig {
        max_reconnect_attempts: max_attempts,
        backoff,
        idle_sleep: Duration::from_millis(1),
        ..WorkerConfig::default()
    }
}

fn spawn(
    id: &str,
    connection: impl SourceConnection + 'static,
    pipeline: DetectionPipeline,
    fanout: &FanoutDistributor,
    config: WorkerConfig,
) -> WorkerHandle {
    CameraWorker::new(
        source(id),
        Box::new(connection),
        Arc::new(pipeline),
        fanout.clone(),
        config,
    )
    .spawn()
    .unwrap()
}

#[test]
fn slot_sequence_matches_frames_acquired() {
    const N: u64 = 25;
    let tally = Tally::default();
    let fanout = FanoutDistributor::new(64);
    let feed = fanout.subscribe("check");
    let mut handle = spawn(
        "fresh",
        ScriptedConnection::finite(tally.clone(), N),
        DetectionPipeline::passthrough(),
        &fanout,
        // Long backoff parks the worker in Reconnecting after the last frame
        config(5, Backoff::fixed(Duration::from_secs(10))),
    );

    assert!(wait_for(|| handle.state() == WorkerState::Reconnecting));
    assert_eq!(tally.acquired(), N);

    let latest = handle.slot().read_latest().expect("slot holds the last frame");
    assert_eq!(latest.sequence, N);
    assert_eq!(frame_number(&latest.frame), N);

    let seqs: Vec<u64> = feed.drain().iter().map(|i| i.sequence).collect();
    assert_eq!(seqs, (1..=N).collect::<Vec<_>>());

    let stats = handle.stats();
    assert_eq!(stats.frames_acquired, N);
    assert_eq!(stats.reconnects, 1);
    assert!(!stats.connected);
    assert!(stats.last_error.is_some());

    assert!(handle.stop(Duration::from_secs(2)));
    // Operator stop keeps the last frame readable
    assert_eq!(handle.slot().read_latest().map(|l| l.sequence), Some(N));
}

#[test]
fn gives_up_after_max_attempts() {
    let tally = Tally::default();
    let fanout = FanoutDistributor::default();
    let mut handle = spawn(
        "dead",
        ScriptedConnection::never_opens(tally.clone()),
        DetectionPipeline::passthrough(),
        &fanout,
        config(3, Backoff::fixed(Duration::from_millis(5))),
    );

    assert!(wait_for(|| handle.is_finished()));
    assert_eq!(tally.opens(), 3);

    let stats = handle.stats();
    assert_eq!(stats.state, WorkerState::Stopped);
    assert!(!stats.connected);
    assert!(stats.last_error.as_deref().unwrap_or_default().contains("gave up after 3"));
    assert!(handle.slot().read_latest().is_none());
    assert!(handle.stop(Duration::from_secs(1)));

    // Nothing keeps trying in the background
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(tally.opens(), 3);
}

#[test]
fn exhaustion_hides_previous_frame() {
    let tally = Tally::default();
    let fanout = FanoutDistributor::default();
    let handle = spawn(
        "fading",
        ScriptedConnection::finite(tally.clone(), 3),
        DetectionPipeline::passthrough(),
        &fanout,
        config(2, Backoff::fixed(Duration::from_millis(5))),
    );
    assert!(wait_for(|| handle.is_finished()));
    // One good session, then two failed opens
    assert_eq!(tally.opens(), 3);
    assert!(handle.slot().read_latest().is_none());
    assert_eq!(handle.slot().sequence(), 3);
}

#[test]
fn stop_during_backoff_returns_promptly() {
    let backoff = Backoff::fixed(Duration::from_millis(400));
    let fanout = FanoutDistributor::default();
    let mut handle = spawn(
        "sleepy",
        ScriptedConnection::never_opens(Tally::default()),
        DetectionPipeline::passthrough(),
        &fanout,
        config(100, backoff),
    );
    assert!(wait_for(|| handle.state() == WorkerState::Reconnecting));

    let t = Instant::now();
    assert!(handle.stop(Duration::from_secs(5)));
    assert!(t.elapsed() <= backoff.ceiling() * 2, "{:?}", t.elapsed());
    assert_eq!(handle.state(), WorkerState::Stopped);
}

#[test]
fn detections_are_counted_and_frames_annotated() {
    let fanout = FanoutDistributor::new(16);
    let feed = fanout.subscribe("events");
    let pipeline = DetectionPipeline::new(Box::new(OnePerson), PipelineConfig::default());
    let mut handle = spawn(
        "busy",
        ScriptedConnection::healthy(Tally::default()),
        pipeline,
        &fanout,
        config(5, Backoff::default()),
    );

    assert!(wait_for(|| handle.stats().frames_acquired >= 5));
    assert!(handle.stop(Duration::from_secs(2)));

    let stats = handle.stats();
    assert_eq!(stats.detections_total, stats.frames_acquired);
    assert_eq!(stats.frames_with_detections, stats.frames_acquired);
    assert_eq!(stats.analysis_errors, 0);

    let item = feed.next().expect("published item");
    assert_eq!(item.detections.len(), 1);
    assert_eq!(item.detections[0].class_label, "person");
    // Annotated copy, not the acquired frame
    assert_ne!(item.frame.image().as_raw(), common::numbered_frame(item.sequence).image().as_raw());
}

#[test]
fn analysis_failure_forwards_raw_frame() {
    let fanout = FanoutDistributor::new(16);
    let feed = fanout.subscribe("raw");
    let pipeline = DetectionPipeline::new(Box::new(AlwaysFails), PipelineConfig::default());
    let mut handle = spawn(
        "blind",
        ScriptedConnection::healthy(Tally::default()),
        pipeline,
        &fanout,
        config(5, Backoff::default()),
    );

    assert!(wait_for(|| handle.stats().frames_acquired >= 3));
    assert_eq!(handle.state(), WorkerState::Streaming);
    assert!(handle.stop(Duration::from_secs(2)));

    let stats = handle.stats();
    assert_eq!(stats.analysis_errors, stats.frames_acquired);
    assert_eq!(stats.detections_total, 0);

    let item = feed.next().expect("raw frame still published");
    assert!(item.detections.is_empty());
    assert_eq!(frame_number(&item.frame), item.sequence);
}

#[test]
fn stale_frames_count_as_dropped() {
    let fanout = FanoutDistributor::default();
    let mut handle = spawn(
        "lagging",
        ScriptedConnection::lagging(Tally::default(), 3),
        DetectionPipeline::passthrough(),
        &fanout,
        config(5, Backoff::default()),
    );

    assert!(wait_for(|| handle.stats().frames_acquired >= 5));
    assert!(handle.stop(Duration::from_secs(2)));

    let stats = handle.stats();
    // The read that raced with stop may be counted without being published
    assert!(stats.frames_dropped >= 3 * stats.frames_acquired, "{stats:?}");
    assert!(stats.frames_dropped <= 3 * (stats.frames_acquired + 1), "{stats:?}");
}

#[test]
fn fresh_reads_drop_nothing() {
    let fanout = FanoutDistributor::default();
    let mut handle = spawn(
        "steady",
        ScriptedConnection::healthy(Tally::default()),
        DetectionPipeline::passthrough(),
        &fanout,
        config(5, Backoff::default()),
    );
    assert!(wait_for(|| handle.stats().frames_acquired >= 5));
    assert!(handle.stop(Duration::from_secs(2)));
    assert_eq!(handle.stats().frames_dropped, 0);
}

#[test]
fn stop_cuts_a_stalled_open_short() {
    let tally = Tally::default();
    let fanout = FanoutDistributor::default();
    let mut handle = spawn(
        "silent",
        ScriptedConnection::stalls_on_open(tally.clone()),
        DetectionPipeline::passthrough(),
        &fanout,
        config(1, Backoff::default()),
    );
    assert!(wait_for(|| tally.opens() == 1 && handle.state() == WorkerState::Connecting));

    let t = Instant::now();
    assert!(handle.stop(Duration::from_secs(5)));
    assert!(t.elapsed() < Duration::from_secs(2), "{:?}", t.elapsed());

    let stats = handle.stats();
    assert_eq!(stats.state, WorkerState::Stopped);
    // An interrupted open is not a failed attempt
    assert!(stats.last_error.is_none());
    assert_eq!(tally.opens(), 1);
}
