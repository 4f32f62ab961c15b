//! Camera worker: one source, one thread, one frame slot
//!
//! ```text
//! Disconnected → Connecting → Streaming
//!                    ↑   ↓        ↓ acquire failed
//!                Reconnecting ←───┘
//!                    ↓ attempts exhausted / stop
//!                 Stopped
//! ```
//! The worker is the only place reconnect policy lives. Everyone else reads
//! `connected` / `last_error` from its stats.

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Utc;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::fanout::{FanoutDistributor, FanoutItem};
use super::slot::FrameSlot;
use super::stats::{FpsCounter, WorkerState, WorkerStats};
use crate::detection::DetectionPipeline;
use crate::input::{AcquireError, ConnectError, SourceConnection};
use crate::signal::StopSignal;
use crate::types::{CameraSource, Frame};

// ========== Reconnect policy ==========

/// Capped exponential backoff with proportional jitter
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Backoff {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub factor: f64,
    /// Fraction of the delay added or removed at random, 0 disables
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_ms: 500,
            max_ms: 5000,
            factor: 2.0,
            jitter: 0.1,
        }
    }
}

impl Backoff {
    pub fn fixed(delay: Duration) -> Self {
        let ms = delay.as_millis() as u64;
        Self {
            initial_ms: ms,
            max_ms: ms,
            factor: 1.0,
            jitter: 0.0,
        }
    }

    /// Delay before retry number `attempt` (1-based), without jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let ms = (self.initial_ms as f64 * self.factor.max(1.0).powi(exp)).min(self.max_ms as f64);
        Duration::from_millis(ms as u64)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let j = self.jitter.min(1.0);
        let scale = rand::thread_rng().gen_range(1.0 - j..=1.0 + j);
        base.mul_f64(scale)
    }

    /// Longest delay this policy can produce
    pub fn ceiling(&self) -> Duration {
        Duration::from_millis(self.max_ms).mul_f64(1.0 + self.jitter.clamp(0.0, 1.0))
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Consecutive failed opens before the worker gives up, first included
    pub max_reconnect_attempts: u32,
    pub backoff: Backoff,
    /// Pause after each published frame; bounds CPU when the source is slow
    pub idle_sleep: Duration,
    pub fps_window: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 5,
            backoff: Backoff::default(),
            idle_sleep: Duration::from_millis(5),
            fps_window: Duration::from_secs(1),
        }
    }
}

// ========== Worker ==========

enum StreamEnd {
    Stopped,
    Failed(AcquireError),
}

pub struct CameraWorker {
    source: CameraSource,
    connection: Box<dyn SourceConnection>,
    pipeline: Arc<DetectionPipeline>,
    fanout: FanoutDistributor,
    config: WorkerConfig,
    slot: Arc<FrameSlot>,
    stats: Arc<Mutex<WorkerStats>>,
    stop: StopSignal,
    source_key: Arc<str>,
    sequence: u64,
    fps: FpsCounter,
    /// Connection discard counter as of the last read
    seen_discarded: u64,
}

impl CameraWorker {
    pub fn new(
        source: CameraSource,
        mut connection: Box<dyn SourceConnection>,
        pipeline: Arc<DetectionPipeline>,
        fanout: FanoutDistributor,
        config: WorkerConfig,
    ) -> Self {
        let stats = Arc::new(Mutex::new(WorkerStats::new(source.id.clone())));
        let fps = FpsCounter::new(config.fps_window);
        let stop = StopSignal::new();
        // A blocking open returns early once this fires
        connection.bind_stop(stop.clone());
        Self {
            source_key: Arc::from(source.id.as_str()),
            source,
            connection,
            pipeline,
            fanout,
            config,
            slot: Arc::new(FrameSlot::new()),
            stats,
            stop,
            sequence: 0,
            fps,
            seen_discarded: 0,
        }
    }

    /// Starts the acquisition loop on a dedicated named thread.
    pub fn spawn(self) -> std::io::Result<WorkerHandle> {
        let source_id = self.source.id.clone();
        let stop = self.stop.clone();
        let slot = self.slot.clone();
        let stats = self.stats.clone();
        let (done_tx, done_rx) = bounded::<()>(0);

        let join = thread::Builder::new()
            .name(format!("cam-{source_id}"))
            .spawn(move || {
                // Dropped on exit, panics included
                let _done = done_tx;
                self.run();
            })?;

        Ok(WorkerHandle {
            source_id,
            stop,
            slot,
            stats,
            join: Some(join),
            done: done_rx,
        })
    }

    fn stats(&self) -> MutexGuard<'_, WorkerStats> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: WorkerState) {
        let mut stats = self.stats();
        stats.state = state;
        stats.connected = state == WorkerState::Streaming;
    }

    fn run(mut self) {
        let id = self.source.id.clone();
        info!(source_id = %id, uri = %self.source.redacted_uri(), "worker started");

        let mut failed_opens: u32 = 0;
        let mut exhausted = false;

        while !self.stop.is_stopped() {
            self.set_state(WorkerState::Connecting);
            match self.connection.open() {
                Ok(info) => {
                    failed_opens = 0;
                    if self.stop.is_stopped() {
                        break;
                    }
                    info!(
                        source_id = %id,
                        width = info.width,
                        height = info.height,
                        fps = ?info.fps,
                        "stream connected"
                    );
                    {
                        let mut stats = self.stats();
                        stats.resolution = Some(info);
                        stats.last_error = None;
                    }
                    self.set_state(WorkerState::Streaming);
                    self.fps.reset();

                    match self.stream() {
                        StreamEnd::Stopped => break,
                        StreamEnd::Failed(e) => {
                            self.connection.close();
                            warn!(source_id = %id, error = %e, "stream lost, reconnecting");
                            {
                                let mut stats = self.stats();
                                stats.frames_dropped += 1;
                                stats.reconnects += 1;
                                stats.current_fps = 0.0;
                                stats.last_error = Some(e.to_string());
                            }
                            self.set_state(WorkerState::Reconnecting);
                            if self.stop.wait(self.config.backoff.delay(1)) {
                                break;
                            }
                        }
                    }
                }
                Err(ConnectError::Stopped) => break,
                Err(_) if self.stop.is_stopped() => break,
                Err(e) => {
                    failed_opens += 1;
                    self.connection.close();
                    if failed_opens >= self.config.max_reconnect_attempts {
                        error!(
                            source_id = %id,
                            attempts = failed_opens,
                            error = %e,
                            "giving up on source"
                        );
                        self.stats().last_error =
                            Some(format!("gave up after {failed_opens} attempts: {e}"));
                        exhausted = true;
                        break;
                    }

                    let delay = self.config.backoff.delay(failed_opens);
                    warn!(
                        source_id = %id,
                        attempt = failed_opens,
                        max = self.config.max_reconnect_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "open failed"
                    );
                    self.stats().last_error = Some(e.to_string());
                    self.set_state(WorkerState::Reconnecting);
                    if self.stop.wait(delay) {
                        break;
                    }
                }
            }
        }

        self.connection.close();
        if exhausted {
            // Dead source shows as a blank tile
            self.slot.invalidate();
        }
        {
            let mut stats = self.stats();
            stats.state = WorkerState::Stopped;
            stats.connected = false;
            stats.current_fps = 0.0;
        }
        info!(source_id = %id, frames = self.sequence, exhausted, "worker stopped");
    }

    /// Streaming loop. Returns when stopped or when the source fails.
    fn stream(&mut self) -> StreamEnd {
        loop {
            if self.stop.is_stopped() {
                return StreamEnd::Stopped;
            }
            let acquired = self.connection.acquire_latest();
            self.count_discards();
            let frame = match acquired {
                Ok(frame) => frame,
                Err(e) => return StreamEnd::Failed(e),
            };
            if self.stop.is_stopped() {
                return StreamEnd::Stopped;
            }

            self.publish(frame);

            if self.stop.wait(self.config.idle_sleep) {
                return StreamEnd::Stopped;
            }
        }
    }

    /// Frames the connection threw away to stay fresh count as dropped
    fn count_discards(&mut self) {
        let total = self.connection.discarded();
        let delta = total.saturating_sub(self.seen_discarded);
        self.seen_discarded = total;
        if delta > 0 {
            self.stats().frames_dropped += delta;
        }
    }

    /// analyze → slot → fan-out → stats
    fn publish(&mut self, frame: Frame) {
        let captured_at = Utc::now();
        self.sequence += 1;

        let (output, detections, failed) = match self.pipeline.analyze(&frame) {
            Ok(analysis) => (analysis.output_frame(&frame), analysis.detections, false),
            Err(e) => {
                let errors = self.stats().analysis_errors + 1;
                // First failure is worth a warning, the rest are noise
                if errors == 1 || errors % 100 == 0 {
                    warn!(source_id = %self.source.id, errors, error = %e, "analysis failed, forwarding raw frame");
                } else {
                    debug!(source_id = %self.source.id, error = %e, "analysis failed");
                }
                (frame, Vec::new(), true)
            }
        };
        let detections = Arc::new(detections);

        self.slot
            .publish(output.clone(), detections.clone(), self.sequence, captured_at);
        self.fanout.publish(FanoutItem {
            source_id: self.source_key.clone(),
            sequence: self.sequence,
            frame: output,
            detections: detections.clone(),
            captured_at,
        });

        let fps = self.fps.tick(Instant::now());
        let mut stats = self.stats();
        stats.frames_acquired += 1;
        stats.detections_total += detections.len() as u64;
        if !detections.is_empty() {
            stats.frames_with_detections += 1;
        }
        if failed {
            stats.analysis_errors += 1;
        }
        stats.current_fps = fps;
        stats.last_frame_at = Some(captured_at);
    }
}

// ========== Handle ==========

/// Owner-side view of a running worker
pub struct WorkerHandle {
    source_id: String,
    stop: StopSignal,
    slot: Arc<FrameSlot>,
    stats: Arc<Mutex<WorkerStats>>,
    join: Option<JoinHandle<()>>,
    done: Receiver<()>,
}

impl WorkerHandle {
    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn slot(&self) -> &Arc<FrameSlot> {
        &self.slot
    }

    /// Point-in-time copy
    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn state(&self) -> WorkerState {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).state
    }

    pub fn request_stop(&self) {
        self.stop.stop();
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map_or(true, |j| j.is_finished())
    }

    /// Waits for the thread until `deadline`. Returns `false` and detaches
    /// the thread if it is still running then.
    pub fn join_until(&mut self, deadline: Instant) -> bool {
        let Some(join) = self.join.take() else {
            return true;
        };
        let timeout = deadline.saturating_duration_since(Instant::now());
        match self.done.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => {
                warn!(source_id = %self.source_id, "worker did not stop in time, abandoning thread");
                drop(join);
                false
            }
            _ => {
                if join.join().is_err() {
                    error!(source_id = %self.source_id, "worker thread panicked");
                }
                true
            }
        }
    }

    /// Signals stop and waits up to `timeout`.
    pub fn stop(&mut self, timeout: Duration) -> bool {
        self.request_stop();
        self.join_until(Instant::now() + timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let b = Backoff {
            jitter: 0.0,
            ..Backoff::default()
        };
        assert_eq!(b.delay(1), Duration::from_millis(500));
        assert_eq!(b.delay(2), Duration::from_millis(1000));
        assert_eq!(b.delay(3), Duration::from_millis(2000));
        assert_eq!(b.delay(5), Duration::from_millis(5000));
        assert_eq!(b.delay(60), Duration::from_millis(5000));
    }

    #[test]
    fn jitter_stays_in_band() {
        let b = Backoff::default();
        for _ in 0..100 {
            let d = b.delay(2).as_millis();
            assert!((900..=1100).contains(&d), "{d}");
        }
        assert!((b.ceiling().as_millis() as i64 - 5500).abs() <= 1);
    }

    #[test]
    fn fixed_backoff_never_changes() {
        let b = Backoff::fixed(Duration::from_millis(20));
        assert_eq!(b.delay(1), b.delay(10));
    }
}
