//! Per-worker statistics

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::types::StreamInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Disconnected,
    Connecting,
    Streaming,
    Reconnecting,
    Stopped,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerState::Disconnected => "disconnected",
            WorkerState::Connecting => "connecting",
            WorkerState::Streaming => "streaming",
            WorkerState::Reconnecting => "reconnecting",
            WorkerState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Snapshot of one worker. Only its owning worker writes it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStats {
    pub source_id: String,
    pub state: WorkerState,
    pub connected: bool,
    pub frames_acquired: u64,
    /// Stale frames discarded before a read, plus failed reads
    pub frames_dropped: u64,
    /// Total detections across all analyzed frames
    pub detections_total: u64,
    /// Frames that contained at least one detection
    pub frames_with_detections: u64,
    pub analysis_errors: u64,
    pub reconnects: u64,
    pub current_fps: f64,
    pub last_error: Option<String>,
    pub last_frame_at: Option<DateTime<Utc>>,
    pub resolution: Option<StreamInfo>,
}

impl WorkerStats {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            state: WorkerState::Disconnected,
            connected: false,
            frames_acquired: 0,
            frames_dropped: 0,
            detections_total: 0,
            frames_with_detections: 0,
            analysis_errors: 0,
            reconnects: 0,
            current_fps: 0.0,
            last_error: None,
            last_frame_at: None,
            resolution: None,
        }
    }

    /// One-line summary for periodic logging
    pub fn summary(&self) -> String {
        let mut line = format!(
            "[{}] {} | frames {} | dropped {} | fps {:.1} | detections {} in {} frames",
            self.source_id,
            self.state,
            self.frames_acquired,
            self.frames_dropped,
            self.current_fps,
            self.detections_total,
            self.frames_with_detections,
        );
        if let Some(res) = &self.resolution {
            line.push_str(&format!(" | {}x{}", res.width, res.height));
        }
        if let Some(err) = &self.last_error {
            line.push_str(&format!(" | last error: {err}"));
        }
        line
    }
}

/// Frame rate over a sliding time window
#[derive(Debug)]
pub struct FpsCounter {
    window: Duration,
    stamps: VecDeque<Instant>,
}

impl Default for FpsCounter {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl FpsCounter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            stamps: VecDeque::new(),
        }
    }

    /// Records one frame at `now` and returns the current rate.
    pub fn tick(&mut self, now: Instant) -> f64 {
        self.stamps.push_back(now);
        self.rate(now)
    }

    /// Frames per second within the window ending at `now`
    pub fn rate(&mut self, now: Instant) -> f64 {
        while let Some(&front) = self.stamps.front() {
            if now.duration_since(front) > self.window {
                self.stamps.pop_front();
            } else {
                break;
            }
        }
        self.stamps.len() as f64 / self.window.as_secs_f64()
    }

    pub fn reset(&mut self) {
        self.stamps.clear();
    }
}
