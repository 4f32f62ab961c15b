//! Scripted connections and instrumented detectors shared by the
//! integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use image::RgbaImage;
use multicam_sentinel::input::{AcquireError, ConnectError, SourceConnection};
use multicam_sentinel::{BBox, CameraSource, Detection, Detector, Frame, StopSignal, StreamInfo};

/// Shared counters a test keeps after handing the connection to a worker
#[derive(Clone, Default)]
pub struct Tally {
    pub opens: Arc<AtomicU32>,
    pub acquired: Arc<AtomicU64>,
}

impl Tally {
    pub fn opens(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn acquired(&self) -> u64 {
        self.acquired.load(Ordering::SeqCst)
    }
}

/// Frame whose first pixel encodes `n` (little endian, 24 bits)
pub fn numbered_frame(n: u64) -> Frame {
    Frame::solid(4, 4, [n as u8, (n >> 8) as u8, (n >> 16) as u8, 255])
}

pub fn frame_number(frame: &Frame) -> u64 {
    let [a, b, c, _] = frame.image().get_pixel(0, 0).0;
    u64::from(a) | u64::from(b) << 8 | u64::from(c) << 16
}

pub struct ScriptedConnection {
    tally: Tally,
    /// Opens that succeed before every later one fails
    good_opens: u32,
    /// Frames served after which reads time out
    frame_limit: Option<u64>,
    frame_delay: Duration,
    /// Stale frames thrown away before every read
    discards_per_read: u64,
    discarded: u64,
    /// `open` blocks until the bound stop signal fires
    stall_open: bool,
    stop: Option<StopSignal>,
    served: u64,
    connected: bool,
}

impl ScriptedConnection {
    pub fn healthy(tally: Tally) -> Self {
        Self {
            tally,
            good_opens: u32::MAX,
            frame_limit: None,
            frame_delay: Duration::from_millis(2),
            discards_per_read: 0,
            discarded: 0,
            stall_open: false,
            stop: None,
            served: 0,
            connected: false,
        }
    }

    pub fn never_opens(tally: Tally) -> Self {
        Self {
            good_opens: 0,
            ..Self::healthy(tally)
        }
    }

    /// One good session of `frames` frames, then a dead source
    pub fn finite(tally: Tally, frames: u64) -> Self {
        Self {
            good_opens: 1,
            frame_limit: Some(frames),
            ..Self::healthy(tally)
        }
    }

    /// Healthy, but the camera outruns the reader by `n` frames per read
    pub fn lagging(tally: Tally, n: u64) -> Self {
        Self {
            discards_per_read: n,
            ..Self::healthy(tally)
        }
    }

    /// A camera that accepts the connection but never sends a frame
    pub fn stalls_on_open(tally: Tally) -> Self {
        Self {
            stall_open: true,
            ..Self::healthy(tally)
        }
    }
}

impl SourceConnection for ScriptedConnection {
    fn open(&mut self) -> Result<StreamInfo, ConnectError> {
        let n = self.tally.opens.fetch_add(1, Ordering::SeqCst) + 1;
        if self.stall_open {
            let stopped = self
                .stop
                .as_ref()
                .is_some_and(|stop| stop.wait(Duration::from_secs(30)));
            return Err(if stopped {
                ConnectError::Stopped
            } else {
                ConnectError::Timeout(Duration::from_secs(30))
            });
        }
        if n > self.good_opens {
            return Err(ConnectError::Unreachable(format!("scripted failure #{n}")));
        }
        self.connected = true;
        Ok(StreamInfo {
            width: 4,
            height: 4,
            fps: Some(500.0),
        })
    }

    fn acquire_latest(&mut self) -> Result<Frame, AcquireError> {
        if !self.connected {
            return Err(AcquireError::NotConnected);
        }
        if self.frame_limit.is_some_and(|limit| self.served >= limit) {
            thread::sleep(Duration::from_millis(5));
            self.connected = false;
            return Err(AcquireError::Timeout(Duration::from_millis(5)));
        }
        thread::sleep(self.frame_delay);
        self.discarded += self.discards_per_read;
        self.served += 1;
        self.tally.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(numbered_frame(self.served))
    }

    fn close(&mut self) {
        self.connected = false;
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn bind_stop(&mut self, stop: StopSignal) {
        self.stop = Some(stop);
    }

    fn discarded(&self) -> u64 {
        self.discarded
    }
}

pub fn source(id: &str) -> CameraSource {
    CameraSource::new(id, format!("scripted://{id}"))
}

// ========== Detectors ==========

/// Records entry/exit instants of every call; holds the call for `busy`.
#[derive(Clone)]
pub struct IntervalRecorder {
    pub intervals: Arc<Mutex<Vec<(Instant, Instant)>>>,
    pub busy: Duration,
}

impl IntervalRecorder {
    pub fn new(busy: Duration) -> Self {
        Self {
            intervals: Arc::default(),
            busy,
        }
    }

    pub fn len(&self) -> usize {
        self.intervals.lock().unwrap().len()
    }
}

impl Detector for IntervalRecorder {
    fn detect(&mut self, _image: &RgbaImage) -> anyhow::Result<Vec<Detection>> {
        let entered = Instant::now();
        thread::sleep(self.busy);
        let exited = Instant::now();
        self.intervals.lock().unwrap().push((entered, exited));
        Ok(Vec::new())
    }

    fn name(&self) -> &str {
        "interval-recorder"
    }
}

/// Always sees one person in the middle of the frame
pub struct OnePerson;

impl Detector for OnePerson {
    fn detect(&mut self, image: &RgbaImage) -> anyhow::Result<Vec<Detection>> {
        let (w, h) = (image.width() as f32, image.height() as f32);
        Ok(vec![Detection::new(
            BBox::new(w * 0.25, h * 0.25, w * 0.75, h * 0.75),
            "person",
            0.9,
        )])
    }
}

pub struct AlwaysFails;

impl Detector for AlwaysFails {
    fn detect(&mut self, _image: &RgbaImage) -> anyhow::Result<Vec<Detection>> {
        anyhow::bail!("backend unavailable")
    }
}

/// Polls `cond` every 5 ms for up to 5 s.
pub fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}
