//! Synthetic test-pattern source
//!
//! `pattern://<name>?fps=15&width=640&height=360[&fail=open][&fail_after=N]`
//!
//! Frames are produced on the wall clock at the requested rate. A caller slower
//! than that rate skips the frames it missed, the same way a camera-side buffer
//! is discarded before a real read.

use std::thread;
use std::time::{Duration, Instant};

use image::{Rgba, RgbaImage};

use super::{AcquireError, ConnectError, SourceConnection};
use crate::types::{Frame, StreamInfo};

pub const SCHEME: &str = "pattern://";

/// Accepted frame rate range; outside it the frame interval stops being a
/// usable `Duration`
pub const MIN_FPS: f64 = 0.01;
pub const MAX_FPS: f64 = 1000.0;

#[derive(Debug, Clone, PartialEq)]
pub struct PatternSpec {
    pub name: String,
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    /// Every `open` fails
    pub fail_open: bool,
    /// Stream ends after this many frames per connection
    pub fail_after: Option<u64>,
}

impl Default for PatternSpec {
    fn default() -> Self {
        Self {
            name: "pattern".to_string(),
            fps: 15.0,
            width: 640,
            height: 360,
            fail_open: false,
            fail_after: None,
        }
    }
}

impl PatternSpec {
    pub fn parse(uri: &str) -> Result<Self, String> {
        let rest = uri
            .strip_prefix(SCHEME)
            .ok_or_else(|| format!("not a pattern uri: {uri}"))?;
        let (name, query) = rest.split_once('?').unwrap_or((rest, ""));

        let mut spec = Self {
            name: if name.is_empty() { "pattern" } else { name }.to_string(),
            ..Self::default()
        };

        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let bad = || format!("bad value for `{key}`: {value:?}");
            match key {
                "fps" => spec.fps = value.parse().map_err(|_| bad())?,
                "width" => spec.width = value.parse().map_err(|_| bad())?,
                "height" => spec.height = value.parse().map_err(|_| bad())?,
                "fail" if value == "open" => spec.fail_open = true,
                "fail_after" => spec.fail_after = Some(value.parse().map_err(|_| bad())?),
                _ => return Err(format!("unknown pattern option `{key}`")),
            }
        }

        if !(MIN_FPS..=MAX_FPS).contains(&spec.fps) {
            return Err(format!("fps must be within {MIN_FPS}..={MAX_FPS}, got {}", spec.fps));
        }
        if spec.width == 0 || spec.height == 0 {
            return Err(format!("degenerate pattern {}x{}", spec.width, spec.height));
        }
        Ok(spec)
    }
}

pub struct PatternConnection {
    spec: PatternSpec,
    base_color: [u8; 3],
    opened_at: Option<Instant>,
    /// Index of the last frame handed out on this connection
    last_index: Option<u64>,
    emitted: u64,
    skipped: u64,
}

impl PatternConnection {
    pub fn new(spec: PatternSpec) -> Self {
        let base_color = color_for(&spec.name);
        Self {
            spec,
            base_color,
            opened_at: None,
            last_index: None,
            emitted: 0,
            skipped: 0,
        }
    }

    fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.spec.fps)
    }

    fn render(&self, index: u64) -> Frame {
        let (w, h) = (self.spec.width, self.spec.height);
        let [r, g, b] = self.base_color;
        let mut img = RgbaImage::from_pixel(w, h, Rgba([r, g, b, 255]));

        // Moving bar, one eighth of the width, one column step per frame
        let bar = (w / 8).max(1);
        let start = ((index * 4) % u64::from(w)) as u32;
        for x in start..(start + bar).min(w) {
            for y in 0..h {
                img.put_pixel(x, y, Rgba([255 - r, 255 - g, 255 - b, 255]));
            }
        }
        Frame::new(img)
    }
}

impl SourceConnection for PatternConnection {
    fn open(&mut self) -> Result<StreamInfo, ConnectError> {
        if self.spec.fail_open {
            return Err(ConnectError::Unreachable(format!(
                "{SCHEME}{} configured to refuse",
                self.spec.name
            )));
        }
        self.opened_at = Some(Instant::now());
        self.last_index = None;
        self.emitted = 0;
        Ok(StreamInfo {
            width: self.spec.width,
            height: self.spec.height,
            fps: Some(self.spec.fps),
        })
    }

    fn acquire_latest(&mut self) -> Result<Frame, AcquireError> {
        let Some(opened_at) = self.opened_at else {
            return Err(AcquireError::NotConnected);
        };

        if let Some(limit) = self.spec.fail_after {
            if self.emitted >= limit {
                self.close();
                return Err(AcquireError::EndOfStream);
            }
        }

        let interval = self.frame_interval();
        let mut index = (opened_at.elapsed().as_secs_f64() * self.spec.fps) as u64;

        // Wait for a frame newer than the one already handed out
        if let Some(last) = self.last_index {
            if index <= last {
                let due = opened_at + interval.mul_f64((last + 1) as f64);
                let now = Instant::now();
                if due > now {
                    thread::sleep(due - now);
                }
                index = last + 1;
            } else {
                self.skipped += index - last - 1;
            }
        }

        self.last_index = Some(index);
        self.emitted += 1;
        Ok(self.render(index))
    }

    fn close(&mut self) {
        self.opened_at = None;
    }

    fn is_connected(&self) -> bool {
        self.opened_at.is_some()
    }

    /// Frames generated but never returned because the caller was slower
    /// than the pattern rate
    fn discarded(&self) -> u64 {
        self.skipped
    }
}

/// Stable per-name tint so tiles are distinguishable
fn color_for(name: &str) -> [u8; 3] {
    let hash = name
        .bytes()
        .fold(0x811c_9dc5u32, |h, b| (h ^ u32::from(b)).wrapping_mul(0x0100_0193));
    [
        64 + (hash & 0x7f) as u8,
        64 + ((hash >> 8) & 0x7f) as u8,
        64 + ((hash >> 16) & 0x7f) as u8,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_options() {
        let spec =
            PatternSpec::parse("pattern://dock?fps=30&width=320&height=240&fail_after=5").unwrap();
        assert_eq!(spec.name, "dock");
        assert_eq!(spec.fps, 30.0);
        assert_eq!((spec.width, spec.height), (320, 240));
        assert_eq!(spec.fail_after, Some(5));
        assert!(!spec.fail_open);

        assert!(PatternSpec::parse("pattern://x?fail=open").unwrap().fail_open);
        assert!(PatternSpec::parse("pattern://x?fps=0").is_err());
        assert!(PatternSpec::parse("pattern://x?colour=red").is_err());
    }

    #[test]
    fn rejects_rates_without_a_usable_interval() {
        for fps in ["1e-300", "0.001", "-5", "inf", "NaN", "5000"] {
            let err = PatternSpec::parse(&format!("pattern://x?fps={fps}")).unwrap_err();
            assert!(err.contains("fps must be within"), "{fps}: {err}");
        }
        assert!(PatternSpec::parse("pattern://x?fps=0.01").is_ok());
        let conn = PatternConnection::new(PatternSpec::parse("pattern://x?fps=0.5").unwrap());
        assert_eq!(conn.frame_interval(), Duration::from_secs(2));
        assert!(PatternSpec::parse("pattern://x?fps=1000").is_ok());
    }

    #[test]
    fn fail_open_refuses_every_attempt() {
        let mut conn = PatternConnection::new(PatternSpec::parse("pattern://b?fail=open").unwrap());
        for _ in 0..3 {
            assert!(matches!(conn.open(), Err(ConnectError::Unreachable(_))));
        }
        assert!(!conn.is_connected());
    }

    #[test]
    fn ends_after_limit_and_disconnects() {
        let spec = PatternSpec::parse("pattern://c?fps=200&width=8&height=8&fail_after=2").unwrap();
        let mut conn = PatternConnection::new(spec);
        conn.open().unwrap();
        assert!(conn.acquire_latest().is_ok());
        assert!(conn.acquire_latest().is_ok());
        assert!(matches!(conn.acquire_latest(), Err(AcquireError::EndOfStream)));
        assert!(!conn.is_connected());
    }

    #[test]
    fn slow_reader_skips_stale_frames() {
        let spec = PatternSpec::parse("pattern://d?fps=200&width=8&height=8").unwrap();
        let mut conn = PatternConnection::new(spec);
        conn.open().unwrap();
        conn.acquire_latest().unwrap();
        thread::sleep(Duration::from_millis(60));
        conn.acquire_latest().unwrap();
        assert!(conn.discarded() > 0);
    }

    #[test]
    fn acquire_before_open_is_not_connected() {
        let mut conn = PatternConnection::new(PatternSpec::default());
        assert!(matches!(conn.acquire_latest(), Err(AcquireError::NotConnected)));
    }
}
