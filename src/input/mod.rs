/// 视频输入系统 (Video Input System)
///
/// One `SourceConnection` owns one camera handle. Retry policy is not here:
/// connections report failures and the camera worker decides what to do.
/// - `pattern`: synthetic test-pattern source, always available
/// - `handoff`: reader side of a decode thread's frame queue
/// - `decoder` + `decode_filter`: FFmpeg RTSP/file source (feature `ffmpeg`)
pub mod handoff;
pub mod pattern;

#[cfg(feature = "ffmpeg")]
pub mod decode_filter;
#[cfg(feature = "ffmpeg")]
pub mod decoder;

use std::time::Duration;

use thiserror::Error;

use crate::signal::StopSignal;
use crate::types::{CameraSource, Frame, StreamInfo};

pub use pattern::{PatternConnection, PatternSpec};

#[cfg(feature = "ffmpeg")]
pub use decoder::RtspConnection;

/// Failure to open a source. Recoverable by reconnecting with backoff.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("source unreachable: {0}")]
    Unreachable(String),

    #[error("unsupported source: {0}")]
    Unsupported(String),

    #[error("no frame within {0:?} of opening")]
    Timeout(Duration),

    #[error("connection closed by stop request")]
    Stopped,
}

/// Mid-stream read failure. Always leaves the connection disconnected.
#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("end of stream")]
    EndOfStream,

    #[error("decode failure: {0}")]
    Decode(String),

    #[error("no frame within {0:?}")]
    Timeout(Duration),

    #[error("not connected")]
    NotConnected,
}

/// A single camera handle.
///
/// `acquire_latest` may block on I/O, but never longer than the connection's
/// own read timeout.
pub trait SourceConnection: Send {
    /// Opens the handle with the smallest transport-side buffering available.
    /// Failures are reported, never retried internally.
    fn open(&mut self) -> Result<StreamInfo, ConnectError>;

    /// Discards whatever is queued inside the decode pipeline and returns the
    /// newest frame. Any error implies `is_connected() == false`.
    fn acquire_latest(&mut self) -> Result<Frame, AcquireError>;

    /// Releases all resources. Idempotent.
    fn close(&mut self);

    fn is_connected(&self) -> bool;

    /// Gives a slow `open` a way out: once `stop` fires it returns
    /// `ConnectError::Stopped`. Called once, before the first `open`.
    fn bind_stop(&mut self, _stop: StopSignal) {}

    /// Frames thrown away by the discard step since creation
    fn discarded(&self) -> u64 {
        0
    }
}

/// Builds a fresh connection for a source. Called once per worker.
pub trait ConnectionFactory: Send + Sync {
    fn connect(&self, source: &CameraSource) -> Box<dyn SourceConnection>;
}

impl<F> ConnectionFactory for F
where
    F: Fn(&CameraSource) -> Box<dyn SourceConnection> + Send + Sync,
{
    fn connect(&self, source: &CameraSource) -> Box<dyn SourceConnection> {
        self(source)
    }
}

/// Routes URIs by scheme: `pattern://` to the synthetic source, everything
/// else to FFmpeg when it is compiled in.
#[derive(Debug, Clone)]
pub struct DefaultConnectionFactory {
    /// Upper bound on a single blocking read
    pub read_timeout: Duration,
    /// Upper bound on a whole `open`, first decoded frame included
    pub open_timeout: Duration,
}

impl Default for DefaultConnectionFactory {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(5),
            open_timeout: Duration::from_secs(10),
        }
    }
}

impl ConnectionFactory for DefaultConnectionFactory {
    fn connect(&self, source: &CameraSource) -> Box<dyn SourceConnection> {
        if source.uri.starts_with(pattern::SCHEME) {
            return match PatternSpec::parse(&source.uri) {
                Ok(spec) => Box::new(PatternConnection::new(spec)),
                Err(reason) => Box::new(UnsupportedConnection::new(reason)),
            };
        }

        #[cfg(feature = "ffmpeg")]
        {
            Box::new(RtspConnection::new(
                source,
                self.open_timeout,
                self.read_timeout,
            ))
        }

        #[cfg(not(feature = "ffmpeg"))]
        {
            Box::new(UnsupportedConnection::new(format!(
                "{} needs the `ffmpeg` feature",
                source.redacted_uri()
            )))
        }
    }
}

/// Connection that can never open. Lets a misconfigured source fail through
/// the normal reconnect path instead of at construction.
#[derive(Debug)]
pub struct UnsupportedConnection {
    reason: String,
}

impl UnsupportedConnection {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl SourceConnection for UnsupportedConnection {
    fn open(&mut self) -> Result<StreamInfo, ConnectError> {
        Err(ConnectError::Unsupported(self.reason.clone()))
    }

    fn acquire_latest(&mut self) -> Result<Frame, AcquireError> {
        Err(AcquireError::NotConnected)
    }

    fn close(&mut self) {}

    fn is_connected(&self) -> bool {
        false
    }
}
