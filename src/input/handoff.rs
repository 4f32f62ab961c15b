//! Decode thread → reader hand-off
//!
//! A decode thread pushes into a small bounded queue without blocking. The
//! reader side lives here so the freshness rules can be exercised without a
//! decoder:
//! - `first_frame`: one deadline for the whole open, cut short by stop
//! - `take_latest`: discard whatever is queued, then wait for the next item

use std::time::{Duration, Instant};

use crossbeam_channel::{never, select, Receiver, RecvTimeoutError};

use super::{AcquireError, ConnectError};
use crate::signal::StopSignal;
use crate::types::Frame;

/// Consecutive undecodable frames before the reader is told
pub const CORRUPT_THRESHOLD: u32 = 30;

/// One item on the hand-off queue
#[derive(Debug)]
pub enum Decoded {
    Frame(Frame),
    /// The decoder has been dropping every frame for a while
    Corrupt(String),
}

/// Outcome of a deadline-bounded receive
#[derive(Debug, PartialEq)]
pub enum Wait<T> {
    Ready(T),
    TimedOut,
    Closed,
    Stopped,
}

/// Receives one item before `deadline`, or earlier if `stop` fires.
pub fn recv_until<T>(rx: &Receiver<T>, deadline: Instant, stop: Option<&StopSignal>) -> Wait<T> {
    if stop.is_some_and(|s| s.is_stopped()) {
        return Wait::Stopped;
    }
    let idle = never::<()>();
    let stopped = stop.map_or(&idle, |s| s.receiver());
    let timeout = deadline.saturating_duration_since(Instant::now());

    select! {
        recv(rx) -> msg => match msg {
            Ok(item) => Wait::Ready(item),
            Err(_) => Wait::Closed,
        },
        recv(stopped) -> _ => Wait::Stopped,
        default(timeout) => Wait::TimedOut,
    }
}

/// Waits for the first decoded frame of a fresh connection. `open_timeout`
/// is only used to label a timeout; the wait itself ends at `deadline`.
pub fn first_frame(
    rx: &Receiver<Decoded>,
    deadline: Instant,
    open_timeout: Duration,
    stop: Option<&StopSignal>,
) -> Result<Frame, ConnectError> {
    match recv_until(rx, deadline, stop) {
        Wait::Ready(Decoded::Frame(frame)) => Ok(frame),
        Wait::Ready(Decoded::Corrupt(reason)) => {
            Err(ConnectError::Unreachable(format!("undecodable stream: {reason}")))
        }
        Wait::TimedOut => Err(ConnectError::Timeout(open_timeout)),
        Wait::Closed => Err(ConnectError::Unreachable(
            "stream ended before the first frame".to_string(),
        )),
        Wait::Stopped => Err(ConnectError::Stopped),
    }
}

/// Discard step then retrieve step. Every item dropped by the discard step
/// is added to `discarded`.
pub fn take_latest<T>(
    rx: &Receiver<T>,
    timeout: Duration,
    discarded: &mut u64,
) -> Result<T, RecvTimeoutError> {
    while rx.try_recv().is_ok() {
        *discarded += 1;
    }
    rx.recv_timeout(timeout)
}

/// `take_latest` mapped onto the connection's error type
pub fn acquire(
    rx: &Receiver<Decoded>,
    timeout: Duration,
    discarded: &mut u64,
) -> Result<Frame, AcquireError> {
    match take_latest(rx, timeout, discarded) {
        Ok(Decoded::Frame(frame)) => Ok(frame),
        Ok(Decoded::Corrupt(reason)) => Err(AcquireError::Decode(reason)),
        Err(RecvTimeoutError::Timeout) => Err(AcquireError::Timeout(timeout)),
        Err(RecvTimeoutError::Disconnected) => Err(AcquireError::EndOfStream),
    }
}
