/// FFmpeg解码过滤器: 视频流 → RGBA帧
/// FFmpeg frame filter: decoded YUV420P frames → shared RGBA `Frame`s
///
/// Runs on the FFmpeg scheduler thread. It never blocks: a frame that finds
/// the hand-off queue full is dropped, so the decoder always keeps pace with
/// the source. A long run of undecodable frames is reported to the reader
/// instead of leaving it to time out.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{Sender, TrySendError};
use ez_ffmpeg::filter::frame_filter::FrameFilter;
use ez_ffmpeg::filter::frame_filter_context::FrameFilterContext;
use ez_ffmpeg::{AVMediaType, Frame as AvFrame};
use tracing::{debug, info, warn};

use super::handoff::{Decoded, CORRUPT_THRESHOLD};
use crate::types::Frame;

/// Largest dimension accepted from a decoder
const MAX_DIMENSION: u32 = 4096;

pub struct DecodeFilter {
    source_id: String,
    tx: Sender<Decoded>,
    cancelled: Arc<AtomicBool>,
    pub total_frames: u64,
    pub dropped_frames: u64,
    /// Undecodable frames since the last good one or the last report
    consecutive_failures: u32,
    count: u64,
    last: Instant,
    pub current_fps: f64,
}

impl DecodeFilter {
    pub fn new(source_id: impl Into<String>, tx: Sender<Decoded>, cancelled: Arc<AtomicBool>) -> Self {
        Self {
            source_id: source_id.into(),
            tx,
            cancelled,
            total_frames: 0,
            dropped_frames: 0,
            consecutive_failures: 0,
            count: 0,
            last: Instant::now(),
            current_fps: 0.0,
        }
    }

    fn drop_frame(&mut self, why: &str) {
        self.dropped_frames += 1;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.total_frames <= 10 {
            warn!(source_id = %self.source_id, frame = self.total_frames, "dropping frame: {why}");
        }

        // Counter is kept if the queue is full so the next failure retries
        if self.consecutive_failures >= CORRUPT_THRESHOLD {
            let reason = format!("{} consecutive frames undecodable, last: {why}", self.consecutive_failures);
            if self.tx.try_send(Decoded::Corrupt(reason)).is_ok() {
                warn!(source_id = %self.source_id, failures = self.consecutive_failures, "stream undecodable");
                self.consecutive_failures = 0;
            }
        }
    }
}

impl FrameFilter for DecodeFilter {
    fn media_type(&self) -> AVMediaType {
        AVMediaType::AVMEDIA_TYPE_VIDEO
    }

    fn init(&mut self, _ctx: &FrameFilterContext) -> Result<(), String> {
        debug!(source_id = %self.source_id, "decode thread started");
        Ok(())
    }

    fn filter_frame(
        &mut self,
        frame: AvFrame,
        _ctx: &FrameFilterContext,
    ) -> Result<Option<AvFrame>, String> {
        // Returning an error is the only way to end a running scheduler
        if self.cancelled.load(Ordering::Relaxed) {
            return Err(format!("{} decoder cancelled", self.source_id));
        }

        self.total_frames += 1;

        if frame.as_ptr().is_null() || frame.is_empty() || frame.is_corrupt() {
            self.drop_frame("empty or corrupt");
            return Ok(None);
        }

        let rgba = unsafe {
            let raw = &*frame.as_ptr();
            let (w, h) = (raw.width as u32, raw.height as u32);
            if w == 0 || h == 0 || w > MAX_DIMENSION || h > MAX_DIMENSION {
                self.drop_frame("illegal resolution");
                return Ok(None);
            }

            // Missing references or invalid bitstream
            if raw.decode_error_flags & 0x03 != 0 {
                self.drop_frame("decode error flags");
                return Ok(None);
            }

            let planes = [raw.data[0], raw.data[1], raw.data[2]];
            let y_stride = raw.linesize[0] as usize;
            let uv_stride = raw.linesize[1] as usize;
            if planes.iter().any(|p| p.is_null())
                || y_stride < w as usize
                || uv_stride < (w as usize).div_ceil(2)
            {
                self.drop_frame("bad plane layout");
                return Ok(None);
            }

            let mut buffer = vec![255u8; (w * h * 4) as usize];
            yuv420p_to_rgba(
                planes[0],
                planes[1],
                planes[2],
                y_stride,
                uv_stride,
                &mut buffer,
                w as usize,
                h as usize,
            );
            Frame::from_rgba(w, h, buffer)
        };

        let Some(rgba) = rgba else {
            self.drop_frame("buffer size mismatch");
            return Ok(None);
        };

        self.consecutive_failures = 0;
        self.count += 1;
        let elapsed = self.last.elapsed().as_secs_f64();
        if elapsed >= 1.0 {
            self.current_fps = self.count as f64 / elapsed;
            debug!(
                source_id = %self.source_id,
                fps = format_args!("{:.1}", self.current_fps),
                total = self.total_frames,
                dropped = self.dropped_frames,
                "decode stats"
            );
            self.last = Instant::now();
            self.count = 0;
        }

        match self.tx.try_send(Decoded::Frame(rgba)) {
            Ok(()) => {}
            // Reader is busy; it will discard the queued frame anyway
            Err(TrySendError::Full(_)) => self.dropped_frames += 1,
            Err(TrySendError::Disconnected(_)) => {
                return Err(format!("{} reader gone", self.source_id));
            }
        }

        Ok(Some(frame))
    }

    fn uninit(&mut self, _ctx: &FrameFilterContext) {
        info!(
            source_id = %self.source_id,
            total = self.total_frames,
            dropped = self.dropped_frames,
            "decode thread exited"
        );
    }
}

/// BT.601 YUV420P → RGBA, fixed point (coefficients × 128). Alpha is left as
/// initialized by the caller.
///
/// # Safety
/// Each plane pointer must be valid for `stride * rows` bytes of its plane.
#[allow(clippy::too_many_arguments)]
#[inline]
unsafe fn yuv420p_to_rgba(
    y_plane: *const u8,
    u_plane: *const u8,
    v_plane: *const u8,
    y_stride: usize,
    uv_stride: usize,
    buffer: &mut [u8],
    width: usize,
    height: usize,
) {
    let mut out = 0;
    for row in 0..height {
        let y_row = row * y_stride;
        let uv_row = (row >> 1) * uv_stride;
        for x in 0..width {
            let y = *y_plane.add(y_row + x) as i32;
            let u = *u_plane.add(uv_row + (x >> 1)) as i32 - 128;
            let v = *v_plane.add(uv_row + (x >> 1)) as i32 - 128;

            buffer[out] = (y + ((v * 179) >> 7)).clamp(0, 255) as u8;
            buffer[out + 1] = (y - ((u * 44) >> 7) - ((v * 91) >> 7)).clamp(0, 255) as u8;
            buffer[out + 2] = (y + ((u * 227) >> 7)).clamp(0, 255) as u8;
            out += 4;
        }
    }
}
