/// RTSP主动拉流解码器
/// RTSP/file source decoded by FFmpeg on its own scheduler thread
///
/// The scheduler pushes RGBA frames into a one-slot queue. `acquire_latest`
/// throws away whatever is already queued and waits for the next decoded
/// frame, so a reader slower than the camera never sees a backlog. `open`
/// has one deadline covering decoder start-up and the first frame.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver};
use ez_ffmpeg::core::context::null_output::create_null_output;
use ez_ffmpeg::filter::frame_pipeline_builder::FramePipelineBuilder;
use ez_ffmpeg::{AVMediaType, FfmpegContext, Input};
use tracing::{debug, info, warn};

use super::decode_filter::DecodeFilter;
use super::handoff::{self, Decoded, Wait};
use super::{AcquireError, ConnectError, SourceConnection};
use crate::signal::StopSignal;
use crate::types::{CameraSource, Frame, StreamInfo, Transport};

/// Decoded frames waiting for the reader. One is the smallest queue that
/// still decouples the decoder from the reader.
const QUEUE_DEPTH: usize = 1;

pub struct RtspConnection {
    source_id: String,
    uri: String,
    transport: Transport,
    open_timeout: Duration,
    read_timeout: Duration,
    rx: Option<Receiver<Decoded>>,
    cancelled: Arc<AtomicBool>,
    decode_thread: Option<JoinHandle<()>>,
    stop: Option<StopSignal>,
    discarded: u64,
}

impl RtspConnection {
    pub fn new(source: &CameraSource, open_timeout: Duration, read_timeout: Duration) -> Self {
        Self {
            source_id: source.id.clone(),
            uri: source.uri.clone(),
            transport: source.transport,
            open_timeout,
            read_timeout,
            rx: None,
            cancelled: Arc::new(AtomicBool::new(false)),
            decode_thread: None,
            stop: None,
            discarded: 0,
        }
    }

    /// Low-latency demuxer options. RTSP-only keys are not passed to files.
    fn input_opts(&self) -> Vec<(&'static str, String)> {
        let mut opts = vec![
            ("fflags", "nobuffer".to_string()),
            ("flags", "low_delay".to_string()),
            ("max_delay", "0".to_string()),
        ];
        if self.uri.starts_with("rtsp://") || self.uri.starts_with("rtsps://") {
            match self.transport {
                Transport::Tcp => opts.push(("rtsp_transport", "tcp".to_string())),
                Transport::Auto => opts.push(("rtsp_flags", "prefer_tcp".to_string())),
            }
            // Socket timeout in microseconds
            opts.push(("timeout", self.read_timeout.as_micros().to_string()));
        }
        opts
    }

    fn start_decoder(&mut self, deadline: Instant) -> Result<Receiver<Decoded>, ConnectError> {
        let (tx, rx) = bounded(QUEUE_DEPTH);
        let cancelled = Arc::new(AtomicBool::new(false));
        self.cancelled = cancelled.clone();

        let filter = DecodeFilter::new(self.source_id.clone(), tx, cancelled);
        let opts: HashMap<String, String> = self
            .input_opts()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let uri = self.uri.clone();
        let source_id = self.source_id.clone();
        let (started_tx, started_rx) = bounded::<Result<(), String>>(1);

        // Context is built and driven on the decode thread
        let handle = thread::Builder::new()
            .name(format!("decode-{}", self.source_id))
            .spawn(move || {
                let pipe: FramePipelineBuilder = AVMediaType::AVMEDIA_TYPE_VIDEO.into();
                let pipe = pipe.filter("decode", Box::new(filter));
                let out = create_null_output().add_frame_pipeline(pipe);
                let input = Input::new(uri.as_str()).set_input_opts(opts);

                let started = FfmpegContext::builder()
                    .input(input)
                    .filter_desc("format=yuv420p")
                    .output(out)
                    .build()
                    .map_err(|e| format!("build failed: {e}"))
                    .and_then(|ctx| ctx.start().map_err(|e| format!("start failed: {e}")));

                match started {
                    Ok(sch) => {
                        let _ = started_tx.send(Ok(()));
                        if let Err(e) = sch.wait() {
                            debug!(source_id = %source_id, error = %e, "decoder finished with error");
                        }
                    }
                    Err(reason) => {
                        let _ = started_tx.send(Err(reason));
                    }
                }
            })
            .map_err(|e| ConnectError::Unreachable(format!("spawn decode thread: {e}")))?;
        self.decode_thread = Some(handle);

        match handoff::recv_until(&started_rx, deadline, self.stop.as_ref()) {
            Wait::Ready(Ok(())) => Ok(rx),
            Wait::Ready(Err(reason)) => Err(ConnectError::Unreachable(reason)),
            Wait::Closed => Err(ConnectError::Unreachable("decode thread exited".to_string())),
            Wait::TimedOut => Err(ConnectError::Timeout(self.open_timeout)),
            Wait::Stopped => Err(ConnectError::Stopped),
        }
    }
}

impl SourceConnection for RtspConnection {
    fn open(&mut self) -> Result<StreamInfo, ConnectError> {
        self.close();
        info!(
            source_id = %self.source_id,
            uri = %crate::types::redact_uri(&self.uri),
            transport = ?self.transport,
            "opening stream"
        );

        let deadline = Instant::now() + self.open_timeout;
        let rx = match self.start_decoder(deadline) {
            Ok(rx) => rx,
            Err(e) => {
                self.close();
                return Err(e);
            }
        };

        // Ready once the first frame decodes, within what is left of the deadline
        let first = handoff::first_frame(&rx, deadline, self.open_timeout, self.stop.as_ref());
        self.rx = Some(rx);
        let first = match first {
            Ok(frame) => frame,
            Err(e) => {
                self.close();
                return Err(e);
            }
        };

        Ok(StreamInfo {
            width: first.width(),
            height: first.height(),
            fps: None,
        })
    }

    fn acquire_latest(&mut self) -> Result<Frame, AcquireError> {
        let Some(rx) = self.rx.as_ref() else {
            return Err(AcquireError::NotConnected);
        };

        // Anything queued was decoded while we were busy
        let result = handoff::acquire(rx, self.read_timeout, &mut self.discarded);
        if result.is_err() {
            self.close();
        }
        result
    }

    fn close(&mut self) {
        self.cancelled.store(true, Ordering::Relaxed);
        // Dropping the receiver also ends the filter on its next frame
        self.rx = None;
        if let Some(handle) = self.decode_thread.take() {
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                // A wedged demuxer only notices cancellation on its next
                // frame or socket timeout; let it finish on its own.
                warn!(source_id = %self.source_id, "decoder still draining, detaching");
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.rx.is_some()
    }

    fn bind_stop(&mut self, stop: StopSignal) {
        self.stop = Some(stop);
    }

    fn discarded(&self) -> u64 {
        self.discarded
    }
}

impl Drop for RtspConnection {
    fn drop(&mut self) {
        self.close();
    }
}
