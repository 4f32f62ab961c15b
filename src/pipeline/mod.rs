/// 多路视频流水线 (Multi-camera pipeline)
///
/// SourceConnection → CameraWorker → DetectionPipeline → FrameSlot
///                                                    → FanoutDistributor → consumers
/// - `slot`: latest-wins buffer per source
/// - `fanout`: per-consumer bounded queues, drop-oldest
/// - `stats`: per-worker counters and fps
/// - `worker`: acquisition thread + reconnect state machine
/// - `orchestrator`: lifecycle of the worker set
pub mod fanout;
pub mod orchestrator;
pub mod slot;
pub mod stats;
pub mod worker;

pub use fanout::{ConsumerHandle, FanoutDistributor, FanoutItem};
pub use orchestrator::{Orchestrator, OrchestratorConfig, OrchestratorError, StopReport};
pub use slot::{FrameSlot, LatestFrame};
pub use stats::{FpsCounter, WorkerState, WorkerStats};
pub use worker::{Backoff, CameraWorker, WorkerConfig, WorkerHandle};

pub use crate::signal::StopSignal;
