#![allow(clippy::type_complexity)]
pub mod compositor; // 多路画面拼接
pub mod config; // 监控配置
pub mod detection; // 智能检测
pub mod input; // 视频输入
pub mod pipeline; // 采集/分发流水线
pub mod signal; // 停止信号
pub mod types;

pub use crate::compositor::{Composite, GridCompositor, GridLayout, TileBoard, TileView};
pub use crate::config::{CameraEntry, ConfigError, MonitorConfig};
pub use crate::detection::{
    Analysis, AnalysisError, DetectionPipeline, Detector, NullDetector, PipelineConfig,
};
pub use crate::input::{
    AcquireError, ConnectError, ConnectionFactory, DefaultConnectionFactory, SourceConnection,
};
pub use crate::pipeline::{
    ConsumerHandle, FanoutDistributor, FanoutItem, FrameSlot, LatestFrame, Orchestrator,
    OrchestratorConfig, OrchestratorError, StopReport, WorkerConfig, WorkerState, WorkerStats,
};
pub use crate::signal::StopSignal;
pub use crate::types::{BBox, CameraSource, Detection, Frame, StreamInfo, Transport};

