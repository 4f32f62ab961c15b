//! Detection stage
//!
//! `Detector` is the external analysis capability. It is assumed to be
//! non-reentrant, so every camera worker goes through one `DetectionPipeline`
//! which holds the backend behind a single mutex: at most one analysis call is
//! in flight across all sources.

pub mod annotate;
#[cfg(feature = "onnx")]
pub mod yolov8;

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use ab_glyph::FontVec;
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::types::{Detection, Frame};

pub use annotate::{draw_detections, draw_info_overlay, draw_labeled_detections, load_font};
#[cfg(feature = "onnx")]
pub use yolov8::{YOLOv8, YOLOv8Config};

/// 统一的检测器接口
///
/// Black-box analysis backend: frame in, labeled boxes out. Implementations
/// need not be thread-safe; callers serialize through `DetectionPipeline`.
pub trait Detector: Send {
    fn detect(&mut self, image: &RgbaImage) -> anyhow::Result<Vec<Detection>>;

    fn name(&self) -> &str {
        "detector"
    }
}

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("detector failed: {0}")]
    Backend(String),

    #[error("detector lock poisoned")]
    Poisoned,
}

/// Post-detection filtering and annotation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Detections below this confidence are dropped
    pub confidence_threshold: f32,
    /// Class labels to keep; empty keeps everything
    pub classes: Vec<String>,
    /// Draw boxes on a copy of frames that have detections
    pub annotate: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            classes: vec!["person".to_string()],
            annotate: true,
        }
    }
}

/// Result of one analysis call. The input frame is never modified.
#[derive(Debug, Clone, Default)]
pub struct Analysis {
    pub detections: Vec<Detection>,
    pub annotated: Option<Frame>,
}

impl Analysis {
    /// The frame to publish downstream: the annotated copy if one was drawn
    pub fn output_frame(&self, raw: &Frame) -> Frame {
        self.annotated.clone().unwrap_or_else(|| raw.clone())
    }
}

pub struct DetectionPipeline {
    backend: Mutex<Box<dyn Detector>>,
    backend_name: String,
    config: PipelineConfig,
    font: Option<FontVec>,
    calls: AtomicU64,
    errors: AtomicU64,
}

impl DetectionPipeline {
    pub fn new(detector: Box<dyn Detector>, config: PipelineConfig) -> Self {
        let backend_name = detector.name().to_string();
        Self {
            backend: Mutex::new(detector),
            backend_name,
            config,
            font: None,
            calls: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    /// Adds "label confidence" tags to annotated frames
    pub fn with_font(mut self, font: FontVec) -> Self {
        self.font = Some(font);
        self
    }

    /// Pipeline that never detects anything
    pub fn passthrough() -> Self {
        Self::new(Box::new(NullDetector), PipelineConfig::default())
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn backend_name(&self) -> &str {
        &self.backend_name
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Runs the backend on `frame` under the pipeline lock, then filters and
    /// optionally annotates outside it.
    pub fn analyze(&self, frame: &Frame) -> Result<Analysis, AnalysisError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let result = self.run_backend(frame);
        if result.is_err() {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }

        let detections: Vec<Detection> = result?
            .into_iter()
            .filter(|d| self.keep(d))
            .collect();

        let annotated = if self.config.annotate && !detections.is_empty() {
            Some(match &self.font {
                Some(font) => draw_labeled_detections(frame, &detections, font),
                None => draw_detections(frame, &detections),
            })
        } else {
            None
        };

        Ok(Analysis {
            detections,
            annotated,
        })
    }

    fn run_backend(&self, frame: &Frame) -> Result<Vec<Detection>, AnalysisError> {
        if frame.is_empty() {
            return Err(AnalysisError::MalformedFrame(format!(
                "{}x{}",
                frame.width(),
                frame.height()
            )));
        }

        let mut backend = self.backend.lock().map_err(|_| AnalysisError::Poisoned)?;
        // A panicking backend must not take the worker thread down with it
        match panic::catch_unwind(AssertUnwindSafe(|| backend.detect(frame.image()))) {
            Ok(Ok(detections)) => Ok(detections),
            Ok(Err(e)) => {
                debug!(backend = %self.backend_name, error = %e, "analysis failed");
                Err(AnalysisError::Backend(format!("{e:#}")))
            }
            Err(_) => Err(AnalysisError::Backend(format!(
                "{} panicked",
                self.backend_name
            ))),
        }
    }

    fn keep(&self, detection: &Detection) -> bool {
        detection.confidence >= self.config.confidence_threshold
            && (self.config.classes.is_empty()
                || self.config.classes.iter().any(|c| c == &detection.class_label))
    }
}

/// Detector that finds nothing. Keeps the pipeline runnable without a model.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDetector;

impl Detector for NullDetector {
    fn detect(&mut self, _image: &RgbaImage) -> anyhow::Result<Vec<Detection>> {
        Ok(Vec::new())
    }

    fn name(&self) -> &str {
        "null"
    }
}
