//! Orchestrator: owns the worker set and the shared pipeline stages
//!
//! One worker thread per enabled source, all sharing one `DetectionPipeline`
//! and one `FanoutDistributor`. A failing source only ever affects its own
//! worker.

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{info, warn};

use super::fanout::{ConsumerHandle, FanoutDistributor, DEFAULT_CAPACITY};
use super::slot::LatestFrame;
use super::stats::{WorkerState, WorkerStats};
use super::worker::{CameraWorker, WorkerConfig, WorkerHandle};
use crate::detection::DetectionPipeline;
use crate::input::ConnectionFactory;
use crate::types::CameraSource;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("source `{0}` is already configured")]
    DuplicateSource(String),

    #[error("no source named `{0}`")]
    UnknownSource(String),

    #[error("orchestrator already stopped")]
    Stopped,

    #[error("failed to spawn worker for `{source_id}`: {error}")]
    Spawn {
        source_id: String,
        #[source]
        error: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub worker: WorkerConfig,
    pub fanout_capacity: usize,
    /// Total time `stop` waits for all workers together
    pub stop_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            worker: WorkerConfig::default(),
            fanout_capacity: DEFAULT_CAPACITY,
            stop_timeout: Duration::from_secs(3),
        }
    }
}

/// Outcome of `stop`
#[derive(Debug, Clone, Default)]
pub struct StopReport {
    pub joined: Vec<String>,
    /// Workers still blocked at the deadline, left to process teardown
    pub abandoned: Vec<String>,
    pub elapsed: Duration,
}

impl StopReport {
    pub fn is_clean(&self) -> bool {
        self.abandoned.is_empty()
    }
}

struct Managed {
    source: CameraSource,
    handle: WorkerHandle,
}

pub struct Orchestrator {
    factory: Arc<dyn ConnectionFactory>,
    pipeline: Option<Arc<DetectionPipeline>>,
    fanout: FanoutDistributor,
    config: OrchestratorConfig,
    workers: Vec<Managed>,
    stopped: bool,
}

impl Orchestrator {
    pub fn new(
        factory: Arc<dyn ConnectionFactory>,
        pipeline: Arc<DetectionPipeline>,
        config: OrchestratorConfig,
    ) -> Self {
        let fanout = FanoutDistributor::new(config.fanout_capacity);
        Self {
            factory,
            pipeline: Some(pipeline),
            fanout,
            config,
            workers: Vec::new(),
            stopped: false,
        }
    }

    /// Spawns one worker per enabled source. Disabled sources are skipped.
    /// Returns the number of workers started.
    pub fn start(&mut self, sources: &[CameraSource]) -> Result<usize, OrchestratorError> {
        if self.stopped {
            return Err(OrchestratorError::Stopped);
        }
        for (i, source) in sources.iter().enumerate() {
            if self.contains(&source.id) || sources[..i].iter().any(|s| s.id == source.id) {
                return Err(OrchestratorError::DuplicateSource(source.id.clone()));
            }
        }

        let mut started = 0;
        for source in sources.iter().filter(|s| s.enabled) {
            self.spawn(source.clone())?;
            started += 1;
        }
        info!(
            started,
            skipped = sources.len() - started,
            backend = self.pipeline.as_ref().map(|p| p.backend_name()).unwrap_or("-"),
            "orchestrator started"
        );
        Ok(started)
    }

    /// Starts monitoring one more source. A disabled source is accepted and
    /// ignored.
    pub fn add_source(&mut self, source: CameraSource) -> Result<(), OrchestratorError> {
        if self.stopped {
            return Err(OrchestratorError::Stopped);
        }
        if self.contains(&source.id) {
            return Err(OrchestratorError::DuplicateSource(source.id));
        }
        if !source.enabled {
            return Ok(());
        }
        self.spawn(source)
    }

    /// Stops and forgets one source. Returns its final stats.
    pub fn remove_source(&mut self, source_id: &str) -> Result<WorkerStats, OrchestratorError> {
        let index = self
            .workers
            .iter()
            .position(|w| w.source.id == source_id)
            .ok_or_else(|| OrchestratorError::UnknownSource(source_id.to_string()))?;
        let mut managed = self.workers.remove(index);
        if !managed.handle.stop(self.config.stop_timeout) {
            warn!(source_id, "removed worker abandoned");
        }
        info!(source_id, "source removed");
        Ok(managed.handle.stats())
    }

    /// Replaces a source's worker with a fresh one in the same position,
    /// e.g. after it gave up. If the new worker cannot be spawned the old,
    /// stopped one stays in place so the source is still reported.
    pub fn restart_source(&mut self, source_id: &str) -> Result<(), OrchestratorError> {
        if self.stopped {
            return Err(OrchestratorError::Stopped);
        }
        let index = self
            .workers
            .iter()
            .position(|w| w.source.id == source_id)
            .ok_or_else(|| OrchestratorError::UnknownSource(source_id.to_string()))?;

        let old = &mut self.workers[index];
        if !old.handle.stop(self.config.stop_timeout) {
            warn!(source_id, "previous worker abandoned on restart");
        }
        let source = old.source.clone();

        match self.launch(source) {
            Ok(fresh) => {
                self.workers[index] = fresh;
                info!(source_id, "source restarted");
                Ok(())
            }
            Err(e) => {
                warn!(source_id, error = %e, "restart failed, keeping stopped worker");
                Err(e)
            }
        }
    }

    /// Signals every worker, joins them against one shared deadline, then
    /// releases the fan-out and the pipeline. Safe to call repeatedly.
    pub fn stop(&mut self) -> StopReport {
        let started = Instant::now();
        let mut report = StopReport::default();
        if self.stopped {
            return report;
        }
        self.stopped = true;

        // Signal all first so backoff sleeps end in parallel
        for w in &self.workers {
            w.handle.request_stop();
        }
        let deadline = started + self.config.stop_timeout;
        for mut w in self.workers.drain(..) {
            if w.handle.join_until(deadline) {
                report.joined.push(w.source.id);
            } else {
                report.abandoned.push(w.source.id);
            }
        }

        self.fanout.close();
        self.pipeline = None;
        report.elapsed = started.elapsed();

        if report.is_clean() {
            info!(joined = report.joined.len(), elapsed_ms = report.elapsed.as_millis() as u64, "orchestrator stopped");
        } else {
            warn!(
                joined = report.joined.len(),
                abandoned = ?report.abandoned,
                "orchestrator stopped with abandoned workers"
            );
        }
        report
    }

    /// Point-in-time copies, in start order
    pub fn stats(&self) -> Vec<WorkerStats> {
        self.workers.iter().map(|w| w.handle.stats()).collect()
    }

    pub fn state(&self, source_id: &str) -> Option<WorkerState> {
        self.find(source_id).map(|w| w.handle.state())
    }

    pub fn source_ids(&self) -> Vec<String> {
        self.workers.iter().map(|w| w.source.id.clone()).collect()
    }

    /// Latest slot contents per source, in start order
    pub fn latest_frames(&self) -> Vec<(String, Option<LatestFrame>)> {
        self.workers
            .iter()
            .map(|w| (w.source.id.clone(), w.handle.slot().read_latest()))
            .collect()
    }

    pub fn latest(&self, source_id: &str) -> Option<LatestFrame> {
        self.find(source_id).and_then(|w| w.handle.slot().read_latest())
    }

    pub fn subscribe(&self, name: impl Into<String>) -> ConsumerHandle {
        self.fanout.subscribe(name)
    }

    pub fn fanout(&self) -> &FanoutDistributor {
        &self.fanout
    }

    pub fn pipeline(&self) -> Option<&Arc<DetectionPipeline>> {
        self.pipeline.as_ref()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// One info line per source
    pub fn log_stats(&self) {
        let stats = self.stats();
        let streaming = stats.iter().filter(|s| s.connected).count();
        info!(sources = stats.len(), streaming, "statistics");
        for s in &stats {
            info!("{}", s.summary());
        }
    }

    fn contains(&self, source_id: &str) -> bool {
        self.find(source_id).is_some()
    }

    fn find(&self, source_id: &str) -> Option<&Managed> {
        self.workers.iter().find(|w| w.source.id == source_id)
    }

    fn spawn(&mut self, source: CameraSource) -> Result<(), OrchestratorError> {
        let managed = self.launch(source)?;
        self.workers.push(managed);
        Ok(())
    }

    fn launch(&self, source: CameraSource) -> Result<Managed, OrchestratorError> {
        let pipeline = self.pipeline.clone().ok_or(OrchestratorError::Stopped)?;
        let connection = self.factory.connect(&source);
        let worker = CameraWorker::new(
            source.clone(),
            connection,
            pipeline,
            self.fanout.clone(),
            self.config.worker.clone(),
        );
        let handle = worker.spawn().map_err(|error| OrchestratorError::Spawn {
            source_id: source.id.clone(),
            error,
        })?;
        Ok(Managed { source, handle })
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if !self.stopped {
            self.stop();
        }
    }
}
