/// 多路摄像头监控 (headless)
///
/// 每路摄像头一个采集线程, 共享一个检测器, 检测结果通过扇出队列分发。
/// Reads `cameras.json` (created with defaults when missing), runs until
/// Ctrl-C, logs statistics periodically and detection events as they happen.
///
/// cargo run --bin multicam --release -- -c cameras.json
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use mimalloc::MiMalloc;
use tracing::{info, warn};

use multicam_sentinel::detection::load_font;
use multicam_sentinel::pipeline::ConsumerHandle;
use multicam_sentinel::{DetectionPipeline, MonitorConfig, Orchestrator};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Detection events per source are logged at most this often
const EVENT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(author, version, about = "多路摄像头人员检测监控", long_about = None)]
struct Args {
    /// 配置文件 (JSON)
    #[arg(short, long, default_value = "cameras.json")]
    config: PathBuf,

    /// ONNX 检测模型, overrides `detector.model`
    #[arg(short, long)]
    model: Option<PathBuf>,

    /// 统计输出间隔(秒), overrides `report_interval_secs`
    #[arg(short, long)]
    report_interval: Option<u64>,

    /// 标注字体 (TTF), overrides `grid.font`
    #[arg(short, long)]
    font: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("multicam_sentinel=info,multicam=info")),
        )
        .init();

    let args = Args::parse();
    let config = MonitorConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    config.validate().context("checking configuration")?;
    config.print_summary();

    let pipeline = build_pipeline(&config, &args)?;
    let sources = config.sources()?;

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || running.store(false, Ordering::SeqCst))
            .context("installing Ctrl-C handler")?;
    }

    let mut orchestrator = Orchestrator::new(
        Arc::new(config.connection_factory()),
        Arc::new(pipeline),
        config.orchestrator_config(),
    );
    let events = orchestrator.subscribe("detection-events");
    let event_logger = thread::Builder::new()
        .name("detection-events".into())
        .spawn(move || log_detection_events(events))
        .context("spawning event logger")?;

    let started = orchestrator.start(&sources)?;
    info!(started, "monitoring, press Ctrl-C to stop");

    let interval = Duration::from_secs(args.report_interval.unwrap_or(config.report_interval_secs));
    let mut last_report = Instant::now();
    while running.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(100));
        if !interval.is_zero() && last_report.elapsed() >= interval {
            orchestrator.log_stats();
            last_report = Instant::now();
        }
    }

    info!("shutting down");
    orchestrator.log_stats();
    let report = orchestrator.stop();
    if !report.is_clean() {
        warn!(abandoned = ?report.abandoned, "some workers did not stop in time");
    }
    // Fan-out is closed, the logger drains and exits
    if event_logger.join().is_err() {
        warn!("event logger panicked");
    }
    info!(elapsed_ms = report.elapsed.as_millis() as u64, "bye");
    Ok(())
}

fn build_pipeline(config: &MonitorConfig, args: &Args) -> Result<DetectionPipeline> {
    let model = args.model.clone().or_else(|| config.detector.model.clone());

    let mut pipeline = match model {
        #[cfg(feature = "onnx")]
        Some(model) => {
            let yolo = multicam_sentinel::detection::YOLOv8::new(&config.yolo_config(model.clone()))
                .with_context(|| format!("loading model {}", model.display()))?;
            DetectionPipeline::new(Box::new(yolo), config.detector.pipeline.clone())
        }
        #[cfg(not(feature = "onnx"))]
        Some(model) => {
            warn!(model = %model.display(), "built without the `onnx` feature, frames pass through unanalyzed");
            DetectionPipeline::passthrough()
        }
        None => {
            warn!("no detection model configured, frames pass through unanalyzed");
            DetectionPipeline::passthrough()
        }
    };

    if let Some(font) = args.font.as_ref().or(config.grid.font.as_ref()) {
        let font = load_font(font).with_context(|| format!("loading font {}", font.display()))?;
        pipeline = pipeline.with_font(font);
    }
    Ok(pipeline)
}

/// "N person(s) detected" per source, rate limited
fn log_detection_events(events: ConsumerHandle) {
    let mut last_logged: HashMap<Arc<str>, Instant> = HashMap::new();
    while !events.is_closed() {
        let Some(item) = events.next_timeout(Duration::from_millis(200)) else {
            continue;
        };
        if item.detections.is_empty() {
            continue;
        }
        let now = Instant::now();
        let due = last_logged
            .get(&item.source_id)
            .map_or(true, |t| now.duration_since(*t) >= EVENT_INTERVAL);
        if due {
            info!(
                source_id = %item.source_id,
                sequence = item.sequence,
                "{} person(s) detected",
                item.detections.len()
            );
            last_logged.insert(item.source_id.clone(), now);
        }
    }
    if events.dropped() > 0 {
        info!(dropped = events.dropped(), "event logger fell behind");
    }
}
