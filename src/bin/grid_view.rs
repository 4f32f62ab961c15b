/// 多路画面网格窗口 (macroquad)
///
/// 采集/检测线程 → 扇出队列 → 拼接线程 → 主线程纹理上传
/// Only the newest composite is kept; the window never waits on cameras.
///
/// cargo run --bin grid_view --features display --release -- -c cameras.json
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::{bounded, Receiver, Sender};
use macroquad::prelude::*;
use tracing::{error, info, warn};

use multicam_sentinel::compositor::SharedCanvas;
use multicam_sentinel::detection::load_font;
use multicam_sentinel::pipeline::ConsumerHandle;
use multicam_sentinel::{
    DetectionPipeline, GridCompositor, MonitorConfig, Orchestrator, TileBoard, WorkerStats,
};

/// Composite rate cap
const FRAME_INTERVAL: Duration = Duration::from_millis(66);

#[derive(Parser, Debug)]
#[command(author, version, about = "多路摄像头网格显示", long_about = None)]
struct Args {
    /// 配置文件 (JSON)
    #[arg(short, long, default_value = "cameras.json")]
    config: PathBuf,

    /// ONNX 检测模型, overrides `detector.model`
    #[arg(short, long)]
    model: Option<PathBuf>,

    /// 标注字体 (TTF), overrides `grid.font`
    #[arg(short, long)]
    font: Option<PathBuf>,
}

fn window_conf() -> Conf {
    Conf {
        window_title: "Multi-Camera Sentinel".to_owned(),
        window_width: 1280,
        window_height: 720,
        high_dpi: false,
        ..Default::default()
    }
}

struct Running {
    orchestrator: Orchestrator,
    canvas_rx: Receiver<SharedCanvas>,
    stats_tx: Sender<Vec<WorkerStats>>,
    shutdown: Arc<AtomicBool>,
    compositor: JoinHandle<()>,
}

#[macroquad::main(window_conf)]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("multicam_sentinel=info,grid_view=info")),
        )
        .init();

    let mut running = match start(Args::parse()) {
        Ok(running) => running,
        Err(e) => {
            error!("{e:#}");
            return;
        }
    };

    let mut texture: Option<Texture2D> = None;
    let mut last_stats = Instant::now();
    loop {
        if is_key_pressed(KeyCode::Escape) || is_key_pressed(KeyCode::Q) {
            break;
        }

        // Captions lag by at most half a second
        if last_stats.elapsed() >= Duration::from_millis(500) {
            let _ = running.stats_tx.try_send(running.orchestrator.stats());
            last_stats = Instant::now();
        }

        if let Some(canvas) = running.canvas_rx.try_iter().last() {
            upload(&mut texture, &canvas);
        }

        clear_background(BLACK);
        if let Some(tex) = &texture {
            // Fit inside the window, keep aspect
            let scale = (screen_width() / tex.width()).min(screen_height() / tex.height());
            let (w, h) = (tex.width() * scale, tex.height() * scale);
            draw_texture_ex(
                tex,
                (screen_width() - w) / 2.0,
                (screen_height() - h) / 2.0,
                WHITE,
                DrawTextureParams {
                    dest_size: Some(vec2(w, h)),
                    ..Default::default()
                },
            );
        } else {
            draw_text("waiting for cameras...", 20.0, 40.0, 28.0, GRAY);
        }

        next_frame().await;
    }

    info!("window closed, shutting down");
    running.shutdown.store(true, Ordering::SeqCst);
    let report = running.orchestrator.stop();
    if !report.is_clean() {
        warn!(abandoned = ?report.abandoned, "some workers did not stop in time");
    }
    if running.compositor.join().is_err() {
        warn!("compositor thread panicked");
    }
}

fn start(args: Args) -> Result<Running> {
    let config = MonitorConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    config.validate().context("checking configuration")?;
    config.print_summary();

    let font_path = args.font.clone().or_else(|| config.grid.font.clone());
    let font = font_path
        .as_ref()
        .map(|p| load_font(p).with_context(|| format!("loading font {}", p.display())))
        .transpose()?;

    let mut pipeline = build_detector(&config, &args)?;
    if let Some(font) = font.clone() {
        pipeline = pipeline.with_font(font);
    }

    let sources = config.sources()?;
    let mut orchestrator = Orchestrator::new(
        Arc::new(config.connection_factory()),
        Arc::new(pipeline),
        config.orchestrator_config(),
    );

    let mut compositor = GridCompositor::new(config.grid.cell_width, config.grid.cell_height);
    if let Some(font) = font {
        compositor = compositor.with_font(font);
    }
    let board = TileBoard::with_order(
        sources
            .iter()
            .filter(|s| s.enabled)
            .map(|s| s.id.clone()),
    );

    let (canvas_tx, canvas_rx) = bounded::<SharedCanvas>(1);
    let (stats_tx, stats_rx) = bounded::<Vec<WorkerStats>>(1);
    let shutdown = Arc::new(AtomicBool::new(false));
    let feed = orchestrator.subscribe("grid-view");
    let compositor = {
        let shutdown = shutdown.clone();
        thread::Builder::new()
            .name("compositor".into())
            .spawn(move || compose_loop(feed, board, compositor, stats_rx, canvas_tx, shutdown))
            .context("spawning compositor")?
    };

    let started = orchestrator.start(&sources)?;
    info!(started, "grid view running, Esc to quit");

    Ok(Running {
        orchestrator,
        canvas_rx,
        stats_tx,
        shutdown,
        compositor,
    })
}

fn build_detector(config: &MonitorConfig, args: &Args) -> Result<DetectionPipeline> {
    match args.model.clone().or_else(|| config.detector.model.clone()) {
        #[cfg(feature = "onnx")]
        Some(model) => {
            let yolo = multicam_sentinel::detection::YOLOv8::new(&config.yolo_config(model.clone()))
                .with_context(|| format!("loading model {}", model.display()))?;
            Ok(DetectionPipeline::new(Box::new(yolo), config.detector.pipeline.clone()))
        }
        #[cfg(not(feature = "onnx"))]
        Some(model) => {
            warn!(model = %model.display(), "built without the `onnx` feature, frames pass through unanalyzed");
            Ok(DetectionPipeline::passthrough())
        }
        None => Ok(DetectionPipeline::passthrough()),
    }
}

fn compose_loop(
    feed: ConsumerHandle,
    mut board: TileBoard,
    mut compositor: GridCompositor,
    stats_rx: Receiver<Vec<WorkerStats>>,
    canvas_tx: Sender<SharedCanvas>,
    shutdown: Arc<AtomicBool>,
) {
    let mut stats = Vec::new();
    let mut last_composite = Instant::now() - FRAME_INTERVAL;
    let mut dirty = false;

    while !shutdown.load(Ordering::SeqCst) && !feed.is_closed() {
        if let Some(item) = feed.next_timeout(Duration::from_millis(20)) {
            dirty |= board.update(&item);
            for item in feed.drain() {
                dirty |= board.update(&item);
            }
        }
        if let Some(latest) = stats_rx.try_iter().last() {
            stats = latest;
            dirty = true;
        }
        if !dirty || last_composite.elapsed() < FRAME_INTERVAL {
            continue;
        }

        let composite = compositor.composite(&board.views(&stats));
        // Window still showing the previous one: skip, a newer one follows
        let _ = canvas_tx.try_send(Arc::new(composite.canvas));
        last_composite = Instant::now();
        dirty = false;
    }
    info!(dropped = feed.dropped(), "compositor stopped");
}

fn upload(texture: &mut Option<Texture2D>, canvas: &SharedCanvas) {
    let (w, h) = (canvas.width() as u16, canvas.height() as u16);
    match texture {
        Some(tex) if tex.width() as u16 == w && tex.height() as u16 == h => {
            tex.update(&Image {
                bytes: canvas.as_raw().clone(),
                width: w,
                height: h,
            });
        }
        _ => {
            let tex = Texture2D::from_rgba8(w, h, canvas.as_raw());
            tex.set_filter(FilterMode::Linear);
            *texture = Some(tex);
        }
    }
}
