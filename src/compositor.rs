//! 多路画面拼接 (Grid compositor)
//!
//! Tiles the latest frame of each source into one fixed-size canvas.
//! Placement is row-major in the given order; sources beyond the grid
//! capacity are not shown and never-seen sources render as blank cells.

use std::collections::HashMap;
use std::sync::Arc;

use ab_glyph::FontVec;
use anyhow::Context;
use chrono::{DateTime, Utc};
use fast_image_resize as fr;
use image::{Rgba, RgbaImage};
use tracing::debug;

use crate::detection::draw_info_overlay;
use crate::pipeline::{FanoutItem, WorkerStats};
use crate::types::Frame;

pub const DEFAULT_CELL_WIDTH: u32 = 640;
pub const DEFAULT_CELL_HEIGHT: u32 = 360;

/// Columns × rows for a number of sources
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridLayout {
    pub cols: u32,
    pub rows: u32,
}

impl GridLayout {
    pub fn for_sources(count: usize) -> Self {
        let (cols, rows) = match count {
            0 | 1 => (1, 1),
            2..=4 => (2, 2),
            5 | 6 => (3, 2),
            7..=9 => (3, 3),
            _ => (4, 3),
        };
        Self { cols, rows }
    }

    pub fn capacity(&self) -> usize {
        (self.cols * self.rows) as usize
    }

    /// Top-left pixel of cell `index`
    pub fn origin(&self, index: usize, cell_w: u32, cell_h: u32) -> (u32, u32) {
        let i = index as u32;
        ((i % self.cols) * cell_w, (i / self.cols) * cell_h)
    }
}

/// One cell's input
#[derive(Debug, Clone)]
pub struct TileView {
    pub source_id: String,
    pub frame: Option<Frame>,
    /// Overlay text, drawn when the compositor has a font
    pub caption: Vec<String>,
}

impl TileView {
    pub fn new(source_id: impl Into<String>, frame: Option<Frame>) -> Self {
        Self {
            source_id: source_id.into(),
            frame,
            caption: Vec::new(),
        }
    }
}

pub struct Composite {
    pub canvas: RgbaImage,
    pub layout: GridLayout,
    /// Cells that received a frame
    pub populated: usize,
    /// Cells left blank
    pub blank: usize,
}

pub struct GridCompositor {
    cell_width: u32,
    cell_height: u32,
    background: Rgba<u8>,
    font: Option<FontVec>,
    resizer: fr::Resizer,
    // Reused across calls
    cell: fr::images::Image<'static>,
}

impl Default for GridCompositor {
    fn default() -> Self {
        Self::new(DEFAULT_CELL_WIDTH, DEFAULT_CELL_HEIGHT)
    }
}

impl GridCompositor {
    pub fn new(cell_width: u32, cell_height: u32) -> Self {
        let (cell_width, cell_height) = (cell_width.max(1), cell_height.max(1));
        Self {
            cell_width,
            cell_height,
            background: Rgba([0, 0, 0, 255]),
            font: None,
            resizer: fr::Resizer::new(),
            cell: fr::images::Image::new(cell_width, cell_height, fr::PixelType::U8x4),
        }
    }

    pub fn with_background(mut self, rgba: [u8; 4]) -> Self {
        self.background = Rgba(rgba);
        self
    }

    pub fn with_font(mut self, font: FontVec) -> Self {
        self.font = Some(font);
        self
    }

    pub fn cell_size(&self) -> (u32, u32) {
        (self.cell_width, self.cell_height)
    }

    pub fn composite(&mut self, tiles: &[TileView]) -> Composite {
        let layout = GridLayout::for_sources(tiles.len());
        let mut canvas = RgbaImage::from_pixel(
            layout.cols * self.cell_width,
            layout.rows * self.cell_height,
            self.background,
        );

        let mut populated = 0;
        for (index, tile) in tiles.iter().take(layout.capacity()).enumerate() {
            let (x0, y0) = layout.origin(index, self.cell_width, self.cell_height);
            if let Some(frame) = tile.frame.as_ref().filter(|f| !f.is_empty()) {
                match self.fit(frame) {
                    Ok(()) => {
                        self.blit(&mut canvas, x0, y0);
                        populated += 1;
                    }
                    Err(e) => {
                        debug!(source_id = %tile.source_id, error = %format!("{e:#}"), "cell resize failed");
                    }
                }
            }
            if self.font.is_some() && !tile.caption.is_empty() {
                let mut cell = image::imageops::crop_imm(&canvas, x0, y0, self.cell_width, self.cell_height)
                    .to_image();
                draw_info_overlay(&mut cell, &tile.caption, self.font.as_ref());
                image::imageops::replace(&mut canvas, &cell, i64::from(x0), i64::from(y0));
            }
        }

        Composite {
            canvas,
            layout,
            populated,
            blank: layout.capacity() - populated,
        }
    }

    /// Scales `frame` into the reusable cell buffer.
    fn fit(&mut self, frame: &Frame) -> anyhow::Result<()> {
        let img = frame.image();
        if img.dimensions() == (self.cell_width, self.cell_height) {
            self.cell.buffer_mut().copy_from_slice(img.as_raw());
            return Ok(());
        }
        let src = fr::images::ImageRef::new(img.width(), img.height(), img.as_raw(), fr::PixelType::U8x4)
            .context("wrapping frame")?;
        self.resizer
            .resize(
                &src,
                &mut self.cell,
                &fr::ResizeOptions::new().resize_alg(fr::ResizeAlg::Nearest),
            )
            .context("resizing into cell")
    }

    fn blit(&self, canvas: &mut RgbaImage, x0: u32, y0: u32) {
        let row_bytes = (self.cell_width * 4) as usize;
        let canvas_row = (canvas.width() * 4) as usize;
        let src = self.cell.buffer();
        let dst: &mut [u8] = canvas;
        for row in 0..self.cell_height as usize {
            let s = row * row_bytes;
            let d = (y0 as usize + row) * canvas_row + x0 as usize * 4;
            dst[d..d + row_bytes].copy_from_slice(&src[s..s + row_bytes]);
        }
    }
}

// ========== Tile board ==========

#[derive(Debug, Clone)]
struct TileState {
    frame: Frame,
    detections: usize,
    sequence: u64,
    captured_at: DateTime<Utc>,
}

/// Latest frame per source, fed from a fan-out subscription.
///
/// A source's entry is created on its first item and evicted when the source
/// is removed. Items older than what a tile already shows are ignored.
#[derive(Debug, Default)]
pub struct TileBoard {
    order: Vec<String>,
    tiles: HashMap<String, TileState>,
}

impl TileBoard {
    /// Board with a fixed display order; unknown sources are appended.
    pub fn with_order(order: impl IntoIterator<Item = String>) -> Self {
        Self {
            order: order.into_iter().collect(),
            tiles: HashMap::new(),
        }
    }

    pub fn update(&mut self, item: &FanoutItem) -> bool {
        let id: &str = &item.source_id;
        if let Some(tile) = self.tiles.get(id) {
            if item.sequence <= tile.sequence {
                return false;
            }
        }
        if !self.order.iter().any(|o| o == id) {
            self.order.push(id.to_string());
        }
        self.tiles.insert(
            id.to_string(),
            TileState {
                frame: item.frame.clone(),
                detections: item.detections.len(),
                sequence: item.sequence,
                captured_at: item.captured_at,
            },
        );
        true
    }

    pub fn evict(&mut self, source_id: &str) {
        self.order.retain(|o| o != source_id);
        self.tiles.remove(source_id);
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn sequence(&self, source_id: &str) -> Option<u64> {
        self.tiles.get(source_id).map(|t| t.sequence)
    }

    /// Cells in display order. Captions use `stats` when given.
    pub fn views(&self, stats: &[WorkerStats]) -> Vec<TileView> {
        let by_id: HashMap<&str, &WorkerStats> =
            stats.iter().map(|s| (s.source_id.as_str(), s)).collect();
        self.order
            .iter()
            .map(|id| {
                let tile = self.tiles.get(id);
                let mut view = TileView::new(id.clone(), tile.map(|t| t.frame.clone()));
                view.caption.push(format!("Camera: {id}"));
                if let Some(t) = tile {
                    view.caption.push(format!("Humans: {}", t.detections));
                    view.caption
                        .push(format!("Time: {}", t.captured_at.format("%H:%M:%S")));
                }
                match by_id.get(id.as_str()) {
                    Some(s) if s.connected => {
                        view.caption.push(format!("FPS: {:.1}", s.current_fps));
                        view.caption.push(format!("Frames: {}", s.frames_acquired));
                    }
                    Some(s) => view.caption.push(format!("State: {}", s.state)),
                    None => {}
                }
                view
            })
            .collect()
    }
}

/// Frame shared with a display thread
pub type SharedCanvas = Arc<RgbaImage>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_policy() {
        let cases = [
            (1, (1, 1)),
            (2, (2, 2)),
            (4, (2, 2)),
            (5, (3, 2)),
            (6, (3, 2)),
            (7, (3, 3)),
            (9, (3, 3)),
            (10, (4, 3)),
            (20, (4, 3)),
        ];
        for (n, (cols, rows)) in cases {
            assert_eq!(GridLayout::for_sources(n), GridLayout { cols, rows }, "n = {n}");
        }
    }

    #[test]
    fn missing_frames_are_blank_cells() {
        let mut comp = GridCompositor::new(4, 2).with_background([1, 2, 3, 255]);
        let tiles = vec![
            TileView::new("a", Some(Frame::solid(8, 4, [200, 0, 0, 255]))),
            TileView::new("b", None),
        ];
        let out = comp.composite(&tiles);
        assert_eq!(out.layout, GridLayout { cols: 2, rows: 2 });
        assert_eq!(out.canvas.dimensions(), (8, 4));
        assert_eq!(out.populated, 1);
        assert_eq!(out.blank, 3);
        assert_eq!(*out.canvas.get_pixel(0, 0), Rgba([200, 0, 0, 255]));
        assert_eq!(*out.canvas.get_pixel(5, 0), Rgba([1, 2, 3, 255]));
    }

    #[test]
    fn overflow_sources_are_not_drawn() {
        let mut comp = GridCompositor::new(2, 2);
        let tiles: Vec<_> = (0..14)
            .map(|i| TileView::new(format!("s{i}"), Some(Frame::solid(2, 2, [i as u8, 0, 0, 255]))))
            .collect();
        let out = comp.composite(&tiles);
        assert_eq!(out.layout.capacity(), 12);
        assert_eq!(out.populated, 12);
        // Last cell holds source 11
        assert_eq!(out.canvas.get_pixel(7, 5).0[0], 11);
    }

    #[test]
    fn board_ignores_stale_items_and_evicts() {
        let item = |id: &str, seq: u64| FanoutItem {
            source_id: Arc::from(id),
            sequence: seq,
            frame: Frame::solid(1, 1, [0, 0, 0, 255]),
            detections: Arc::default(),
            captured_at: Utc::now(),
        };
        let mut board = TileBoard::with_order(vec!["b".to_string()]);
        assert!(board.update(&item("a", 3)));
        assert!(!board.update(&item("a", 2)));
        assert_eq!(board.sequence("a"), Some(3));

        let views = board.views(&[]);
        assert_eq!(views.len(), 2);
        assert_eq!(views[0].source_id, "b");
        assert!(views[0].frame.is_none());

        board.evict("a");
        assert_eq!(board.len(), 1);
        assert_eq!(board.sequence("a"), None);
    }
}
