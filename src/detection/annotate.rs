//! Drawing helpers: detection boxes and the per-camera info overlay

use std::path::Path;

use ab_glyph::{FontVec, PxScale};
use anyhow::{Context, Result};
use image::{Rgba, RgbaImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;

use crate::types::{Detection, Frame};

const BOX_COLOR: Rgba<u8> = Rgba([0, 255, 0, 255]);
const TEXT_COLOR: Rgba<u8> = Rgba([255, 255, 255, 255]);
const BOX_THICKNESS: i32 = 2;

/// Loads a TTF/OTF font for labels and overlays.
pub fn load_font(path: impl AsRef<Path>) -> Result<FontVec> {
    let path = path.as_ref();
    let bytes = std::fs::read(path).with_context(|| format!("reading font {}", path.display()))?;
    FontVec::try_from_vec(bytes).with_context(|| format!("parsing font {}", path.display()))
}

/// Returns a copy of `frame` with every detection outlined.
pub fn draw_detections(frame: &Frame, detections: &[Detection]) -> Frame {
    let mut img = frame.image().clone();
    for det in detections {
        let Some(rect) = clamp_rect(&img, det) else {
            continue;
        };
        // Thick outline: nested 1px rectangles
        for inset in 0..BOX_THICKNESS {
            let w = rect.width() as i32 - 2 * inset;
            let h = rect.height() as i32 - 2 * inset;
            if w <= 0 || h <= 0 {
                break;
            }
            let r = Rect::at(rect.left() + inset, rect.top() + inset).of_size(w as u32, h as u32);
            draw_hollow_rect_mut(&mut img, r, BOX_COLOR);
        }
    }
    Frame::new(img)
}

/// Same as `draw_detections` plus "label 0.87" tags above each box.
pub fn draw_labeled_detections(frame: &Frame, detections: &[Detection], font: &FontVec) -> Frame {
    let boxed = draw_detections(frame, detections);
    let mut img = boxed.image().clone();
    let scale = PxScale::from(16.0);
    for det in detections {
        let Some(rect) = clamp_rect(&img, det) else {
            continue;
        };
        let label = format!("{} {:.2}", det.class_label, det.confidence);
        let y = (rect.top() - 18).max(0);
        fill_translucent(&mut img, rect.left(), y, 8 * label.len() as u32 + 4, 18, 160);
        draw_text_mut(&mut img, TEXT_COLOR, rect.left() + 2, y + 1, scale, font, &label);
    }
    Frame::new(img)
}

/// Dark translucent panel in the top-left corner with one text row per line.
/// Draws the panel alone when no font is available.
pub fn draw_info_overlay(img: &mut RgbaImage, lines: &[String], font: Option<&FontVec>) {
    if lines.is_empty() {
        return;
    }
    let row = 20;
    let width = (img.width() / 2).max(1);
    let height = row * lines.len() as u32 + 8;
    fill_translucent(img, 0, 0, width, height, 140);

    let Some(font) = font else {
        return;
    };
    let scale = PxScale::from(16.0);
    for (i, line) in lines.iter().enumerate() {
        draw_text_mut(img, TEXT_COLOR, 6, 4 + (i as u32 * row) as i32, scale, font, line);
    }
}

/// Blends a black rectangle over the image with the given alpha.
fn fill_translucent(img: &mut RgbaImage, x: i32, y: i32, w: u32, h: u32, alpha: u8) {
    let x0 = x.max(0) as u32;
    let y0 = y.max(0) as u32;
    let x1 = (x0 + w).min(img.width());
    let y1 = (y0 + h).min(img.height());
    let keep = 255 - u32::from(alpha);
    for py in y0..y1 {
        for px in x0..x1 {
            let p = img.get_pixel_mut(px, py);
            for c in 0..3 {
                p.0[c] = ((u32::from(p.0[c]) * keep) / 255) as u8;
            }
        }
    }
}

fn clamp_rect(img: &RgbaImage, det: &Detection) -> Option<Rect> {
    let max_x = img.width() as f32 - 1.0;
    let max_y = img.height() as f32 - 1.0;
    let x1 = det.bbox.x1.clamp(0.0, max_x);
    let y1 = det.bbox.y1.clamp(0.0, max_y);
    let x2 = det.bbox.x2.clamp(0.0, max_x);
    let y2 = det.bbox.y2.clamp(0.0, max_y);
    let w = (x2 - x1) as u32;
    let h = (y2 - y1) as u32;
    if w == 0 || h == 0 {
        return None;
    }
    Some(Rect::at(x1 as i32, y1 as i32).of_size(w, h))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BBox;

    #[test]
    fn outlines_box_edges_only() {
        let frame = Frame::solid(20, 20, [0, 0, 0, 255]);
        let det = Detection::new(BBox::new(4.0, 4.0, 14.0, 14.0), "person", 0.9);
        let out = draw_detections(&frame, &[det]);
        assert_eq!(*out.image().get_pixel(4, 8), BOX_COLOR);
        assert_eq!(*out.image().get_pixel(9, 9), Rgba([0, 0, 0, 255]));
    }

    #[test]
    fn out_of_frame_boxes_are_clamped_or_skipped() {
        let frame = Frame::solid(10, 10, [0, 0, 0, 255]);
        let dets = [
            Detection::new(BBox::new(-5.0, -5.0, 4.0, 4.0), "person", 0.9),
            Detection::new(BBox::new(20.0, 20.0, 30.0, 30.0), "person", 0.9),
        ];
        let out = draw_detections(&frame, &dets);
        assert_eq!(*out.image().get_pixel(0, 2), BOX_COLOR);
    }

    #[test]
    fn overlay_darkens_corner() {
        let mut img = RgbaImage::from_pixel(40, 40, Rgba([200, 200, 200, 255]));
        draw_info_overlay(&mut img, &["cam".to_string()], None);
        assert!(img.get_pixel(1, 1).0[0] < 200);
        assert_eq!(img.get_pixel(39, 39).0[0], 200);
    }

    #[test]
    fn missing_font_is_an_error() {
        assert!(load_font("/definitely/not/here.ttf").is_err());
    }
}
