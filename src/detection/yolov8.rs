// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// YOLOv8 检测模型 (ONNX Runtime)
// Letterbox preprocessing, single forward pass, confidence filter + NMS

use std::path::PathBuf;

use anyhow::{Context, Result};
use fast_image_resize as fr;
use image::RgbaImage;
use ndarray::Array4;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::Detector;
use crate::types::{BBox, Detection};

/// Letterbox padding value (as the Ultralytics exporter expects)
const PAD_VALUE: f32 = 144.0 / 255.0;
const CXYWH_OFFSET: usize = 4;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct YOLOv8Config {
    pub model: PathBuf,
    /// Square network input size
    pub input_size: u32,
    /// Backend-side pre-filter; the pipeline applies its own threshold after
    pub conf: f32,
    pub iou: f32,
    pub intra_threads: usize,
}

impl Default for YOLOv8Config {
    fn default() -> Self {
        Self {
            model: PathBuf::from("yolov8n.onnx"),
            input_size: 640,
            conf: 0.25,
            iou: 0.45,
            intra_threads: 4,
        }
    }
}

pub struct YOLOv8 {
    session: Session,
    input_name: String,
    size: u32,
    conf: f32,
    iou: f32,
    names: Vec<String>,
    resizer: fr::Resizer,
}

impl YOLOv8 {
    pub fn new(config: &YOLOv8Config) -> Result<Self> {
        let session = Session::builder()
            .context("creating ORT session builder")?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .context("setting optimization level")?
            .with_intra_threads(config.intra_threads)
            .context("setting intra-op threads")?
            .commit_from_file(&config.model)
            .with_context(|| format!("loading {}", config.model.display()))?;

        let input_name = session
            .inputs
            .first()
            .map(|i| i.name.clone())
            .context("model has no inputs")?;

        info!(
            model = %config.model.display(),
            input = %input_name,
            size = config.input_size,
            "YOLOv8 loaded"
        );

        Ok(Self {
            session,
            input_name,
            size: config.input_size,
            conf: config.conf,
            iou: config.iou,
            names: coco_names(),
            resizer: fr::Resizer::new(),
        })
    }

    fn scale_wh(&self, w0: f32, h0: f32) -> (f32, f32, f32) {
        let s = self.size as f32;
        let r = (s / w0).min(s / h0);
        (r, (w0 * r).round(), (h0 * r).round())
    }

    /// RGBA frame → NCHW [1, 3, size, size], aspect preserved, padded
    /// bottom/right.
    fn preprocess(&mut self, image: &RgbaImage) -> Result<(Array4<f32>, f32)> {
        let (w0, h0) = image.dimensions();
        let (ratio, w_new, h_new) = self.scale_wh(w0 as f32, h0 as f32);
        let (w_new, h_new) = ((w_new as u32).max(1), (h_new as u32).max(1));

        let src = fr::images::ImageRef::new(w0, h0, image.as_raw(), fr::PixelType::U8x4)
            .context("wrapping frame for resize")?;
        let mut dst = fr::images::Image::new(w_new, h_new, fr::PixelType::U8x4);
        self.resizer
            .resize(
                &src,
                &mut dst,
                &fr::ResizeOptions::new()
                    .resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear)),
            )
            .context("letterbox resize")?;

        let size = self.size as usize;
        let mut input = Array4::<f32>::from_elem((1, 3, size, size), PAD_VALUE);
        let raw = dst.buffer();
        for y in 0..h_new as usize {
            for x in 0..w_new as usize {
                let i = (y * w_new as usize + x) * 4;
                input[[0, 0, y, x]] = raw[i] as f32 / 255.0;
                input[[0, 1, y, x]] = raw[i + 1] as f32 / 255.0;
                input[[0, 2, y, x]] = raw[i + 2] as f32 / 255.0;
            }
        }
        Ok((input, ratio))
    }

    /// Decodes the [1, 4 + nc, anchors] head into frame-space boxes.
    fn postprocess(&self, shape: &[i64], data: &[f32], ratio: f32, w0: f32, h0: f32) -> Vec<Detection> {
        if shape.len() != 3 {
            return Vec::new();
        }
        let rows = shape[1] as usize;
        let anchors = shape[2] as usize;
        if rows <= CXYWH_OFFSET || data.len() < rows * anchors {
            return Vec::new();
        }
        let nc = rows - CXYWH_OFFSET;

        let mut candidates: Vec<(BBox, usize, f32)> = Vec::new();
        for a in 0..anchors {
            let at = |row: usize| data[row * anchors + a];

            let (id, confidence) = (0..nc)
                .map(|c| (c, at(CXYWH_OFFSET + c)))
                .fold((0, f32::MIN), |best, x| if x.1 > best.1 { x } else { best });
            if confidence < self.conf {
                continue;
            }

            let cx = at(0) / ratio;
            let cy = at(1) / ratio;
            let w = at(2) / ratio;
            let h = at(3) / ratio;
            let bbox = BBox::new(
                (cx - w / 2.0).clamp(0.0, w0),
                (cy - h / 2.0).clamp(0.0, h0),
                (cx + w / 2.0).clamp(0.0, w0),
                (cy + h / 2.0).clamp(0.0, h0),
            );
            candidates.push((bbox, id, confidence));
        }

        non_max_suppression(&mut candidates, self.iou);

        candidates
            .into_iter()
            .map(|(bbox, id, confidence)| {
                let label = self.names.get(id).map(String::as_str).unwrap_or("unknown");
                Detection::new(bbox, label, confidence)
            })
            .collect()
    }
}

impl Detector for YOLOv8 {
    fn detect(&mut self, image: &RgbaImage) -> Result<Vec<Detection>> {
        let (w0, h0) = (image.width() as f32, image.height() as f32);
        let (input, ratio) = self.preprocess(image)?;

        let shape = input.shape().to_vec();
        let tensor = Tensor::from_array((shape, input.into_raw_vec_and_offset().0.into_boxed_slice()))
            .context("creating input tensor")?;

        let input_name = self.input_name.clone();
        let outputs = self
            .session
            .run(ort::inputs![input_name => tensor])
            .context("YOLOv8 inference failed")?;

        let (out_shape, data) = {
            let (_, first) = outputs.iter().next().context("model produced no outputs")?;
            let (shape, data) = first
                .try_extract_tensor::<f32>()
                .context("extracting output tensor")?;
            (shape.to_vec(), data.to_vec())
        };
        drop(outputs);

        Ok(self.postprocess(&out_shape, &data, ratio, w0, h0))
    }

    fn name(&self) -> &str {
        "yolov8"
    }
}

/// Greedy NMS, highest confidence first. Keeps survivors in place.
pub fn non_max_suppression(xs: &mut Vec<(BBox, usize, f32)>, iou_threshold: f32) {
    xs.sort_by(|a, b| b.2.total_cmp(&a.2));

    let mut current_index = 0;
    for index in 0..xs.len() {
        let mut drop = false;
        for prev_index in 0..current_index {
            if xs[prev_index].0.iou(&xs[index].0) > iou_threshold {
                drop = true;
                break;
            }
        }
        if !drop {
            xs.swap(current_index, index);
            current_index += 1;
        }
    }
    xs.truncate(current_index);
}

fn coco_names() -> Vec<String> {
    [
        "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
        "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat",
        "dog", "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack",
        "umbrella", "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball",
        "kite", "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket",
        "bottle", "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple",
        "sandwich", "orange", "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair",
        "couch", "potted plant", "bed", "dining table", "toilet", "tv", "laptop", "mouse",
        "remote", "keyboard", "cell phone", "microwave", "oven", "toaster", "sink",
        "refrigerator", "book", "clock", "vase", "scissors", "teddy bear", "hair drier",
        "toothbrush",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nms_keeps_best_of_overlapping() {
        let mut xs = vec![
            (BBox::new(0.0, 0.0, 10.0, 10.0), 0, 0.6),
            (BBox::new(1.0, 1.0, 11.0, 11.0), 0, 0.9),
            (BBox::new(50.0, 50.0, 60.0, 60.0), 0, 0.7),
        ];
        non_max_suppression(&mut xs, 0.45);
        assert_eq!(xs.len(), 2);
        assert_eq!(xs[0].2, 0.9);
        assert_eq!(xs[1].2, 0.7);
    }

    #[test]
    fn coco_has_eighty_classes_with_person_first() {
        let names = coco_names();
        assert_eq!(names.len(), 80);
        assert_eq!(names[0], "person");
    }
}
