use std::path::Path;
use std::sync::{Arc, Mutex};

use image::imageops::FilterType;
use tch::{CModule, Device, Tensor};

use crate::detector::labels::COCO_CLASSES;
use shared::{BoundingBox, Detection};

const INPUT_SIZE: u32 = 640;
const CONF_THRESHOLD: f32 = 0.25;
const IOU_THRESHOLD: f32 = 0.45;

#[derive(Debug, thiserror::Error)]
pub enum DetectorError {
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("Model error: {0}")]
    Model(#[from] tch::TchError),
    #[error("Font error: {0}")]
    Font(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// TorchScript YOLO wrapper. Inference is pinned to the CPU; the module is
/// not thread-safe so concurrent callers serialize on the inner mutex.
#[derive(Clone)]
pub struct Detector {
    model: Arc<Mutex<CModule>>,
}

impl Detector {
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        let model = CModule::load_on_device(model_path, Device::Cpu)?;
        Ok(Self {
            model: Arc::new(Mutex::new(model)),
        })
    }

    /// Run detection over the image at `path` and return boxes scaled back to
    /// the source resolution.
    pub fn detect(&self, path: &Path) -> Result<Vec<Detection>, DetectorError> {
        let img = image::open(path)?.to_rgb8();
        let (width, height) = img.dimensions();

        let resized = image::imageops::resize(&img, INPUT_SIZE, INPUT_SIZE, FilterType::Triangle);
        let plane = (INPUT_SIZE * INPUT_SIZE) as usize;
        let mut input = vec![0f32; 3 * plane];
        for (x, y, pixel) in resized.enumerate_pixels() {
            let offset = (y * INPUT_SIZE + x) as usize;
            input[offset] = pixel[0] as f32 / 255.0;
            input[plane + offset] = pixel[1] as f32 / 255.0;
            input[2 * plane + offset] = pixel[2] as f32 / 255.0;
        }

        let tensor = Tensor::from_slice(&input).view([1, 3, INPUT_SIZE as i64, INPUT_SIZE as i64]);
        let output = self.model.lock().unwrap().forward_ts(&[tensor])?;

        // [1, 4 + classes, candidates] -> flat attribute-major buffer
        let output = output.squeeze_dim(0);
        let dims = output.size();
        let (num_attrs, num_candidates) = (dims[0] as usize, dims[1] as usize);
        let flat = output.contiguous().view([-1]);
        let mut data = vec![0f32; num_attrs * num_candidates];
        flat.copy_data(&mut data, num_attrs * num_candidates);

        let scale_x = width as f32 / INPUT_SIZE as f32;
        let scale_y = height as f32 / INPUT_SIZE as f32;
        Ok(postprocess(
            &data,
            num_attrs - 4,
            num_candidates,
            scale_x,
            scale_y,
            CONF_THRESHOLD,
            IOU_THRESHOLD,
        ))
    }
}

struct Candidate {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    score: f32,
    class_id: usize,
}

/// Decode raw YOLO output (attribute-major `[x, y, w, h, class scores...]`
/// per candidate) into thresholded, per-class non-max-suppressed detections.
fn postprocess(
    data: &[f32],
    num_classes: usize,
    num_candidates: usize,
    scale_x: f32,
    scale_y: f32,
    conf_threshold: f32,
    iou_threshold: f32,
) -> Vec<Detection> {
    let mut candidates = Vec::new();

    for i in 0..num_candidates {
        let mut class_id = 0;
        let mut max_score = 0f32;
        for k in 0..num_classes {
            let score = data[(4 + k) * num_candidates + i];
            if score > max_score {
                max_score = score;
                class_id = k;
            }
        }
        if max_score < conf_threshold {
            continue;
        }

        let cx = data[i];
        let cy = data[num_candidates + i];
        let w = data[2 * num_candidates + i];
        let h = data[3 * num_candidates + i];
        candidates.push(Candidate {
            x1: (cx - w / 2.0) * scale_x,
            y1: (cy - h / 2.0) * scale_y,
            x2: (cx + w / 2.0) * scale_x,
            y2: (cy + h / 2.0) * scale_y,
            score: max_score,
            class_id,
        });
    }

    candidates.sort_unstable_by(|a, b| b.score.total_cmp(&a.score));

    let mut kept: Vec<Candidate> = Vec::new();
    for candidate in candidates {
        let suppressed = kept.iter().any(|k| {
            k.class_id == candidate.class_id && iou(k, &candidate) > iou_threshold
        });
        if !suppressed {
            kept.push(candidate);
        }
    }

    kept.into_iter()
        .map(|c| Detection {
            label: COCO_CLASSES
                .get(c.class_id)
                .unwrap_or(&"object")
                .to_string(),
            score: c.score as f64,
            bbox: BoundingBox::new(c.x1 as f64, c.y1 as f64, c.x2 as f64, c.y2 as f64),
        })
        .collect()
}

fn iou(a: &Candidate, b: &Candidate) -> f32 {
    let ix = (a.x2.min(b.x2) - a.x1.max(b.x1)).max(0.0);
    let iy = (a.y2.min(b.y2) - a.y1.max(b.y1)).max(0.0);
    let intersection = ix * iy;
    let area_a = (a.x2 - a.x1).max(0.0) * (a.y2 - a.y1).max(0.0);
    let area_b = (b.x2 - b.x1).max(0.0) * (b.y2 - b.y1).max(0.0);
    let union = area_a + area_b - intersection;
    if union <= 0.0 { 0.0 } else { intersection / union }
}
