use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Axis-aligned bounding box in image pixel space, stored as `[x1, y1, x2, y2]`.
///
/// This is the canonical representation for boxes everywhere: the detector
/// emits it, both storage backends persist its JSON string, and the API
/// returns it as a plain JSON array.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BoundingBox(pub [f64; 4]);

impl BoundingBox {
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self([x1, y1, x2, y2])
    }

    pub fn x1(&self) -> f64 {
        self.0[0]
    }

    pub fn y1(&self) -> f64 {
        self.0[1]
    }

    pub fn x2(&self) -> f64 {
        self.0[2]
    }

    pub fn y2(&self) -> f64 {
        self.0[3]
    }

    pub fn width(&self) -> f64 {
        (self.x2() - self.x1()).max(0.0)
    }

    pub fn height(&self) -> f64 {
        (self.y2() - self.y1()).max(0.0)
    }
}

/// One recognized object instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    pub score: f64,
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
}

/// A detection job as produced onto the queue by the upstream chat bot.
///
/// Unlike direct uploads, the producer assigns the prediction id so it can
/// correlate the stored result with the originating chat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionJob {
    pub image_key: String,
    pub chat_id: i64,
    pub prediction_id: String,
}

/// Response body of a completed prediction, shared with the bot producer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionSummary {
    pub prediction_uid: String,
    pub detection_count: usize,
    pub label_counts: BTreeMap<String, usize>,
}
