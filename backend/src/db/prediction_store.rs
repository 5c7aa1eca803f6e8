use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use shared::BoundingBox;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("DynamoDB error: {0}")]
    DynamoDb(String),
    #[error("Invalid stored data: {0}")]
    InvalidData(String),
    #[error("Blocking task failed: {0}")]
    Blocking(String),
}

/// One stored prediction session together with all of its detections.
#[derive(Debug, Clone, Serialize)]
pub struct PredictionRecord {
    pub uid: String,
    pub timestamp: DateTime<Utc>,
    pub original_image: String,
    pub predicted_image: String,
    pub detection_objects: Vec<DetectionRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DetectionRecord {
    pub id: String,
    pub label: String,
    pub score: f64,
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
}

/// A `{uid, timestamp}` pair returned by the label/score queries.
///
/// The timestamp is optional because the DynamoDB label index does not carry
/// it and no second lookup is performed to enrich the result; the SQLite
/// backend always fills it in. Callers must tolerate both shapes.
#[derive(Debug, Clone, Serialize)]
pub struct PredictionRef {
    pub uid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Persistence capability behind the prediction pipeline and the query
/// endpoints. One implementation is chosen at startup via `STORAGE_TYPE`
/// and held for the process lifetime.
#[async_trait]
pub trait PredictionStore: Send + Sync {
    /// Upsert one session row/item with a store-assigned timestamp.
    ///
    /// Upsert rather than plain insert: a redelivered queue job retries with
    /// the same caller-supplied uid and must land on the same record.
    async fn save_prediction(
        &self,
        uid: &str,
        original_image: &str,
        predicted_image: &str,
    ) -> Result<(), StoreError>;

    /// Insert one detection under an already-saved session.
    async fn save_detection(
        &self,
        prediction_uid: &str,
        label: &str,
        score: f64,
        bbox: &BoundingBox,
    ) -> Result<(), StoreError>;

    /// Fetch a session and the full set of its detections.
    async fn get_prediction(&self, uid: &str) -> Result<Option<PredictionRecord>, StoreError>;

    /// All sessions with at least one detection of `label`, deduplicated.
    async fn get_predictions_by_label(&self, label: &str)
    -> Result<Vec<PredictionRef>, StoreError>;

    /// All sessions with at least one detection scoring `>= min_score`,
    /// deduplicated.
    async fn get_predictions_by_score(
        &self,
        min_score: f64,
    ) -> Result<Vec<PredictionRef>, StoreError>;
}

pub(crate) fn serialize_bbox(bbox: &BoundingBox) -> String {
    // [f64; 4] to a flat JSON array cannot fail
    serde_json::to_string(bbox).expect("bounding box serialization")
}

pub(crate) fn deserialize_bbox(raw: &str) -> Result<BoundingBox, StoreError> {
    serde_json::from_str(raw)
        .map_err(|e| StoreError::InvalidData(format!("bad bounding box {raw:?}: {e}")))
}
