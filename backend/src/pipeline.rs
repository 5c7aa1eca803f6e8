use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ab_glyph::FontVec;
use log::{info, warn};
use uuid::Uuid;

use crate::db::prediction_store::{PredictionStore, StoreError};
use crate::detector::annotate;
use crate::detector::model::{Detector, DetectorError};
use crate::storage::s3_service::{S3Service, S3ServiceError};
use shared::PredictionSummary;

pub const ORIGINAL_DIR: &str = "uploads/original";
pub const PREDICTED_DIR: &str = "uploads/predicted";

const DEFAULT_EXTENSION: &str = ".jpg";

/// Where the pipeline takes its input image from. Exactly one mode per
/// invocation; the entry points enforce that before calling in.
pub enum ImageSource {
    Upload { data: Vec<u8>, extension: String },
    ObjectStore { key: String },
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Failed to download {key} from S3: {source}")]
    Fetch { key: String, source: S3ServiceError },
    #[error("Failed to stage image: {0}")]
    Io(#[from] std::io::Error),
    #[error("Detection failed: {0}")]
    Detector(#[from] DetectorError),
    #[error("Storage write failed: {0}")]
    Store(#[from] StoreError),
}

/// The ingestion pipeline both entry points run: acquire the image, detect,
/// render the annotated copy, mirror it to S3 best-effort, persist the
/// session and its detections, and summarize.
#[derive(Clone)]
pub struct PredictionPipeline {
    detector: Detector,
    s3_service: S3Service,
    store: Arc<dyn PredictionStore>,
    font: Option<Arc<FontVec>>,
}

impl PredictionPipeline {
    pub fn new(
        detector: Detector,
        s3_service: S3Service,
        store: Arc<dyn PredictionStore>,
        font: Option<Arc<FontVec>>,
    ) -> Self {
        Self {
            detector,
            s3_service,
            store,
            font,
        }
    }

    /// Run one prediction. `uid` is `None` on the upload path (a fresh id is
    /// generated) and caller-supplied for queue jobs so the producer can
    /// correlate the stored result.
    pub async fn run(
        &self,
        uid: Option<String>,
        source: ImageSource,
    ) -> Result<PredictionSummary, PipelineError> {
        let uid = uid.unwrap_or_else(|| Uuid::new_v4().to_string());
        let extension = match &source {
            ImageSource::Upload { extension, .. } => extension.clone(),
            ImageSource::ObjectStore { key } => file_extension(key),
        };
        let original_path = PathBuf::from(ORIGINAL_DIR).join(format!("{uid}{extension}"));
        let predicted_path = PathBuf::from(PREDICTED_DIR).join(format!("{uid}{extension}"));

        match source {
            ImageSource::Upload { data, .. } => fs::write(&original_path, &data)?,
            ImageSource::ObjectStore { key } => {
                let bytes = self
                    .s3_service
                    .download_object(&key)
                    .await
                    .map_err(|source| PipelineError::Fetch { key, source })?;
                fs::write(&original_path, &bytes)?;
            }
        }

        let detections = self.detector.detect(&original_path)?;
        annotate::render(
            &original_path,
            &predicted_path,
            &detections,
            self.font.as_deref(),
        )?;

        // Best-effort mirror to S3; the local copy stays retrievable either way.
        let predicted_key = format!("predicted/{uid}{extension}");
        match fs::read(&predicted_path) {
            Ok(bytes) => {
                if let Err(e) = self
                    .s3_service
                    .upload_image(&bytes, &predicted_key, S3Service::mime_for_extension(&extension))
                    .await
                {
                    warn!("Failed to upload {predicted_key}: {e}");
                }
            }
            Err(e) => warn!(
                "Failed to read {} for upload: {e}",
                predicted_path.display()
            ),
        }

        self.store
            .save_prediction(
                &uid,
                &original_path.to_string_lossy(),
                &predicted_path.to_string_lossy(),
            )
            .await?;

        let mut label_counts = BTreeMap::new();
        for detection in &detections {
            self.store
                .save_detection(&uid, &detection.label, detection.score, &detection.bbox)
                .await?;
            *label_counts.entry(detection.label.clone()).or_insert(0) += 1;
        }

        info!(
            "Prediction {uid} completed with {} detections",
            detections.len()
        );

        Ok(PredictionSummary {
            prediction_uid: uid,
            detection_count: detections.len(),
            label_counts,
        })
    }
}

/// Dot-prefixed extension of a filename or object key, `.jpg` when absent.
pub fn file_extension(name: &str) -> String {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{e}"))
        .unwrap_or_else(|| DEFAULT_EXTENSION.to_string())
}
