use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tokio::task::spawn_blocking;

use crate::db::prediction_store::{
    DetectionRecord, PredictionRecord, PredictionRef, PredictionStore, StoreError,
    deserialize_bbox, serialize_bbox,
};
use async_trait::async_trait;
use shared::BoundingBox;

/// Embedded relational backend: one SQLite file, two tables joined on
/// `prediction_uid`. Every operation opens a short-lived connection and runs
/// on the blocking pool, relying on SQLite's own file locking.
#[derive(Clone)]
pub struct SqliteRepository {
    db_path: PathBuf,
}

impl SqliteRepository {
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let repo = Self {
            db_path: db_path.as_ref().to_path_buf(),
        };
        repo.init_schema()?;
        Ok(repo)
    }

    fn open(&self) -> Result<Connection, StoreError> {
        Ok(Connection::open(&self.db_path)?)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.open()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS prediction_sessions (
                 uid TEXT PRIMARY KEY,
                 timestamp DATETIME DEFAULT CURRENT_TIMESTAMP,
                 original_image TEXT,
                 predicted_image TEXT
             );
             CREATE TABLE IF NOT EXISTS detection_objects (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 prediction_uid TEXT,
                 label TEXT,
                 score REAL,
                 box TEXT,
                 FOREIGN KEY (prediction_uid) REFERENCES prediction_sessions (uid)
             );
             CREATE INDEX IF NOT EXISTS idx_prediction_uid ON detection_objects (prediction_uid);
             CREATE INDEX IF NOT EXISTS idx_label ON detection_objects (label);
             CREATE INDEX IF NOT EXISTS idx_score ON detection_objects (score);",
        )?;
        Ok(())
    }

    async fn run_blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let repo = self.clone();
        spawn_blocking(move || f(repo.open()?))
            .await
            .map_err(|e| StoreError::Blocking(e.to_string()))?
    }
}

#[async_trait]
impl PredictionStore for SqliteRepository {
    async fn save_prediction(
        &self,
        uid: &str,
        original_image: &str,
        predicted_image: &str,
    ) -> Result<(), StoreError> {
        let (uid, original_image, predicted_image) = (
            uid.to_owned(),
            original_image.to_owned(),
            predicted_image.to_owned(),
        );
        self.run_blocking(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO prediction_sessions (uid, original_image, predicted_image)
                 VALUES (?1, ?2, ?3)",
                params![uid, original_image, predicted_image],
            )?;
            Ok(())
        })
        .await
    }

    async fn save_detection(
        &self,
        prediction_uid: &str,
        label: &str,
        score: f64,
        bbox: &BoundingBox,
    ) -> Result<(), StoreError> {
        let (prediction_uid, label, box_json) =
            (prediction_uid.to_owned(), label.to_owned(), serialize_bbox(bbox));
        self.run_blocking(move |conn| {
            conn.execute(
                "INSERT INTO detection_objects (prediction_uid, label, score, box)
                 VALUES (?1, ?2, ?3, ?4)",
                params![prediction_uid, label, score, box_json],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_prediction(&self, uid: &str) -> Result<Option<PredictionRecord>, StoreError> {
        let uid = uid.to_owned();
        self.run_blocking(move |conn| {
            let session = conn
                .query_row(
                    "SELECT uid, timestamp, original_image, predicted_image
                     FROM prediction_sessions WHERE uid = ?1",
                    params![uid],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, DateTime<Utc>>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                        ))
                    },
                )
                .optional()?;

            let Some((uid, timestamp, original_image, predicted_image)) = session else {
                return Ok(None);
            };

            let mut stmt = conn.prepare(
                "SELECT id, label, score, box FROM detection_objects WHERE prediction_uid = ?1",
            )?;
            let rows = stmt.query_map(params![uid], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?;

            let mut detection_objects = Vec::new();
            for row in rows {
                let (id, label, score, box_json) = row?;
                detection_objects.push(DetectionRecord {
                    id: id.to_string(),
                    label,
                    score,
                    bbox: deserialize_bbox(&box_json)?,
                });
            }

            Ok(Some(PredictionRecord {
                uid,
                timestamp,
                original_image,
                predicted_image,
                detection_objects,
            }))
        })
        .await
    }

    async fn get_predictions_by_label(
        &self,
        label: &str,
    ) -> Result<Vec<PredictionRef>, StoreError> {
        let label = label.to_owned();
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT ps.uid, ps.timestamp
                 FROM prediction_sessions ps
                 JOIN detection_objects do ON ps.uid = do.prediction_uid
                 WHERE do.label = ?1",
            )?;
            collect_refs(&mut stmt, params![label])
        })
        .await
    }

    async fn get_predictions_by_score(
        &self,
        min_score: f64,
    ) -> Result<Vec<PredictionRef>, StoreError> {
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT ps.uid, ps.timestamp
                 FROM prediction_sessions ps
                 JOIN detection_objects do ON ps.uid = do.prediction_uid
                 WHERE do.score >= ?1",
            )?;
            collect_refs(&mut stmt, params![min_score])
        })
        .await
    }
}

fn collect_refs(
    stmt: &mut rusqlite::Statement<'_>,
    params: impl rusqlite::Params,
) -> Result<Vec<PredictionRef>, StoreError> {
    let rows = stmt.query_map(params, |row| {
        Ok(PredictionRef {
            uid: row.get(0)?,
            timestamp: Some(row.get::<_, DateTime<Utc>>(1)?),
        })
    })?;
    let mut refs = Vec::new();
    for row in rows {
        refs.push(row?);
    }
    Ok(refs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_repo() -> SqliteRepository {
        let path = std::env::temp_dir().join(format!(
            "predictions-test-{}.db",
            uuid::Uuid::new_v4()
        ));
        SqliteRepository::new(path).unwrap()
    }

    #[tokio::test]
    async fn save_and_get_prediction_round_trip() {
        let repo = temp_repo();
        repo.save_prediction("uid-1", "uploads/original/uid-1.jpg", "uploads/predicted/uid-1.jpg")
            .await
            .unwrap();
        repo.save_detection("uid-1", "person", 0.92, &BoundingBox::new(1.0, 2.0, 3.0, 4.0))
            .await
            .unwrap();
        repo.save_detection("uid-1", "dog", 0.51, &BoundingBox::new(5.0, 6.0, 7.0, 8.0))
            .await
            .unwrap();

        let record = repo.get_prediction("uid-1").await.unwrap().unwrap();
        assert_eq!(record.uid, "uid-1");
        assert_eq!(record.original_image, "uploads/original/uid-1.jpg");
        assert_eq!(record.detection_objects.len(), 2);
        assert_eq!(record.detection_objects[0].label, "person");
        assert_eq!(record.detection_objects[0].bbox, BoundingBox::new(1.0, 2.0, 3.0, 4.0));
    }

    #[tokio::test]
    async fn get_prediction_unknown_uid_is_none() {
        let repo = temp_repo();
        assert!(repo.get_prediction("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn session_with_zero_detections_is_valid() {
        let repo = temp_repo();
        repo.save_prediction("empty", "o.jpg", "p.jpg").await.unwrap();
        let record = repo.get_prediction("empty").await.unwrap().unwrap();
        assert!(record.detection_objects.is_empty());
    }

    #[tokio::test]
    async fn save_prediction_is_idempotent_per_uid() {
        let repo = temp_repo();
        repo.save_prediction("redelivered", "o.jpg", "p.jpg").await.unwrap();
        repo.save_prediction("redelivered", "o.jpg", "p.jpg").await.unwrap();

        let refs = repo.get_predictions_by_score(0.0).await.unwrap();
        assert!(refs.is_empty());
        assert!(repo.get_prediction("redelivered").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn label_query_deduplicates_uids() {
        let repo = temp_repo();
        repo.save_prediction("multi", "o.jpg", "p.jpg").await.unwrap();
        for score in [0.3, 0.6, 0.9] {
            repo.save_detection("multi", "cat", score, &BoundingBox::new(0.0, 0.0, 1.0, 1.0))
                .await
                .unwrap();
        }

        let refs = repo.get_predictions_by_label("cat").await.unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].uid, "multi");
        assert!(refs[0].timestamp.is_some());

        assert!(repo.get_predictions_by_label("dog").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn score_query_threshold_is_inclusive() {
        let repo = temp_repo();
        repo.save_prediction("low", "o.jpg", "p.jpg").await.unwrap();
        repo.save_detection("low", "car", 0.4, &BoundingBox::new(0.0, 0.0, 1.0, 1.0))
            .await
            .unwrap();
        repo.save_prediction("high", "o.jpg", "p.jpg").await.unwrap();
        repo.save_detection("high", "car", 0.8, &BoundingBox::new(0.0, 0.0, 1.0, 1.0))
            .await
            .unwrap();

        let refs = repo.get_predictions_by_score(0.8).await.unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].uid, "high");

        let refs = repo.get_predictions_by_score(0.4).await.unwrap();
        assert_eq!(refs.len(), 2);
    }
}
