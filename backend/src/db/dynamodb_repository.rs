use std::collections::{HashMap, HashSet};

use aws_sdk_dynamodb::Client;
use aws_sdk_dynamodb::types::AttributeValue;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::db::prediction_store::{
    DetectionRecord, PredictionRecord, PredictionRef, PredictionStore, StoreError,
    deserialize_bbox, serialize_bbox,
};
use async_trait::async_trait;
use shared::BoundingBox;

/// Distributed backend: two independently-keyed tables. Detections are
/// reached through the `prediction_uid-index` and `label-index` GSIs; the
/// score query has no supporting index and deliberately falls back to a full
/// scan with client-side filtering.
#[derive(Clone)]
pub struct DynamoDbRepository {
    client: Client,
    sessions_table: String,
    detections_table: String,
}

impl DynamoDbRepository {
    pub fn new(client: Client, sessions_table: String, detections_table: String) -> Self {
        Self {
            client,
            sessions_table,
            detections_table,
        }
    }

    fn parse_detection_from_item(
        &self,
        item: HashMap<String, AttributeValue>,
    ) -> Result<DetectionRecord, StoreError> {
        let id = item
            .get("id")
            .and_then(|v| v.as_s().ok())
            .ok_or_else(|| StoreError::InvalidData("Invalid detection id".to_string()))?
            .clone();

        let label = item
            .get("label")
            .and_then(|v| v.as_s().ok())
            .ok_or_else(|| StoreError::InvalidData("Invalid label".to_string()))?
            .clone();

        let score = item
            .get("score")
            .and_then(|v| v.as_n().ok())
            .and_then(|s| s.parse::<f64>().ok())
            .ok_or_else(|| StoreError::InvalidData("Invalid score".to_string()))?;

        let bbox = item
            .get("box")
            .and_then(|v| v.as_s().ok())
            .map(|s| deserialize_bbox(s))
            .transpose()?
            .ok_or_else(|| StoreError::InvalidData("Invalid box".to_string()))?;

        Ok(DetectionRecord {
            id,
            label,
            score,
            bbox,
        })
    }

    async fn query_detections_by_uid(
        &self,
        uid: &str,
    ) -> Result<Vec<HashMap<String, AttributeValue>>, StoreError> {
        let result = self
            .client
            .query()
            .table_name(&self.detections_table)
            .index_name("prediction_uid-index")
            .key_condition_expression("prediction_uid = :uid")
            .expression_attribute_values(":uid", AttributeValue::S(uid.to_string()))
            .send()
            .await
            .map_err(|e| StoreError::DynamoDb(e.to_string()))?;

        Ok(result.items.unwrap_or_default())
    }
}

#[async_trait]
impl PredictionStore for DynamoDbRepository {
    async fn save_prediction(
        &self,
        uid: &str,
        original_image: &str,
        predicted_image: &str,
    ) -> Result<(), StoreError> {
        let mut item = HashMap::new();
        item.insert("uid".to_string(), AttributeValue::S(uid.to_string()));
        item.insert(
            "timestamp".to_string(),
            AttributeValue::S(Utc::now().to_rfc3339()),
        );
        item.insert(
            "original_image".to_string(),
            AttributeValue::S(original_image.to_string()),
        );
        item.insert(
            "predicted_image".to_string(),
            AttributeValue::S(predicted_image.to_string()),
        );

        self.client
            .put_item()
            .table_name(&self.sessions_table)
            .set_item(Some(item))
            .send()
            .await
            .map_err(|e| StoreError::DynamoDb(e.to_string()))?;

        Ok(())
    }

    async fn save_detection(
        &self,
        prediction_uid: &str,
        label: &str,
        score: f64,
        bbox: &BoundingBox,
    ) -> Result<(), StoreError> {
        let mut item = HashMap::new();
        item.insert(
            "id".to_string(),
            AttributeValue::S(Uuid::new_v4().to_string()),
        );
        item.insert(
            "prediction_uid".to_string(),
            AttributeValue::S(prediction_uid.to_string()),
        );
        item.insert("label".to_string(), AttributeValue::S(label.to_string()));
        item.insert("score".to_string(), AttributeValue::N(score.to_string()));
        item.insert("box".to_string(), AttributeValue::S(serialize_bbox(bbox)));

        self.client
            .put_item()
            .table_name(&self.detections_table)
            .set_item(Some(item))
            .send()
            .await
            .map_err(|e| StoreError::DynamoDb(e.to_string()))?;

        Ok(())
    }

    async fn get_prediction(&self, uid: &str) -> Result<Option<PredictionRecord>, StoreError> {
        let mut key = HashMap::new();
        key.insert("uid".to_string(), AttributeValue::S(uid.to_string()));

        let result = self
            .client
            .get_item()
            .table_name(&self.sessions_table)
            .set_key(Some(key))
            .send()
            .await
            .map_err(|e| StoreError::DynamoDb(e.to_string()))?;

        let Some(item) = result.item else {
            return Ok(None);
        };

        let uid = item
            .get("uid")
            .and_then(|v| v.as_s().ok())
            .ok_or_else(|| StoreError::InvalidData("Invalid session uid".to_string()))?
            .clone();

        let timestamp = item
            .get("timestamp")
            .and_then(|v| v.as_s().ok())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .ok_or_else(|| StoreError::InvalidData("Invalid session timestamp".to_string()))?;

        let original_image = item
            .get("original_image")
            .and_then(|v| v.as_s().ok())
            .ok_or_else(|| StoreError::InvalidData("Invalid original_image".to_string()))?
            .clone();

        let predicted_image = item
            .get("predicted_image")
            .and_then(|v| v.as_s().ok())
            .ok_or_else(|| StoreError::InvalidData("Invalid predicted_image".to_string()))?
            .clone();

        let mut detection_objects = Vec::new();
        for detection_item in self.query_detections_by_uid(&uid).await? {
            detection_objects.push(self.parse_detection_from_item(detection_item)?);
        }

        Ok(Some(PredictionRecord {
            uid,
            timestamp,
            original_image,
            predicted_image,
            detection_objects,
        }))
    }

    async fn get_predictions_by_label(
        &self,
        label: &str,
    ) -> Result<Vec<PredictionRef>, StoreError> {
        let result = self
            .client
            .query()
            .table_name(&self.detections_table)
            .index_name("label-index")
            .key_condition_expression("label = :label")
            .expression_attribute_values(":label", AttributeValue::S(label.to_string()))
            .send()
            .await
            .map_err(|e| StoreError::DynamoDb(e.to_string()))?;

        // The label index does not carry the session timestamp and no second
        // lookup is made to enrich it, so these refs come back without one.
        let mut uids = HashSet::new();
        for item in result.items.unwrap_or_default() {
            if let Some(uid) = item.get("prediction_uid").and_then(|v| v.as_s().ok()) {
                uids.insert(uid.clone());
            }
        }

        Ok(uids
            .into_iter()
            .map(|uid| PredictionRef {
                uid,
                timestamp: None,
            })
            .collect())
    }

    async fn get_predictions_by_score(
        &self,
        min_score: f64,
    ) -> Result<Vec<PredictionRef>, StoreError> {
        // No secondary index supports a range query on score, so this backend
        // scans the whole detections table and filters client-side.
        let result = self
            .client
            .scan()
            .table_name(&self.detections_table)
            .send()
            .await
            .map_err(|e| StoreError::DynamoDb(e.to_string()))?;

        let mut uids = HashSet::new();
        for item in result.items.unwrap_or_default() {
            let score = item
                .get("score")
                .and_then(|v| v.as_n().ok())
                .and_then(|s| s.parse::<f64>().ok())
                .unwrap_or(0.0);
            if score >= min_score {
                if let Some(uid) = item.get("prediction_uid").and_then(|v| v.as_s().ok()) {
                    uids.insert(uid.clone());
                }
            }
        }

        Ok(uids
            .into_iter()
            .map(|uid| PredictionRef {
                uid,
                timestamp: None,
            })
            .collect())
    }
}
