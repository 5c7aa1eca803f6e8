use std::time::Duration;

use aws_sdk_sqs::Client;
use aws_sdk_sqs::types::Message;
use log::{error, info, warn};

use crate::pipeline::{ImageSource, PredictionPipeline};
use shared::DetectionJob;

const MAX_BATCH_SIZE: i32 = 10;
const WAIT_TIME_SECONDS: i32 = 20;
const EMPTY_BATCH_IDLE: Duration = Duration::from_millis(500);
const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("Malformed job body: {0}")]
    MalformedBody(#[from] serde_json::Error),
    #[error("Message without body")]
    MissingBody,
    #[error("Message without receipt handle")]
    MissingReceiptHandle,
}

/// Background consumer for detection jobs produced by the chat bot.
///
/// At-least-once semantics: a message is deleted only after the pipeline has
/// fully succeeded; anything else leaves it for redelivery once the queue's
/// visibility timeout expires.
pub struct JobConsumer {
    client: Client,
    queue_url: String,
    pipeline: PredictionPipeline,
}

impl JobConsumer {
    pub fn new(client: Client, queue_url: String, pipeline: PredictionPipeline) -> Self {
        Self {
            client,
            queue_url,
            pipeline,
        }
    }

    /// Poll-process-acknowledge loop for the process lifetime. Per-message
    /// failures and queue-access failures are both contained here; neither
    /// ends the loop.
    pub async fn run(self) {
        info!("Starting queue consumer on {}", self.queue_url);

        loop {
            let received = self
                .client
                .receive_message()
                .queue_url(&self.queue_url)
                .max_number_of_messages(MAX_BATCH_SIZE)
                .wait_time_seconds(WAIT_TIME_SECONDS)
                .send()
                .await;

            let messages = match received {
                Ok(output) => output.messages.unwrap_or_default(),
                Err(e) => {
                    error!("Queue receive failed: {e}");
                    tokio::time::sleep(RECEIVE_ERROR_BACKOFF).await;
                    continue;
                }
            };

            if messages.is_empty() {
                tokio::time::sleep(EMPTY_BATCH_IDLE).await;
                continue;
            }

            for message in messages {
                match self.process_message(&message).await {
                    Ok(job) => {
                        if let Err(e) = self.acknowledge(&message).await {
                            // The pipeline upserts by uid, so the eventual
                            // redelivery of this job lands on the same record.
                            warn!(
                                "Failed to acknowledge job {}: {e}",
                                job.prediction_id
                            );
                        }
                    }
                    Err(e) => {
                        error!("Job processing failed, leaving message for redelivery: {e}");
                    }
                }
            }
        }
    }

    async fn process_message(&self, message: &Message) -> Result<DetectionJob, ProcessError> {
        let body = message.body().ok_or(ConsumerError::MissingBody)?;
        let job: DetectionJob = serde_json::from_str(body).map_err(ConsumerError::from)?;

        info!(
            "Processing job {} for chat {} (key {})",
            job.prediction_id, job.chat_id, job.image_key
        );

        let summary = self
            .pipeline
            .run(
                Some(job.prediction_id.clone()),
                ImageSource::ObjectStore {
                    key: job.image_key.clone(),
                },
            )
            .await?;

        info!(
            "Job {} stored {} detections",
            summary.prediction_uid, summary.detection_count
        );
        Ok(job)
    }

    async fn acknowledge(&self, message: &Message) -> Result<(), ProcessError> {
        let receipt_handle = message
            .receipt_handle()
            .ok_or(ConsumerError::MissingReceiptHandle)?;
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| ProcessError::Queue(e.to_string()))?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
enum ProcessError {
    #[error(transparent)]
    Consumer(#[from] ConsumerError),
    #[error(transparent)]
    Pipeline(#[from] crate::pipeline::PipelineError),
    #[error("Queue error: {0}")]
    Queue(String),
}
