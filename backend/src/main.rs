mod db;
mod detector;
mod pipeline;
mod queue;
mod routes;
mod storage;

use std::env;
use std::fs;
use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{App, HttpServer, web};
use aws_config::BehaviorVersion;
use aws_sdk_dynamodb::Client as DynamoDbClient;
use aws_sdk_s3::Client as S3Client;
use aws_sdk_sqs::Client as SqsClient;

use db::dynamodb_repository::DynamoDbRepository;
use db::prediction_store::PredictionStore;
use db::sqlite_repository::SqliteRepository;
use detector::annotate;
use detector::model::Detector;
use pipeline::PredictionPipeline;
use queue::consumer::JobConsumer;
use routes::configure_routes;
use storage::s3_service::S3Service;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));
    dotenv::dotenv().ok();

    fs::create_dir_all(pipeline::ORIGINAL_DIR)?;
    fs::create_dir_all(pipeline::PREDICTED_DIR)?;

    let model_path =
        env::var("MODEL_PATH").unwrap_or_else(|_| "models/yolov8n.torchscript".to_string());
    let detector = Detector::load(&model_path).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("Model loading failed: {e}"),
        )
    })?;
    log::info!("Loaded detection model from {model_path}");

    let font = match env::var("FONT_PATH") {
        Ok(path) => match annotate::load_font(&path) {
            Ok(font) => Some(Arc::new(font)),
            Err(e) => {
                log::warn!("Failed to load font {path}: {e}; annotating boxes only");
                None
            }
        },
        Err(_) => None,
    };

    // Initialize AWS configuration and clients
    let aws_config = aws_config::defaults(BehaviorVersion::latest()).load().await;
    let s3_client = S3Client::new(&aws_config);
    let s3_bucket = env::var("S3_BUCKET_NAME").unwrap();
    let s3_service = S3Service::new(s3_client, s3_bucket);

    let storage_type = env::var("STORAGE_TYPE").unwrap_or_else(|_| "sqlite".to_string());
    let store: Arc<dyn PredictionStore> = match storage_type.as_str() {
        "dynamodb" => {
            let dynamodb_client = DynamoDbClient::new(&aws_config);
            let sessions_table = env::var("DYNAMODB_SESSIONS_TABLE").unwrap();
            let detections_table = env::var("DYNAMODB_DETECTIONS_TABLE").unwrap();
            log::info!("Using DynamoDB storage ({sessions_table}, {detections_table})");
            Arc::new(DynamoDbRepository::new(
                dynamodb_client,
                sessions_table,
                detections_table,
            ))
        }
        _ => {
            let db_path =
                env::var("PREDICTIONS_DB_PATH").unwrap_or_else(|_| "predictions.db".to_string());
            log::info!("Using SQLite storage at {db_path}");
            let repository = SqliteRepository::new(&db_path).map_err(|e| {
                std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("SQLite init failed: {e}"),
                )
            })?;
            Arc::new(repository)
        }
    };

    let prediction_pipeline = PredictionPipeline::new(detector, s3_service, store.clone(), font);

    // The consumer is spawned once and owns its loop; startup continues
    // immediately to bring the HTTP server up.
    match env::var("SQS_QUEUE_URL") {
        Ok(queue_url) => {
            let consumer = JobConsumer::new(
                SqsClient::new(&aws_config),
                queue_url,
                prediction_pipeline.clone(),
            );
            actix_web::rt::spawn(consumer.run());
        }
        Err(_) => log::warn!("SQS_QUEUE_URL not set; queue consumer disabled"),
    }

    let port = env::var("PORT").unwrap_or_else(|_| "8080".to_string());
    let bind_address = format!("0.0.0.0:{port}");
    log::info!("Starting server on {bind_address}");

    let store = web::Data::from(store);
    HttpServer::new(move || {
        App::new()
            .wrap(
                Cors::default()
                    .allow_any_origin()
                    .allowed_methods(vec!["GET", "POST", "OPTIONS"])
                    .max_age(3600),
            )
            .app_data(web::Data::new(prediction_pipeline.clone()))
            .app_data(store.clone())
            .configure(configure_routes)
    })
    .bind(&bind_address)?
    .run()
    .await
}
