use std::fs;
use std::io::Write;
use std::path::Path;

use actix_files::NamedFile;
use actix_multipart::Multipart;
use actix_web::http::header;
use actix_web::{Error, HttpRequest, HttpResponse, web};
use futures::{StreamExt, TryStreamExt};
use log::error;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::db::prediction_store::PredictionStore;
use crate::pipeline::{
    self, ImageSource, PipelineError, PredictionPipeline, file_extension,
};

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Deserialize)]
struct PredictRequest {
    image_key: Option<String>,
}

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/predict").route(web::post().to(predict)))
        .service(web::resource("/prediction/{uid}").route(web::get().to(get_prediction)))
        .service(
            web::resource("/prediction/{uid}/image").route(web::get().to(get_prediction_image)),
        )
        .service(
            web::resource("/predictions/label/{label}")
                .route(web::get().to(get_predictions_by_label)),
        )
        .service(
            web::resource("/predictions/score/{min_score}")
                .route(web::get().to(get_predictions_by_score)),
        )
        .service(web::resource("/image/{type}/{filename}").route(web::get().to(get_image)))
        .service(web::resource("/health").route(web::get().to(health)));
}

async fn predict(
    req: HttpRequest,
    payload: web::Payload,
    pipeline: web::Data<PredictionPipeline>,
) -> Result<HttpResponse, Error> {
    let Some(source) = extract_source(&req, payload).await? else {
        return Ok(HttpResponse::BadRequest().json(ErrorResponse {
            error: "Provide either file or image_key.".to_string(),
        }));
    };

    match pipeline.run(None, source).await {
        Ok(summary) => Ok(HttpResponse::Ok().json(summary)),
        Err(e @ PipelineError::Fetch { .. }) => Ok(HttpResponse::BadRequest().json(ErrorResponse {
            error: e.to_string(),
        })),
        Err(e) => {
            error!("Prediction failed: {e}");
            Ok(HttpResponse::InternalServerError().json(ErrorResponse {
                error: "Prediction failed".to_string(),
            }))
        }
    }
}

/// Pull the input image out of the request: a multipart file upload or a
/// JSON `{image_key}` reference. `None` when the request carries neither.
async fn extract_source(
    req: &HttpRequest,
    mut payload: web::Payload,
) -> Result<Option<ImageSource>, Error> {
    let content_type = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if content_type.starts_with("multipart/form-data") {
        let mut multipart = Multipart::new(req.headers(), payload);
        let mut data = Vec::new();
        let mut extension = ".jpg".to_string();
        while let Ok(Some(mut field)) = multipart.try_next().await {
            if let Some(filename) = field
                .content_disposition()
                .and_then(|cd| cd.get_filename())
            {
                extension = file_extension(filename);
            }
            while let Some(chunk) = field.next().await {
                data.write_all(&chunk?)?;
            }
            if !data.is_empty() {
                break;
            }
        }
        if data.is_empty() {
            return Ok(None);
        }
        return Ok(Some(ImageSource::Upload { data, extension }));
    }

    let mut body = web::BytesMut::new();
    while let Some(chunk) = payload.next().await {
        body.extend_from_slice(&chunk?);
    }
    Ok(serde_json::from_slice::<PredictRequest>(&body)
        .ok()
        .and_then(|request| request.image_key)
        .map(|key| ImageSource::ObjectStore { key }))
}

async fn get_prediction(
    store: web::Data<dyn PredictionStore>,
    path: web::Path<String>,
) -> HttpResponse {
    let uid = path.into_inner();
    match store.get_prediction(&uid).await {
        Ok(Some(record)) => HttpResponse::Ok().json(record),
        Ok(None) => HttpResponse::NotFound().json(ErrorResponse {
            error: "Prediction not found".to_string(),
        }),
        Err(e) => {
            error!("Error retrieving prediction {uid}: {e}");
            HttpResponse::InternalServerError().json(ErrorResponse {
                error: "Failed to retrieve prediction".to_string(),
            })
        }
    }
}

async fn get_predictions_by_label(
    store: web::Data<dyn PredictionStore>,
    path: web::Path<String>,
) -> HttpResponse {
    let label = path.into_inner();
    match store.get_predictions_by_label(&label).await {
        Ok(refs) => HttpResponse::Ok().json(refs),
        Err(e) => {
            error!("Label query for {label:?} failed: {e}");
            HttpResponse::InternalServerError().json(ErrorResponse {
                error: "Label query failed".to_string(),
            })
        }
    }
}

async fn get_predictions_by_score(
    store: web::Data<dyn PredictionStore>,
    path: web::Path<String>,
) -> HttpResponse {
    let raw = path.into_inner();
    let Ok(min_score) = raw.parse::<f64>() else {
        return HttpResponse::UnprocessableEntity().json(ErrorResponse {
            error: format!("min_score must be numeric, got {raw:?}"),
        });
    };

    match store.get_predictions_by_score(min_score).await {
        Ok(refs) => HttpResponse::Ok().json(refs),
        Err(e) => {
            error!("Score query for {min_score} failed: {e}");
            HttpResponse::InternalServerError().json(ErrorResponse {
                error: "Score query failed".to_string(),
            })
        }
    }
}

async fn get_image(
    req: HttpRequest,
    path: web::Path<(String, String)>,
) -> Result<HttpResponse, Error> {
    let (image_type, filename) = path.into_inner();
    let dir = match image_type.as_str() {
        "original" => pipeline::ORIGINAL_DIR,
        "predicted" => pipeline::PREDICTED_DIR,
        _ => {
            return Ok(HttpResponse::BadRequest().json(ErrorResponse {
                error: "Invalid image type".to_string(),
            }));
        }
    };

    let file_path = Path::new(dir).join(sanitize_filename::sanitize(&filename));
    match NamedFile::open_async(&file_path).await {
        Ok(file) => Ok(file.into_response(&req)),
        Err(_) => Ok(HttpResponse::NotFound().json(ErrorResponse {
            error: "Image not found".to_string(),
        })),
    }
}

async fn get_prediction_image(
    req: HttpRequest,
    store: web::Data<dyn PredictionStore>,
    path: web::Path<String>,
) -> HttpResponse {
    let uid = path.into_inner();
    let record = match store.get_prediction(&uid).await {
        Ok(Some(record)) => record,
        Ok(None) => {
            return HttpResponse::NotFound().json(ErrorResponse {
                error: "Prediction not found".to_string(),
            });
        }
        Err(e) => {
            error!("Error retrieving prediction {uid}: {e}");
            return HttpResponse::InternalServerError().json(ErrorResponse {
                error: "Failed to retrieve prediction".to_string(),
            });
        }
    };

    let Ok(bytes) = fs::read(&record.predicted_image) else {
        return HttpResponse::NotFound().json(ErrorResponse {
            error: "Image file not found".to_string(),
        });
    };

    let accept = req
        .headers()
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if accept.contains("image/png") {
        HttpResponse::Ok().content_type("image/png").body(bytes)
    } else if accept.contains("image/jpeg") || accept.contains("image/jpg") {
        HttpResponse::Ok().content_type("image/jpeg").body(bytes)
    } else {
        HttpResponse::NotAcceptable().json(ErrorResponse {
            error: "Client does not accept an image format".to_string(),
        })
    }
}

async fn health() -> HttpResponse {
    HttpResponse::Ok().json(json!({"status": "ok"}))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use actix_web::{App, test};
    use uuid::Uuid;

    use super::*;
    use crate::db::sqlite_repository::SqliteRepository;
    use shared::BoundingBox;

    fn temp_store() -> Arc<dyn PredictionStore> {
        let path = std::env::temp_dir().join(format!("routes-test-{}.db", Uuid::new_v4()));
        Arc::new(SqliteRepository::new(path).unwrap())
    }

    macro_rules! test_app {
        ($store:expr) => {
            test::init_service(
                App::new()
                    .app_data(web::Data::from($store))
                    .configure(configure_routes),
            )
            .await
        };
    }

    #[actix_web::test]
    async fn health_returns_ok() {
        let app = test_app!(temp_store());
        let resp = test::call_service(&app, test::TestRequest::get().uri("/health").to_request())
            .await;
        assert!(resp.status().is_success());
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body, json!({"status": "ok"}));
    }

    #[actix_web::test]
    async fn get_prediction_unknown_uid_is_404() {
        let app = test_app!(temp_store());
        let resp = test::call_service(
            &app,
            test::TestRequest::get().uri("/prediction/no-such-uid").to_request(),
        )
        .await;
        assert_eq!(resp.status(), 404);
    }

    #[actix_web::test]
    async fn get_prediction_returns_stored_detections_unchanged() {
        let store = temp_store();
        store.save_prediction("abc", "o.jpg", "p.jpg").await.unwrap();
        store
            .save_detection("abc", "person", 0.92, &BoundingBox::new(1.0, 2.0, 3.0, 4.0))
            .await
            .unwrap();

        let app = test_app!(store);
        let first: serde_json::Value = test::read_body_json(
            test::call_service(
                &app,
                test::TestRequest::get().uri("/prediction/abc").to_request(),
            )
            .await,
        )
        .await;
        assert_eq!(first["uid"], "abc");
        assert_eq!(first["detection_objects"].as_array().unwrap().len(), 1);
        assert_eq!(first["detection_objects"][0]["label"], "person");
        assert_eq!(first["detection_objects"][0]["box"], json!([1.0, 2.0, 3.0, 4.0]));

        // Reads must not mutate anything.
        let second: serde_json::Value = test::read_body_json(
            test::call_service(
                &app,
                test::TestRequest::get().uri("/prediction/abc").to_request(),
            )
            .await,
        )
        .await;
        assert_eq!(first, second);
    }

    #[actix_web::test]
    async fn label_query_with_no_matches_is_empty_list() {
        let app = test_app!(temp_store());
        let resp = test::call_service(
            &app,
            test::TestRequest::get()
                .uri("/predictions/label/unicorn")
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body, json!([]));
    }

    #[actix_web::test]
    async fn score_query_returns_matching_uids() {
        let store = temp_store();
        store.save_prediction("hit", "o.jpg", "p.jpg").await.unwrap();
        store
            .save_detection("hit", "dog", 0.8, &BoundingBox::new(0.0, 0.0, 1.0, 1.0))
            .await
            .unwrap();
        store.save_prediction("miss", "o.jpg", "p.jpg").await.unwrap();
        store
            .save_detection("miss", "dog", 0.3, &BoundingBox::new(0.0, 0.0, 1.0, 1.0))
            .await
            .unwrap();

        let app = test_app!(store);
        let body: serde_json::Value = test::read_body_json(
            test::call_service(
                &app,
                test::TestRequest::get().uri("/predictions/score/0.5").to_request(),
            )
            .await,
        )
        .await;
        let uids: Vec<&str> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["uid"].as_str().unwrap())
            .collect();
        assert_eq!(uids, vec!["hit"]);
    }

    #[actix_web::test]
    async fn score_query_rejects_non_numeric_threshold() {
        let app = test_app!(temp_store());
        let resp = test::call_service(
            &app,
            test::TestRequest::get().uri("/predictions/score/abc").to_request(),
        )
        .await;
        assert_eq!(resp.status(), 422);
    }

    #[actix_web::test]
    async fn image_with_invalid_type_is_400_before_lookup() {
        let app = test_app!(temp_store());
        let resp = test::call_service(
            &app,
            test::TestRequest::get().uri("/image/other/f.jpg").to_request(),
        )
        .await;
        assert_eq!(resp.status(), 400);
    }

    #[actix_web::test]
    async fn image_missing_file_is_404() {
        let app = test_app!(temp_store());
        let resp = test::call_service(
            &app,
            test::TestRequest::get()
                .uri("/image/original/definitely-not-here.jpg")
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), 404);
    }

    #[actix_web::test]
    async fn stored_original_image_round_trips_byte_for_byte() {
        fs::create_dir_all(pipeline::ORIGINAL_DIR).unwrap();
        let name = format!("{}.jpg", Uuid::new_v4());
        let payload = b"\xff\xd8\xff\xe0fake-jpeg-bytes".to_vec();
        fs::write(Path::new(pipeline::ORIGINAL_DIR).join(&name), &payload).unwrap();

        let app = test_app!(temp_store());
        let resp = test::call_service(
            &app,
            test::TestRequest::get()
                .uri(&format!("/image/original/{name}"))
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), 200);
        let body = test::read_body(resp).await;
        assert_eq!(body.as_ref(), payload.as_slice());
    }

    #[actix_web::test]
    async fn prediction_image_unknown_uid_is_404() {
        let app = test_app!(temp_store());
        let resp = test::call_service(
            &app,
            test::TestRequest::get()
                .uri("/prediction/ghost/image")
                .insert_header((header::ACCEPT, "image/png"))
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), 404);
    }

    #[actix_web::test]
    async fn prediction_image_missing_backing_file_is_404() {
        let store = temp_store();
        store
            .save_prediction("orphan", "o.jpg", "uploads/predicted/gone.jpg")
            .await
            .unwrap();

        let app = test_app!(store);
        let resp = test::call_service(
            &app,
            test::TestRequest::get()
                .uri("/prediction/orphan/image")
                .insert_header((header::ACCEPT, "image/png"))
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), 404);
    }

    #[actix_web::test]
    async fn prediction_image_unacceptable_media_type_is_406() {
        fs::create_dir_all(pipeline::PREDICTED_DIR).unwrap();
        let file = format!("{}/{}.jpg", pipeline::PREDICTED_DIR, Uuid::new_v4());
        fs::write(&file, b"jpeg").unwrap();

        let store = temp_store();
        store.save_prediction("neg", "o.jpg", &file).await.unwrap();

        let app = test_app!(store);
        let resp = test::call_service(
            &app,
            test::TestRequest::get()
                .uri("/prediction/neg/image")
                .insert_header((header::ACCEPT, "text/html"))
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), 406);

        let resp = test::call_service(
            &app,
            test::TestRequest::get()
                .uri("/prediction/neg/image")
                .insert_header((header::ACCEPT, "image/jpeg"))
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), 200);
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            "image/jpeg"
        );
    }
}
