//! HTTP route handlers.

use std::path::Path as FsPath;
use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    extract::{Multipart, Path, State, multipart::MultipartError},
    http::{StatusCode, header},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

use crate::health::HealthSnapshot;
use crate::input_validation::ValidationError;
use crate::predictor::{EngineError, PredictionResult};
use crate::service::{PredictError, PredictionService, SubmitError};
use crate::store::StoreError;
use crate::task::TaskStatusResponse;

use super::ws::task_events;

/// Multipart part carrying the batch CSV.
const UPLOAD_FIELD: &str = "file";

/// Errors surfaced to HTTP clients. Every variant renders as a JSON body with
/// a `detail` key.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Invalid input")]
    Validation(Vec<ValidationError>),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Upload(#[from] MultipartError),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Upload(e) => e.status(),
            ApiError::Engine(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl From<PredictError> for ApiError {
    fn from(e: PredictError) -> Self {
        match e {
            PredictError::Validation(errors) => ApiError::Validation(errors),
            PredictError::Engine(e) => ApiError::Engine(e),
        }
    }
}

impl From<SubmitError> for ApiError {
    fn from(e: SubmitError) -> Self {
        match e {
            SubmitError::InvalidUpload(_) => ApiError::BadRequest(e.to_string()),
            SubmitError::Store(_) | SubmitError::Queue(_) | SubmitError::Io(_) => {
                ApiError::Internal(format!("Failed to queue task: {e}"))
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        let body = match self {
            ApiError::Validation(errors) => {
                let detail: Vec<Value> = errors
                    .into_iter()
                    .map(|e| {
                        json!({
                            "loc": ["body", e.field],
                            "msg": e.msg,
                            "type": e.error_type
                        })
                    })
                    .collect();
                json!({ "detail": detail })
            }
            ApiError::Upload(e) => json!({ "detail": e.body_text() }),
            other => json!({ "detail": other.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}

/// Response to an accepted batch upload.
#[derive(Debug, Serialize)]
pub struct BatchAccepted {
    pub message: String,
    pub task_id: String,
    pub status_url: String,
    pub websocket_url: String,
}

impl BatchAccepted {
    fn new(task_id: String) -> Self {
        Self {
            message: "File uploaded successfully. Batch prediction started.".to_string(),
            status_url: format!("/tasks/{task_id}/status"),
            websocket_url: format!("/ws/task/{task_id}"),
            task_id,
        }
    }
}

async fn root() -> Json<Value> {
    Json(json!({
        "message": "Welcome to the term deposit prediction API. POST a record to /predict/single \
                    or a CSV file to /predict/batch_upload."
    }))
}

async fn health_check(State(service): State<Arc<PredictionService>>) -> Json<HealthSnapshot> {
    Json(service.health().await)
}

async fn openapi_schema(State(service): State<Arc<PredictionService>>) -> Json<Value> {
    Json(service.schema().clone())
}

async fn shutdown(State(service): State<Arc<PredictionService>>) -> impl IntoResponse {
    tracing::info!("Shutdown requested via HTTP");
    service.trigger_shutdown();
    (StatusCode::OK, Json(json!({})))
}

async fn predict_single(
    State(service): State<Arc<PredictionService>>,
    Json(input): Json<Value>,
) -> Result<Json<PredictionResult>, ApiError> {
    Ok(Json(service.predict(&input)?))
}

async fn batch_upload(
    State(service): State<Arc<PredictionService>>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<BatchAccepted>), ApiError> {
    while let Some(mut field) = multipart.next_field().await? {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }

        let file_name = field.file_name().unwrap_or_default().to_string();
        if !file_name.to_ascii_lowercase().ends_with(".csv") {
            return Err(ApiError::BadRequest(
                "Invalid file type. Please upload a CSV file.".to_string(),
            ));
        }

        let task_id = PredictionService::new_task_id();
        let path = service.upload_path(&task_id);
        let bytes = match store_upload(&mut field, &path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = tokio::fs::remove_file(&path).await;
                return Err(e);
            }
        };
        tracing::info!(%task_id, %file_name, bytes, "Stored batch upload");

        let accepted = service.submit_batch(&task_id).await?;
        return Ok((
            StatusCode::ACCEPTED,
            Json(BatchAccepted::new(accepted.task_id)),
        ));
    }

    Err(ApiError::BadRequest(format!(
        "Missing multipart field '{UPLOAD_FIELD}'"
    )))
}

/// Stream one multipart field to disk. Returns the byte count.
async fn store_upload(
    field: &mut axum::extract::multipart::Field<'_>,
    path: &FsPath,
) -> Result<u64, ApiError> {
    let io_err = |e: std::io::Error| ApiError::Internal(format!("Failed to store upload: {e}"));

    let mut file = tokio::fs::File::create(path).await.map_err(io_err)?;
    let mut written = 0u64;
    while let Some(chunk) = field.chunk().await? {
        file.write_all(&chunk).await.map_err(io_err)?;
        written += chunk.len() as u64;
    }
    file.flush().await.map_err(io_err)?;
    Ok(written)
}

async fn task_status(
    State(service): State<Arc<PredictionService>>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskStatusResponse>, ApiError> {
    match service.task(&task_id).await? {
        Some(record) => Ok(Json(record.to_response())),
        None => Err(ApiError::NotFound(format!("Task {task_id} not found"))),
    }
}

async fn download_result(
    State(service): State<Arc<PredictionService>>,
    Path(file_name): Path<String>,
) -> Result<Response, ApiError> {
    let not_found = || ApiError::NotFound("File not found".to_string());

    let path = service.result_path(&file_name).map_err(|e| {
        tracing::warn!(%file_name, error = %e, "Rejected result download");
        not_found()
    })?;
    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(not_found()),
        Err(e) => return Err(ApiError::Internal(format!("Failed to open result: {e}"))),
    };

    let body = Body::from_stream(ReaderStream::new(file));
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{file_name}\""),
            ),
        ],
        body,
    )
        .into_response())
}

pub fn routes(service: Arc<PredictionService>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health-check", get(health_check))
        .route("/openapi.json", get(openapi_schema))
        .route("/shutdown", post(shutdown))
        .route("/predict/single", post(predict_single))
        .route("/predict/batch_upload", post(batch_upload))
        .route("/tasks/{task_id}/status", get(task_status))
        .route("/ws/task/{task_id}", get(task_events))
        .route("/results/{file_name}", get(download_result))
        .with_state(service)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LogisticModel;
    use crate::predictor::Predictor;
    use crate::queue::{MemoryTaskQueue, TaskQueue};
    use crate::schema::{FIELDS, PredictionRecord, example_record};
    use crate::storage::DataDirs;
    use crate::store::{MemoryStatusStore, StatusStore};
    use crate::task::{TaskRecord, TaskStatus};
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tower::ServiceExt;

    const ARTIFACT: &str = r#"{
        "version": "test-1",
        "intercept": -1.0,
        "numeric": { "duration": { "mean": 100.0, "scale": 50.0, "weight": 1.5 } }
    }"#;

    struct Harness {
        _tmp: tempfile::TempDir,
        store: Arc<MemoryStatusStore>,
        queue: Arc<MemoryTaskQueue>,
        service: Arc<PredictionService>,
    }

    fn harness_with(predictor: Arc<dyn Predictor>) -> Harness {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = DataDirs::new(tmp.path());
        dirs.prepare().unwrap();
        let store = Arc::new(MemoryStatusStore::new());
        let queue = Arc::new(MemoryTaskQueue::new());
        let service = Arc::new(PredictionService::new(
            predictor,
            store.clone(),
            queue.clone(),
            dirs,
        ));
        Harness {
            _tmp: tmp,
            store,
            queue,
            service,
        }
    }

    fn harness() -> Harness {
        harness_with(Arc::new(LogisticModel::from_json(ARTIFACT).unwrap()))
    }

    impl Harness {
        fn app(&self) -> Router {
            routes(self.service.clone())
        }
    }

    async fn response_json(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn response_text(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn json_request(uri: &str, body: &Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn upload_request(field: &str, file_name: &str, content: &str) -> Request<Body> {
        let boundary = "predserve-test-boundary";
        let body = format!(
            "--{boundary}\r\n\
             Content-Disposition: form-data; name=\"{field}\"; filename=\"{file_name}\"\r\n\
             Content-Type: text/csv\r\n\r\n\
             {content}\r\n\
             --{boundary}--\r\n"
        );
        Request::post("/predict/batch_upload")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn example_csv(rows: usize) -> String {
        let example = example_record();
        let header: Vec<&str> = FIELDS.iter().map(|f| f.name).collect();
        let row: Vec<String> = FIELDS
            .iter()
            .map(|f| match &example[f.name] {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect();
        let mut out = header.join(",") + "\n";
        for _ in 0..rows {
            out.push_str(&row.join(","));
            out.push('\n');
        }
        out
    }

    #[tokio::test]
    async fn root_points_at_predict_endpoint() {
        let h = harness();
        let response = h
            .app()
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = response_json(response).await;
        assert!(json["message"].as_str().unwrap().contains("/predict/single"));
    }

    #[tokio::test]
    async fn health_check_returns_status_and_version() {
        let h = harness();
        let response = h
            .app()
            .oneshot(Request::get("/health-check").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = response_json(response).await;
        assert_eq!(json["status"], "READY");
        assert_eq!(json["store"], "memory");
        assert!(json["version"]["predserve"].is_string());
        assert_eq!(json["version"]["model"], "test-1");
    }

    #[tokio::test]
    async fn openapi_describes_record() {
        let h = harness();
        let response = h
            .app()
            .oneshot(Request::get("/openapi.json").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = response_json(response).await;
        let record = &json["components"]["schemas"]["PredictionRecord"];
        assert_eq!(record["required"].as_array().unwrap().len(), 16);
    }

    #[tokio::test]
    async fn predict_single_returns_label_and_probability() {
        let h = harness();
        let response = h
            .app()
            .oneshot(json_request("/predict/single", &example_record()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = response_json(response).await;
        let label = json["label"].as_u64().unwrap();
        let probability = json["probability"].as_f64().unwrap();
        assert!(label <= 1);
        assert!((0.0..=1.0).contains(&probability));
    }

    #[tokio::test]
    async fn predict_single_reports_missing_field() {
        let h = harness();
        let mut input = example_record();
        input.as_object_mut().unwrap().remove("age");

        let response = h
            .app()
            .oneshot(json_request("/predict/single", &input))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let json = response_json(response).await;
        insta::assert_json_snapshot!(json, @r#"
        {
          "detail": [
            {
              "loc": [
                "body",
                "age"
              ],
              "msg": "Field required",
              "type": "value_error.missing"
            }
          ]
        }
        "#);
    }

    #[tokio::test]
    async fn predict_single_rejects_unknown_field() {
        let h = harness();
        let mut input = example_record();
        input["income"] = json!(50000);

        let response = h
            .app()
            .oneshot(json_request("/predict/single", &input))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let json = response_json(response).await;
        assert_eq!(json["detail"][0]["loc"][1], "income");
        assert_eq!(json["detail"][0]["type"], "value_error.extra");
    }

    #[tokio::test]
    async fn predict_single_rejects_out_of_domain_category() {
        let h = harness();
        let mut input = example_record();
        input["month"] = json!("smarch");

        let response = h
            .app()
            .oneshot(json_request("/predict/single", &input))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let json = response_json(response).await;
        assert_eq!(json["detail"][0]["loc"][1], "month");
    }

    struct BrokenModel;

    impl Predictor for BrokenModel {
        fn predict(&self, _: &PredictionRecord) -> Result<PredictionResult, EngineError> {
            Err(EngineError::Failed("weights missing".to_string()))
        }
    }

    /// Counts engine calls; always predicts the positive class.
    #[derive(Default)]
    struct CountingModel {
        calls: AtomicUsize,
    }

    impl Predictor for CountingModel {
        fn predict(&self, _: &PredictionRecord) -> Result<PredictionResult, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            PredictionResult::from_probability(0.9, 0.5)
        }
    }

    #[tokio::test]
    async fn invalid_single_record_never_reaches_engine() {
        let model = Arc::new(CountingModel::default());
        let h = harness_with(model.clone());

        let mut missing = example_record();
        missing.as_object_mut().unwrap().remove("age");
        let mut wrong_type = example_record();
        wrong_type["age"] = json!("thirty-five");
        let mut bad_category = example_record();
        bad_category["month"] = json!("smarch");

        for input in [missing, wrong_type, bad_category] {
            let response = h
                .app()
                .oneshot(json_request("/predict/single", &input))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        }
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);

        let response = h
            .app()
            .oneshot(json_request("/predict/single", &example_record()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn predict_single_engine_failure_is_500() {
        let h = harness_with(Arc::new(BrokenModel));
        let response = h
            .app()
            .oneshot(json_request("/predict/single", &example_record()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = response_json(response).await;
        assert!(json["detail"].as_str().unwrap().contains("weights missing"));
    }

    #[tokio::test]
    async fn batch_upload_accepts_csv_and_reports_pending() {
        let h = harness();
        let response = h
            .app()
            .oneshot(upload_request("file", "customers.csv", &example_csv(2)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let json = response_json(response).await;
        let task_id = json["task_id"].as_str().unwrap().to_string();
        assert_eq!(json["status_url"], format!("/tasks/{task_id}/status"));
        assert_eq!(json["websocket_url"], format!("/ws/task/{task_id}"));
        assert!(h.service.upload_path(&task_id).exists());

        let response = h
            .app()
            .oneshot(
                Request::get(format!("/tasks/{task_id}/status"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = response_json(response).await;
        assert_eq!(json["status"], "PENDING");
        assert!(json["results_download_url"].is_null());

        let delivery = h
            .queue
            .next(Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.job.task_id, task_id);
    }

    #[tokio::test]
    async fn batch_upload_rejects_non_csv() {
        let h = harness();
        let response = h
            .app()
            .oneshot(upload_request("file", "customers.xlsx", "whatever"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = response_json(response).await;
        assert!(json["detail"].as_str().unwrap().contains("CSV"));
        assert_eq!(h.store.len(), 0);
    }

    #[tokio::test]
    async fn batch_upload_rejects_ragged_table() {
        let h = harness();
        let response = h
            .app()
            .oneshot(upload_request("file", "bad.csv", "a,b\n1,2,3\n"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(h.store.len(), 0);
        let leftovers = std::fs::read_dir(h.service.dirs().uploads_dir())
            .unwrap()
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn batch_upload_requires_file_field() {
        let h = harness();
        let response = h
            .app()
            .oneshot(upload_request("attachment", "customers.csv", &example_csv(1)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_task_is_404() {
        let h = harness();
        let response = h
            .app()
            .oneshot(
                Request::get("/tasks/does-not-exist/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let json = response_json(response).await;
        assert!(json["detail"].as_str().unwrap().contains("does-not-exist"));
    }

    #[tokio::test]
    async fn batch_flow_ends_with_downloadable_result() {
        let h = harness();
        let response = h
            .app()
            .oneshot(upload_request("file", "customers.csv", &example_csv(2)))
            .await
            .unwrap();
        let task_id = response_json(response).await["task_id"]
            .as_str()
            .unwrap()
            .to_string();

        let delivery = h
            .queue
            .next(Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            h.service.coordinator().run(&delivery.job).await,
            Some(TaskStatus::Success)
        );

        let response = h
            .app()
            .oneshot(
                Request::get(format!("/tasks/{task_id}/status"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response_json(response).await;
        assert_eq!(status["status"], "SUCCESS");
        let url = status["results_download_url"].as_str().unwrap().to_string();
        assert_eq!(url, format!("/results/results_{task_id}.csv"));

        let response = h
            .app()
            .oneshot(Request::get(url).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/csv");

        let body = response_text(response).await;
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with(",label,probability"));
    }

    #[tokio::test]
    async fn download_rejects_traversal() {
        let h = harness();
        let response = h
            .app()
            .oneshot(
                Request::get("/results/..%2Fuploads%2Fsecret.csv")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn download_missing_file_is_404() {
        let h = harness();
        let response = h
            .app()
            .oneshot(
                Request::get("/results/results_nope.csv")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn failed_task_has_no_download_url() {
        let h = harness();
        let mut record = TaskRecord::pending("t-1");
        record.advance(TaskStatus::Failure, "bad file").unwrap();
        h.store.put(&record).await.unwrap();

        let response = h
            .app()
            .oneshot(Request::get("/tasks/t-1/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = response_json(response).await;
        assert_eq!(json["status"], "FAILURE");
        assert_eq!(json["message"], "bad file");
        assert!(json["results_download_url"].is_null());
    }

    #[tokio::test]
    async fn shutdown_endpoint_triggers_shutdown() {
        let h = harness();
        let rx = h.service.shutdown_rx();
        let response = h
            .app()
            .oneshot(Request::post("/shutdown").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(*rx.borrow());
    }
}
