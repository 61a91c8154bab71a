//! HTTP surface of the inference service.

use crate::diffusion::png_data_uri;
use crate::error::DetectError;
use crate::models::{ModelSet, SharedModel};
use crate::references::{check_upload_counts, Classification, ReferenceSet, ReferenceStore};
use crate::vision::decode_image;
use axum::body::Bytes;
use axum::extract::multipart::MultipartError;
use axum::extract::{DefaultBodyLimit, FromRequest, Multipart, Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub const API_VERSION: &str = "1.0.0";
const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

#[derive(Clone, Debug)]
pub struct AppState {
    pub models: ModelSet,
    pub references: Arc<ReferenceStore>,
}

impl AppState {
    #[must_use]
    pub fn new(models: ModelSet) -> Self {
        Self {
            models,
            references: Arc::new(ReferenceStore::new()),
        }
    }
}

/// Error returned to HTTP clients as `{"detail": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub detail: String,
}

impl ApiError {
    fn missing_field(name: &str) -> Self {
        Self {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            detail: format!("Missing form field '{name}'"),
        }
    }

    fn invalid_text(name: &str) -> Self {
        Self {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            detail: format!("Form field '{name}' is not valid UTF-8"),
        }
    }
}

/// Text value of a form field. Invalid UTF-8 is rejected rather than repaired.
fn text_field(name: &str, data: &[u8]) -> Result<String, ApiError> {
    std::str::from_utf8(data)
        .map(str::to_owned)
        .map_err(|_| ApiError::invalid_text(name))
}

impl From<DetectError> for ApiError {
    fn from(err: DetectError) -> Self {
        let status = if err.is_client_error() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        Self {
            status,
            detail: err.to_string(),
        }
    }
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        Self {
            status: err.status(),
            detail: err.body_text(),
        }
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            detail: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = %self.status, detail = %self.detail, "request failed");
        } else {
            tracing::warn!(status = %self.status, detail = %self.detail, "request rejected");
        }
        let body = Json(serde_json::json!({ "detail": self.detail }));
        (self.status, body).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Run a forward pass on the blocking pool while holding the model lock.
async fn run_model<M, T, F>(model: SharedModel<M>, f: F) -> Result<T, ApiError>
where
    M: ?Sized + Send + 'static,
    T: Send + 'static,
    F: FnOnce(&mut M) -> crate::Result<T> + Send + 'static,
{
    let result = tokio::task::spawn_blocking(move || f(&mut *model.lock())).await?;
    Ok(result?)
}

fn require<M: ?Sized>(
    model: Option<&SharedModel<M>>,
    name: &'static str,
) -> Result<SharedModel<M>, ApiError> {
    model
        .cloned()
        .ok_or_else(|| DetectError::ModelNotLoaded(name).into())
}

/// Read every multipart field, keeping text and file parts by name.
async fn read_fields(mut multipart: Multipart) -> Result<Vec<(String, Bytes)>, ApiError> {
    let mut fields = Vec::new();
    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        let data = field.bytes().await?;
        fields.push((name, data));
    }
    Ok(fields)
}

fn take_single(fields: Vec<(String, Bytes)>, name: &str) -> Result<Bytes, ApiError> {
    fields
        .into_iter()
        .find(|(n, _)| n == name)
        .map(|(_, data)| data)
        .ok_or_else(|| ApiError::missing_field(name))
}

#[derive(Serialize, Deserialize, Debug)]
pub struct UploadResponse {
    pub status: String,
    pub count: usize,
    pub message: String,
}

async fn upload_references(
    State(state): State<AppState>,
    multipart: Multipart,
) -> ApiResult<UploadResponse> {
    let mut files = Vec::new();
    let mut captions = Vec::new();
    for (name, data) in read_fields(multipart).await? {
        match name.as_str() {
            "files" => files.push(data),
            "captions" => captions.push(text_field("captions", &data)?),
            _ => {}
        }
    }
    if files.is_empty() {
        return Err(ApiError::missing_field("files"));
    }
    check_upload_counts(files.len(), captions.len())?;

    let embedder = require(state.models.embedder.as_ref(), "CLIP")?;
    let embeddings: Vec<Array1<f32>> = run_model(embedder, move |model| {
        let images = files
            .iter()
            .map(|bytes| decode_image(bytes))
            .collect::<crate::Result<Vec<_>>>()?;
        let embs = model.embed_images(&images)?;
        Ok(embs.rows().into_iter().map(|row| row.to_owned()).collect())
    })
    .await?;

    let set = ReferenceSet::from_parts(embeddings, captions)?;
    let count = state.references.replace(set);
    tracing::info!(count, "Uploaded reference images");

    Ok(Json(UploadResponse {
        status: "success".to_string(),
        count,
        message: format!("Successfully uploaded {count} reference images"),
    }))
}

async fn classify(State(state): State<AppState>, multipart: Multipart) -> ApiResult<Classification> {
    if state.references.is_empty() {
        return Err(DetectError::NoReferences.into());
    }
    let bytes = take_single(read_fields(multipart).await?, "file")?;

    let embedder = require(state.models.embedder.as_ref(), "CLIP")?;
    let query = run_model(embedder, move |model| {
        let image = decode_image(&bytes)?;
        model.embed_image(&image)
    })
    .await?;

    let result = state.references.classify(&query)?;
    tracing::info!(label = ?result.label, similarity = result.similarity, "Classified image");
    Ok(Json(result))
}

#[derive(Serialize, Deserialize, Debug)]
pub struct DescribeResponse {
    pub description: String,
}

async fn describe(State(state): State<AppState>, multipart: Multipart) -> ApiResult<DescribeResponse> {
    let bytes = take_single(read_fields(multipart).await?, "file")?;

    let captioner = require(state.models.captioner.as_ref(), "BLIP")?;
    let description = run_model(captioner, move |model| {
        let image = decode_image(&bytes)?;
        model.describe(&image)
    })
    .await?;

    Ok(Json(DescribeResponse { description }))
}

#[derive(Deserialize, Debug)]
struct GenerateForm {
    caption: String,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct GenerateResponse {
    pub image: String,
    pub caption: String,
}

/// `caption` may arrive url-encoded or as a multipart field.
async fn read_caption(state: &AppState, request: Request) -> Result<String, ApiError> {
    let is_multipart = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("multipart/form-data"));

    if is_multipart {
        let multipart = Multipart::from_request(request, state)
            .await
            .map_err(|rejection| ApiError {
                status: rejection.status(),
                detail: rejection.body_text(),
            })?;
        let bytes = take_single(read_fields(multipart).await?, "caption")?;
        text_field("caption", &bytes)
    } else {
        let Form(form) = Form::<GenerateForm>::from_request(request, state)
            .await
            .map_err(|_| ApiError::missing_field("caption"))?;
        Ok(form.caption)
    }
}

async fn generate(State(state): State<AppState>, request: Request) -> ApiResult<GenerateResponse> {
    let caption = read_caption(&state, request).await?;

    let generator = require(state.models.generator.as_ref(), "Stable Diffusion")?;
    let prompt = caption.clone();
    let image = run_model(generator, move |model| {
        let image = model.generate(&prompt)?;
        png_data_uri(&image)
    })
    .await?;
    tracing::info!(caption = %caption, "Generated image");

    Ok(Json(GenerateResponse { image, caption }))
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct ModelsLoaded {
    pub clip: bool,
    pub blip: bool,
    pub stable_diffusion: bool,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct HealthResponse {
    pub status: String,
    pub device: String,
    pub models_loaded: ModelsLoaded,
    pub reference_count: usize,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        device: state.models.device.to_string(),
        models_loaded: ModelsLoaded {
            clip: state.models.embedder.is_some(),
            blip: state.models.captioner.is_some(),
            stable_diffusion: state.models.generator.is_some(),
        },
        reference_count: state.references.len(),
    })
}

async fn root() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "message": "Rare Event Detection API",
        "version": API_VERSION,
        "endpoints": [
            "/upload_references - POST: Upload reference images with captions",
            "/classify - POST: Classify an image as Rare Event or Normal",
            "/describe - POST: Generate description for an image",
            "/generate - POST: Generate synthetic image from caption",
            "/health - GET: Health check",
        ],
    }))
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/upload_references", post(upload_references))
        .route("/classify", post(classify))
        .route("/describe", post(describe))
        .route("/generate", post(generate))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
