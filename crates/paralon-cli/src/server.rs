use std::sync::Arc;

use axum::extract::multipart::{Field, MultipartError};
use axum::extract::{DefaultBodyLimit, Multipart, Path as RoutePath, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use paralon_contracts::assets::{AssetId, AssetOrigin};
use paralon_contracts::errors::{ErrorBody, ErrorCode};
use paralon_contracts::requests::{
    GenerationRequest, ImageRef, Operation, RequestImages, RequestParams, UploadedImage,
};
use paralon_engine::{EngineError, Orchestrator};
use serde::Serialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

pub fn build_router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/api/generate", post(generate))
        .route("/api/edit", post(edit))
        .route("/api/variation", post(variation))
        .route("/api/style-transfer", post(style_transfer))
        .route("/uploads/:file", get(uploaded_file))
        .route("/generated/:file", get(generated_file))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_upload_bytes))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct SuccessBody {
    success: bool,
    request_id: String,
    operation: Operation,
    images: Vec<String>,
}

#[derive(Debug)]
pub struct ApiFailure {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiFailure {
    fn new(status: StatusCode, body: ErrorBody) -> Self {
        Self { status, body }
    }
}

impl From<EngineError> for ApiFailure {
    fn from(err: EngineError) -> Self {
        let body = err.body();
        Self::new(status_for(body.code), body)
    }
}

impl From<MultipartError> for ApiFailure {
    fn from(err: MultipartError) -> Self {
        Self::new(
            err.status(),
            ErrorBody::single(ErrorCode::Validation, err.body_text()),
        )
    }
}

impl IntoResponse for ApiFailure {
    fn into_response(self) -> Response {
        let payload = json!({"success": false, "error": self.body});
        (self.status, Json(payload)).into_response()
    }
}

pub fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::RemoteRejected | ErrorCode::RemoteUnavailable => StatusCode::BAD_GATEWAY,
        ErrorCode::RemoteTimeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorCode::Storage | ErrorCode::Compositor | ErrorCode::Internal => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "message": "Paralon image proxy is running",
        "backend": state.orchestrator.remote_name(),
    }))
}

async fn generate(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<SuccessBody>, ApiFailure> {
    run_operation(&state, Operation::Generate, multipart).await
}

async fn edit(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<SuccessBody>, ApiFailure> {
    run_operation(&state, Operation::Edit, multipart).await
}

async fn variation(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<SuccessBody>, ApiFailure> {
    run_operation(&state, Operation::Variation, multipart).await
}

async fn style_transfer(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<SuccessBody>, ApiFailure> {
    run_operation(&state, Operation::StyleTransfer, multipart).await
}

async fn run_operation(
    state: &AppState,
    operation: Operation,
    multipart: Multipart,
) -> Result<Json<SuccessBody>, ApiFailure> {
    let request = read_form(operation, multipart).await?;
    let outcome = state.orchestrator.handle(request).await.map_err(|err| {
        warn!(%operation, code = ?err.code(), error = %err, "request failed");
        ApiFailure::from(err)
    })?;

    let body = SuccessBody {
        success: true,
        request_id: outcome.request_id.to_string(),
        operation: outcome.operation,
        images: outcome.public_paths(),
    };
    info!(%operation, request_id = %body.request_id, images = body.images.len(), "request served");
    Ok(Json(body))
}

/// Collects the form into a request. Unknown fields are ignored; an empty
/// file part counts as no file, the way browsers submit an unset input.
pub async fn read_form(
    operation: Operation,
    mut multipart: Multipart,
) -> Result<GenerationRequest, ApiFailure> {
    let mut params = RequestParams::default();
    let mut images = RequestImages::default();

    while let Some(field) = multipart.next_field().await? {
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };
        match name.as_str() {
            "model" => params.model = Some(field.text().await?),
            "size" => params.size = Some(field.text().await?),
            "quality" => params.quality = Some(field.text().await?),
            "n" => params.n = Some(field.text().await?),
            "prompt" => params.prompt = Some(field.text().await?),
            "alpha" => params.alpha = Some(field.text().await?),
            "image" | "mask" | "base_image" | "style_image" => {
                if let Some(upload) = read_upload(field).await? {
                    *slot(&mut images, &name) = Some(ImageRef::Upload(upload));
                }
            }
            "image_id" | "mask_id" | "base_image_id" | "style_image_id" => {
                let raw = field.text().await?;
                let raw = raw.trim();
                if raw.is_empty() {
                    continue;
                }
                let image = match AssetId::parse(raw) {
                    Some(id) => ImageRef::Stored(id),
                    None => ImageRef::Unknown(raw.to_string()),
                };
                let target = slot(&mut images, name.trim_end_matches("_id"));
                if target.is_none() {
                    *target = Some(image);
                }
            }
            _ => {}
        }
    }

    Ok(GenerationRequest::new(operation, params, images))
}

async fn read_upload(field: Field<'_>) -> Result<Option<UploadedImage>, ApiFailure> {
    let mime_type = field.content_type().map(str::to_string);
    let bytes = field.bytes().await?;
    if bytes.is_empty() {
        return Ok(None);
    }
    Ok(Some(UploadedImage::new(bytes.to_vec(), mime_type)))
}

fn slot<'a>(images: &'a mut RequestImages, name: &str) -> &'a mut Option<ImageRef> {
    match name {
        "mask" => &mut images.mask,
        "base_image" => &mut images.base_image,
        "style_image" => &mut images.style_image,
        _ => &mut images.image,
    }
}

async fn uploaded_file(
    State(state): State<AppState>,
    RoutePath(file): RoutePath<String>,
) -> Result<Response, ApiFailure> {
    serve_asset(&state, AssetOrigin::Uploaded, &file).await
}

async fn generated_file(
    State(state): State<AppState>,
    RoutePath(file): RoutePath<String>,
) -> Result<Response, ApiFailure> {
    serve_asset(&state, AssetOrigin::Generated, &file).await
}

async fn serve_asset(
    state: &AppState,
    origin: AssetOrigin,
    file: &str,
) -> Result<Response, ApiFailure> {
    let asset = state
        .orchestrator
        .store()
        .get_file(origin, file)
        .await
        .map_err(|err| ApiFailure::from(EngineError::from(err)))?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, asset.mime_type)],
        asset.bytes,
    )
        .into_response())
}
