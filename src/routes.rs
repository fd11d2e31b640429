use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, Path, State},
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::error::PipelineError;
use crate::pipeline::{Pipeline, UploadOutcome};

pub struct AppState {
    pub pipeline: Pipeline,
}

#[derive(Deserialize)]
struct UploadRequest {
    image: String,
}

#[derive(Deserialize)]
struct ConvertRequest {
    caption: String,
}

#[derive(Serialize)]
struct CaptionResponse {
    caption: String,
}

#[derive(Serialize)]
struct PoemResponse {
    poem: String,
}

/// HTTP surface. CORS only admits `allowed_origin` with the verbs and
/// headers the front-end actually sends.
pub fn router(state: Arc<AppState>, allowed_origin: HeaderValue, max_body_bytes: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(allowed_origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/", get(index))
        .route("/upload", post(upload_image))
        .route("/image/:image_name", get(serve_image))
        .route("/caption/:image_name", get(get_caption))
        .route("/convert", post(convert_to_poem))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn index() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "message": "Photo-to-poetry backend is running!" }))
}

async fn upload_image(
    State(state): State<Arc<AppState>>,
    body: Result<Json<UploadRequest>, JsonRejection>,
) -> Result<Json<UploadOutcome>, Response> {
    let request = parse_body(body)?;
    let outcome = state
        .pipeline
        .upload_and_caption(&request.image)
        .await
        .map_err(IntoResponse::into_response)?;
    Ok(Json(outcome))
}

async fn serve_image(
    State(state): State<Arc<AppState>>,
    Path(image_name): Path<String>,
) -> Result<Response, PipelineError> {
    let image = state.pipeline.fetch_image(&image_name).await?;
    Ok(([(header::CONTENT_TYPE, image.content_type)], image.bytes).into_response())
}

async fn get_caption(
    State(state): State<Arc<AppState>>,
    Path(image_name): Path<String>,
) -> Result<Json<CaptionResponse>, PipelineError> {
    let caption = state.pipeline.fetch_caption(&image_name)?;
    Ok(Json(CaptionResponse { caption }))
}

async fn convert_to_poem(
    State(state): State<Arc<AppState>>,
    body: Result<Json<ConvertRequest>, JsonRejection>,
) -> Result<Json<PoemResponse>, Response> {
    let request = parse_body(body)?;
    let poem = state
        .pipeline
        .convert_to_poem(&request.caption)
        .await
        .map_err(IntoResponse::into_response)?;
    Ok(Json(PoemResponse { poem }))
}

/// Malformed bodies become a 400; oversized ones keep axum's 413.
fn parse_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, Response> {
    match body {
        Ok(Json(value)) => Ok(value),
        Err(rejection) if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE => {
            tracing::debug!(error = %rejection, "request body too large");
            Err(rejection.into_response())
        }
        Err(rejection) => {
            tracing::debug!(error = %rejection, "invalid request body");
            Err(PipelineError::Validation("Invalid request format".to_string()).into_response())
        }
    }
}
