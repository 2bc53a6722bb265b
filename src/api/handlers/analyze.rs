use crate::AppState;
use crate::api::error::AppError;
use crate::models::{ClusterResponse, ClusterResponseV2, ClusterResult, IncomingFile, UploadRequest};
use axum::{
    Json,
    extract::{Multipart, State},
    extract::multipart::MultipartError,
};
use futures::TryStreamExt;
use tokio_util::io::StreamReader;

/// Multipart field carrying the dataset
const FILE_FIELD: &str = "file";

#[utoipa::path(
    post,
    path = "/upload",
    request_body(content = Multipart, description = "Dataset upload in the `file` field"),
    responses(
        (status = 200, description = "Dataset clustered", body = ClusterResponse),
        (status = 400, description = "No file or unsupported dataset"),
        (status = 413, description = "Dataset too large"),
        (status = 500, description = "Staging, engine or decoding failure")
    ),
    tag = "analysis"
)]
pub async fn upload_dataset(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<ClusterResponse>, AppError> {
    let result = analyze_multipart(&state, multipart).await?;
    Ok(Json(ClusterResponse::from(result)))
}

#[utoipa::path(
    post,
    path = "/v2/analyze",
    request_body(content = Multipart, description = "Dataset upload in the `file` field"),
    responses(
        (status = 200, description = "Dataset clustered", body = ClusterResponseV2),
        (status = 400, description = "No file or unsupported dataset"),
        (status = 413, description = "Dataset too large"),
        (status = 500, description = "Staging, engine or decoding failure")
    ),
    tag = "analysis"
)]
pub async fn analyze_dataset(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<ClusterResponseV2>, AppError> {
    let result = analyze_multipart(&state, multipart).await?;
    Ok(Json(ClusterResponseV2::from(result)))
}

/// Feeds the first `file` part straight into the pipeline without buffering
/// it in memory. Other fields are ignored.
async fn analyze_multipart(
    state: &AppState,
    mut multipart: Multipart,
) -> Result<ClusterResult, AppError> {
    let expose = state.config.expose_engine_diagnostics;

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }
        // A part without a filename is a plain form value, not a file
        if field.file_name().is_none_or(|name| name.trim().is_empty()) {
            continue;
        }

        let original_filename = field.file_name().map(str::to_string);
        let content_type = field.content_type().map(str::to_string);
        tracing::info!(
            "📂 Dataset received: {} ({})",
            original_filename.as_deref().unwrap_or("unnamed"),
            content_type.as_deref().unwrap_or("unknown type")
        );

        let body = StreamReader::new(field.map_err(std::io::Error::other));
        let request = UploadRequest::with_file(IncomingFile {
            original_filename,
            content_type,
            declared_size: None,
            body: Box::new(body),
        });

        return state
            .analysis
            .analyze(request)
            .await
            .map_err(|e| AppError::analysis(e, expose));
    }

    state
        .analysis
        .analyze(UploadRequest::empty())
        .await
        .map_err(|e| AppError::analysis(e, expose))
}

fn multipart_error(e: MultipartError) -> AppError {
    let err_msg = e.to_string();
    if err_msg.contains("length limit exceeded") {
        AppError::PayloadTooLarge("Request body exceeds the maximum allowed limit".to_string())
    } else {
        AppError::BadRequest(err_msg)
    }
}
