use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::services::engine::EngineError;
use crate::services::orchestrator::AnalysisError;
use crate::utils::validation::Rejection;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Bad Request: {0}")]
    BadRequest(String),

    #[error("Payload Too Large: {0}")]
    PayloadTooLarge(String),

    #[error("Analysis error: {error}")]
    Analysis {
        error: AnalysisError,
        /// Echo engine diagnostics in the response body
        expose_diagnostics: bool,
    },
}

impl AppError {
    pub fn analysis(error: AnalysisError, expose_diagnostics: bool) -> Self {
        AppError::Analysis {
            error,
            expose_diagnostics,
        }
    }
}

impl From<AnalysisError> for AppError {
    fn from(error: AnalysisError) -> Self {
        AppError::analysis(error, false)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            AppError::PayloadTooLarge(msg) => {
                (StatusCode::PAYLOAD_TOO_LARGE, "FILE_TOO_LARGE", msg)
            }
            AppError::Analysis {
                error,
                expose_diagnostics,
            } => {
                let code = error.code();
                match error {
                    AnalysisError::Input(rejection @ Rejection::FileTooLarge { .. }) => {
                        (StatusCode::PAYLOAD_TOO_LARGE, code, rejection.to_string())
                    }
                    AnalysisError::Input(rejection) => {
                        (StatusCode::BAD_REQUEST, code, rejection.to_string())
                    }
                    // Diagnostics were already logged by the pipeline
                    AnalysisError::Engine(EngineError::Crashed { stderr, .. })
                        if expose_diagnostics =>
                    {
                        (StatusCode::INTERNAL_SERVER_ERROR, code, stderr)
                    }
                    other if expose_diagnostics => {
                        (StatusCode::INTERNAL_SERVER_ERROR, code, other.to_string())
                    }
                    AnalysisError::Contract(_) => (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        code,
                        "Invalid analysis output".to_string(),
                    ),
                    _ => (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        code,
                        "Analysis failed".to_string(),
                    ),
                }
            }
        };

        let body = Json(json!({
            "error": message,
            "code": code,
        }));

        (status, body).into_response()
    }
}
