use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{Datelike, Local, NaiveDate};
use serde_json::json;
use thiserror::Error;

use crate::{
    plans::{Operation, Tier},
    upload::UploadError,
};

/// Request-level failures, mapped to an HTTP status at the endpoint
/// boundary. Nothing below the boundary retries; details that would leak
/// processing internals stay in the server log.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Model not available")]
    ModelNotAllowed { model: String },

    #[error("File too large")]
    FileTooLarge { max_bytes: usize, tier: Tier },

    #[error("Usage limit reached")]
    QuotaExceeded {
        operation: Operation,
        used: i64,
        limit: i64,
        tier: Tier,
    },

    #[error("Image processing failed.")]
    Processing,

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Validation(message) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
            }
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "Unauthorized" })),
            )
                .into_response(),
            ApiError::ModelNotAllowed { model } => (
                StatusCode::FORBIDDEN,
                Json(json!({
                    "error": "Model not available",
                    "message": format!(
                        "The {model} model is only available for Pro and Business subscribers."
                    ),
                    "upgradeUrl": "/pricing",
                })),
            )
                .into_response(),
            ApiError::FileTooLarge { max_bytes, tier } => (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(json!({
                    "error": "File too large",
                    "message": format!(
                        "Max file size for the {} tier is {}MB. Upgrade for larger files.",
                        tier.as_str(),
                        max_bytes / (1024 * 1024)
                    ),
                    "maxSize": max_bytes,
                })),
            )
                .into_response(),
            ApiError::QuotaExceeded {
                operation,
                used,
                limit,
                tier,
            } => {
                let mut body = json!({
                    "error": "Usage limit reached",
                    "message": format!(
                        "You've used all {limit} {} operations available to the {} tier. Upgrade to Pro for more.",
                        operation.as_str(),
                        tier.as_str()
                    ),
                    "operation": operation.as_str(),
                    "used": used,
                    "limit": limit,
                    "tier": tier.as_str(),
                    "upgradeUrl": "/pricing",
                });
                // Guests have a lifetime cap; only monthly quotas reset.
                if tier != Tier::Guest {
                    body["resetsAt"] = json!(next_month_start_iso());
                }
                (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response()
            }
            ApiError::Processing => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Image processing failed." })),
            )
                .into_response(),
            ApiError::Internal(error) => {
                tracing::error!(error = ?error, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "Internal server error" })),
                )
                    .into_response()
            }
        }
    }
}

impl From<UploadError> for ApiError {
    fn from(error: UploadError) -> Self {
        match error {
            UploadError::MissingFile
            | UploadError::UnsupportedFileType
            | UploadError::FileTooLarge => ApiError::Validation(error.to_string()),
            UploadError::MultipartError | UploadError::IoError => {
                ApiError::Internal(anyhow::anyhow!(error.to_string()))
            }
        }
    }
}

fn next_month_start_iso() -> String {
    let today = Local::now().date_naive();
    let (year, month) = if today.month() == 12 {
        (today.year() + 1, 1)
    } else {
        (today.year(), today.month() + 1)
    };
    let first = NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(today);
    format!("{}T00:00:00", first.format("%Y-%m-%d"))
}
