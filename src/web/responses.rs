//! HTTP response types and error mapping
//!
//! Every endpoint answers with the same envelope so clients can check
//! `success` without caring which route they called. Domain errors map to
//! status codes here and nowhere else.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::errors::{CancelError, RerunError, SubmitError};
use crate::store::StoreError;

/// Standard API response wrapper
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ApiResponse<T> {
    /// Whether the operation was successful
    pub success: bool,
    /// Response data (present on success)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    /// Error message (present on failure)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Machine-readable error context
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<HashMap<String, String>>,
    /// Response timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl<T> ApiResponse<T>
where
    T: Serialize,
{
    /// Create a successful response
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            details: None,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Create an error response
    pub fn error(message: String) -> ApiResponse<()> {
        ApiResponse {
            success: false,
            data: None,
            error: Some(message),
            details: None,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Create an error response with details
    pub fn error_with_details(message: String, details: HashMap<String, String>) -> ApiResponse<()> {
        ApiResponse {
            success: false,
            data: None,
            error: Some(message),
            details: Some(details),
            timestamp: chrono::Utc::now(),
        }
    }
}

impl<T> IntoResponse for ApiResponse<T>
where
    T: Serialize,
{
    fn into_response(self) -> Response {
        let status = if self.success {
            StatusCode::OK
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };

        (status, Json(self)).into_response()
    }
}

/// Success response helpers
pub fn ok<T: Serialize>(data: T) -> impl IntoResponse {
    (StatusCode::OK, Json(ApiResponse::success(data)))
}

pub fn created<T: Serialize>(data: T) -> impl IntoResponse {
    (StatusCode::CREATED, Json(ApiResponse::success(data)))
}

/// Map a submission rejection to its status code. Busy targets and full
/// capacity carry machine-readable details so callers can back off or
/// follow the conflicting job.
pub fn submit_error_response(error: SubmitError) -> Response {
    let (status, details) = match &error {
        SubmitError::InvalidSpec(_) => (StatusCode::BAD_REQUEST, None),
        SubmitError::TargetBusy { target, owner } => {
            let mut details = HashMap::new();
            details.insert("target".to_string(), target.clone());
            details.insert("owner_job_id".to_string(), owner.to_string());
            (StatusCode::CONFLICT, Some(details))
        }
        SubmitError::AtCapacity { limit } => {
            let mut details = HashMap::new();
            details.insert("limit".to_string(), limit.to_string());
            (StatusCode::TOO_MANY_REQUESTS, Some(details))
        }
        SubmitError::Internal { .. } => (StatusCode::INTERNAL_SERVER_ERROR, None),
    };

    let body = match details {
        Some(details) => ApiResponse::<()>::error_with_details(error.to_string(), details),
        None => ApiResponse::<()>::error(error.to_string()),
    };
    (status, Json(body)).into_response()
}

pub fn cancel_error_response(error: CancelError) -> Response {
    let status = match &error {
        CancelError::NotFound { .. } => StatusCode::NOT_FOUND,
        CancelError::AlreadyTerminal { .. } => StatusCode::CONFLICT,
        CancelError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(ApiResponse::<()>::error(error.to_string()))).into_response()
}

pub fn rerun_error_response(error: RerunError) -> Response {
    match error {
        RerunError::NotFound { .. } => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::<()>::error(error.to_string())),
        )
            .into_response(),
        RerunError::Submit(submit) => submit_error_response(submit),
    }
}

pub fn store_error_response(error: StoreError) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ApiResponse::<()>::error(format!("storage operation failed: {error}"))),
    )
        .into_response()
}

pub fn not_found_response(resource: &str, id: Uuid) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(ApiResponse::<()>::error(format!(
            "{resource} with id '{id}' not found"
        ))),
    )
        .into_response()
}
