use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::error::{HostError, ProviderConfigError, VolumeError};

/// Machine-readable error category carried in every error body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    AlreadyStopped,
    Conflict,
    ValidationError,
    ServerError,
    NoSuchJob,
    /// An event stream listener was dropped after its queue filled.
    ListenerOverflow,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

/// A domain error translated into an HTTP response.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    pub fn new(status: StatusCode, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                code,
                message: message.into(),
            },
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn body(&self) -> &ErrorBody {
        &self.body
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = %self.status, message = %self.body.message, "Request failed");
        } else {
            tracing::debug!(status = %self.status, message = %self.body.message, "Request rejected");
        }
        (self.status, Json(self.body)).into_response()
    }
}

impl From<HostError> for ApiError {
    fn from(err: HostError) -> Self {
        let message = err.to_string();
        match err {
            HostError::UnknownJob(_) => {
                ApiError::new(StatusCode::NOT_FOUND, ErrorCode::NotFound, message)
            }
            HostError::AlreadyStopped(_) => {
                ApiError::new(StatusCode::CONFLICT, ErrorCode::AlreadyStopped, message)
            }
            HostError::JobExists(_) | HostError::InvalidTransition { .. } => {
                ApiError::new(StatusCode::CONFLICT, ErrorCode::Conflict, message)
            }
            HostError::Backend(_) => ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorCode::ServerError,
                message,
            ),
        }
    }
}

impl From<ProviderConfigError> for ApiError {
    fn from(err: ProviderConfigError) -> Self {
        if err.is_validation() {
            ApiError::new(
                StatusCode::BAD_REQUEST,
                ErrorCode::ValidationError,
                err.to_string(),
            )
        } else {
            ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorCode::ServerError,
                err.to_string(),
            )
        }
    }
}

impl From<VolumeError> for ApiError {
    fn from(err: VolumeError) -> Self {
        let message = err.to_string();
        match err {
            VolumeError::ProviderAlreadyExists(_) => {
                ApiError::new(StatusCode::BAD_REQUEST, ErrorCode::Conflict, message)
            }
            VolumeError::NoSuchProvider(_) | VolumeError::NoSuchVolume(_) => {
                ApiError::new(StatusCode::NOT_FOUND, ErrorCode::NotFound, message)
            }
            VolumeError::Backend(_) => ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorCode::ServerError,
                message,
            ),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::new(
            StatusCode::BAD_REQUEST,
            ErrorCode::ValidationError,
            rejection.body_text(),
        )
    }
}
