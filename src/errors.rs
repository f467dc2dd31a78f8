use crate::services::{
    caption_service::CaptionError, file_records::RecordError, scoped_client::ScopedClientError,
    storage_provider::StorageError,
};
use axum::{
    Json,
    extract::multipart::MultipartError,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, msg)
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, msg)
    }

    pub fn bad_gateway(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self.status.as_u16() {
            400..=499 => tracing::warn!("client error {}: {}", self.status, self.message),
            500..=599 => tracing::error!("server error {}: {}", self.status, self.message),
            _ => {}
        }

        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::InvalidPath(_) => AppError::bad_request(err.to_string()),
            StorageError::Provider(_) => AppError::bad_gateway(err.to_string()),
        }
    }
}

impl From<RecordError> for AppError {
    fn from(err: RecordError) -> Self {
        match err {
            RecordError::AccessDenied(_) => AppError::forbidden(err.to_string()),
            RecordError::Backend(_) => AppError::internal(err.to_string()),
        }
    }
}

impl From<CaptionError> for AppError {
    fn from(err: CaptionError) -> Self {
        match err {
            CaptionError::UnsupportedMediaType(_) => {
                AppError::new(StatusCode::UNSUPPORTED_MEDIA_TYPE, err.to_string())
            }
            CaptionError::EmptyUpload => AppError::bad_request(err.to_string()),
            CaptionError::Storage(inner) => inner.into(),
            CaptionError::Vision(inner) => AppError::bad_gateway(inner.to_string()),
            CaptionError::Record(inner) => inner.into(),
        }
    }
}

impl From<ScopedClientError> for AppError {
    fn from(err: ScopedClientError) -> Self {
        AppError::unauthorized(err.to_string())
    }
}

impl From<MultipartError> for AppError {
    fn from(err: MultipartError) -> Self {
        AppError::new(err.status(), err.body_text())
    }
}
