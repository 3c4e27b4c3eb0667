//! Crate-wide error type and the HTTP status taxonomy from the design spec.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::path::PathBuf;

/// The error-kind taxonomy. Every handler classifies on this instead of
/// matching error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidPath,
    InvalidPayload,
    NotFound,
    AlreadyExists,
    ForbiddenOrigin,
    ServiceUnavailable,
    Io,
    Internal,
}

impl ErrorKind {
    pub fn status(self) -> StatusCode {
        match self {
            ErrorKind::InvalidPath | ErrorKind::InvalidPayload => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::AlreadyExists => StatusCode::CONFLICT,
            ErrorKind::ForbiddenOrigin => StatusCode::FORBIDDEN,
            ErrorKind::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Io | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// The crate-wide error. Library layers attach an operation and, where
/// relevant, a path; handlers map `kind()` to an HTTP status and never
/// leak the underlying cause to the client.
#[derive(Debug, thiserror::Error)]
pub enum WikiError {
    #[error("invalid path{}: {message}", path.as_ref().map(|p| format!(" {p:?}")).unwrap_or_default())]
    InvalidPath {
        message: String,
        path: Option<PathBuf>,
    },

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("not found: {0:?}")]
    NotFound(PathBuf),

    #[error("already exists: {0:?}")]
    AlreadyExists(PathBuf),

    #[error("forbidden: invalid origin")]
    ForbiddenOrigin,

    #[error("search service unavailable")]
    ServiceUnavailable,

    #[error("io error during {operation} on {path:?}: {source}")]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

impl WikiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WikiError::InvalidPath { .. } => ErrorKind::InvalidPath,
            WikiError::InvalidPayload(_) => ErrorKind::InvalidPayload,
            WikiError::NotFound(_) => ErrorKind::NotFound,
            WikiError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            WikiError::ForbiddenOrigin => ErrorKind::ForbiddenOrigin,
            WikiError::ServiceUnavailable => ErrorKind::ServiceUnavailable,
            WikiError::Io { .. } => ErrorKind::Io,
            WikiError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn io(operation: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        WikiError::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    pub fn invalid_path(message: impl Into<String>) -> Self {
        WikiError::InvalidPath {
            message: message.into(),
            path: None,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for WikiError {
    fn into_response(self) -> Response {
        let status = self.kind().status();
        // Internal causes never leave the process; only `Display` of the
        // public variants (which carry no secrets) reaches the client.
        let message = match &self {
            WikiError::Io { .. } => "internal error".to_string(),
            WikiError::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        };
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (status, Json(ErrorBody { error: message })).into_response()
    }
}

pub type WikiResult<T> = Result<T, WikiError>;
