use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{fmt, io};
use thiserror::Error;

use crate::models::node::Redirect;

/// Fixed outcome taxonomy shared by every storage component.
///
/// Success outcomes are the `Ok` side of [`StorageResult`]; this enum only
/// names the ways an operation can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    OutOfRange,
    Locked,
    DiskFull,
    IoError,
    PermissionsError,
    StreamError,
    ServerError,
    InvalidArgument,
    ReplicationFailed,
    Redirect,
}

impl ErrorKind {
    /// HTTP status family consumed by the protocol layer.
    pub fn status_code(self) -> u16 {
        match self {
            ErrorKind::NotFound => 404,
            ErrorKind::AlreadyExists | ErrorKind::Locked => 409,
            ErrorKind::OutOfRange => 416,
            ErrorKind::InvalidArgument => 400,
            ErrorKind::Redirect => 307,
            ErrorKind::ReplicationFailed => 502,
            ErrorKind::DiskFull
            | ErrorKind::IoError
            | ErrorKind::PermissionsError
            | ErrorKind::StreamError
            | ErrorKind::ServerError => 500,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("`{0}` not found")]
    NotFound(String),
    #[error("`{0}` already exists")]
    AlreadyExists(String),
    #[error("range out of bounds: offset {offset}, count {count}, size {size}")]
    OutOfRange { offset: u64, count: u64, size: u64 },
    #[error("resource `{0}` is locked")]
    Locked(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("disk full: {0}")]
    DiskFull(String),
    #[error("permission denied: {0}")]
    Permissions(String),
    #[error("stream error: {0}")]
    Stream(String),
    #[error("replication failed: {0}")]
    Replication(String),
    #[error("container is owned by node {}", .0.node.id)]
    Redirect(Box<Redirect>),
    #[error("server error: {0}")]
    Server(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

impl StorageError {
    /// Classify a platform I/O failure against `subject` (usually a path).
    pub fn from_io(err: io::Error, subject: impl fmt::Display) -> Self {
        let message = format!("{subject}: {err}");
        match err.kind() {
            io::ErrorKind::NotFound => StorageError::NotFound(subject.to_string()),
            io::ErrorKind::AlreadyExists => StorageError::AlreadyExists(subject.to_string()),
            io::ErrorKind::StorageFull | io::ErrorKind::QuotaExceeded => {
                StorageError::DiskFull(message)
            }
            io::ErrorKind::UnexpectedEof | io::ErrorKind::BrokenPipe | io::ErrorKind::WriteZero => {
                StorageError::Stream(message)
            }
            // ENOSPC (28) and ERROR_DISK_FULL (112) when the kind is not mapped.
            _ if matches!(err.raw_os_error(), Some(28) | Some(112)) => {
                StorageError::DiskFull(message)
            }
            _ => StorageError::Permissions(message),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::NotFound(_) => ErrorKind::NotFound,
            StorageError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            StorageError::OutOfRange { .. } => ErrorKind::OutOfRange,
            StorageError::Locked(_) => ErrorKind::Locked,
            StorageError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            StorageError::DiskFull(_) => ErrorKind::DiskFull,
            StorageError::Permissions(_) => ErrorKind::PermissionsError,
            StorageError::Stream(_) => ErrorKind::StreamError,
            StorageError::Replication(_) => ErrorKind::ReplicationFailed,
            StorageError::Redirect(_) => ErrorKind::Redirect,
            StorageError::Server(_) => ErrorKind::ServerError,
            StorageError::Sqlx(sqlx::Error::Io(_)) => ErrorKind::IoError,
            StorageError::Sqlx(_) => ErrorKind::ServerError,
        }
    }
}

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
    pub location: Option<String>,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
            location: None,
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
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
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        let mut response = (self.status, body).into_response();
        if let Some(location) = self.location.as_deref() {
            if let Ok(value) = HeaderValue::from_str(location) {
                response.headers_mut().insert(header::LOCATION, value);
            }
        }
        response
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        let status = StatusCode::from_u16(err.kind().status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let location = match &err {
            StorageError::Redirect(redirect) => Some(redirect.location.clone()),
            _ => None,
        };
        Self {
            status,
            message: err.to_string(),
            location,
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_are_classified() {
        let missing = io::Error::new(io::ErrorKind::NotFound, "gone");
        assert_eq!(StorageError::from_io(missing, "a").kind(), ErrorKind::NotFound);

        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "no");
        assert_eq!(
            StorageError::from_io(denied, "a").kind(),
            ErrorKind::PermissionsError
        );

        let generic = io::Error::other("boom");
        assert_eq!(
            StorageError::from_io(generic, "a").kind(),
            ErrorKind::PermissionsError
        );

        let full = io::Error::from_raw_os_error(28);
        assert_eq!(StorageError::from_io(full, "a").kind(), ErrorKind::DiskFull);

        let truncated = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
        assert_eq!(
            StorageError::from_io(truncated, "a").kind(),
            ErrorKind::StreamError
        );
    }

    #[test]
    fn kinds_map_to_status_families() {
        assert_eq!(ErrorKind::OutOfRange.status_code(), 416);
        assert_eq!(ErrorKind::Locked.status_code(), 409);
        assert_eq!(ErrorKind::AlreadyExists.status_code(), 409);
        assert_eq!(ErrorKind::DiskFull.status_code(), 500);
        assert_eq!(ErrorKind::NotFound.status_code(), 404);
    }
}
