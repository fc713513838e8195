use crate::{
    handlers::xml_escape,
    services::{metadata_index::IndexError, multipart_registry::MultipartError},
};
use axum::{
    body::Body,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use std::{fmt, io};

/// A lightweight wrapper for general errors that keeps the message local.
///
/// Rendered as an S3-style `<Error>` document so SDK clients can surface the
/// code and message.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status, S3 error code and message.
    pub fn new(status: StatusCode, code: &'static str, msg: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "InternalError", msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NoSuchKey", msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "InvalidRequest", msg)
    }

    /// Shortcut for 403 Forbidden
    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "SignatureDoesNotMatch", msg)
    }

    /// Shortcut for 405 Method Not Allowed
    pub fn method_not_allowed(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::METHOD_NOT_ALLOWED, "MethodNotAllowed", msg)
    }

    /// Unknown, finished or expired multipart upload.
    pub fn no_such_upload(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NoSuchUpload", msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let xml = format!(
            concat!(
                r#"<?xml version="1.0" encoding="UTF-8"?>"#,
                r#"<Error><Code>{}</Code><Message>{}</Message></Error>"#
            ),
            self.code,
            xml_escape(&self.message)
        );

        let mut response = Response::new(Body::from(xml));
        *response.status_mut() = self.status;
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/xml"),
        );
        response
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

impl From<io::Error> for AppError {
    fn from(err: io::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

impl From<IndexError> for AppError {
    fn from(err: IndexError) -> Self {
        AppError::internal(err.to_string())
    }
}

impl From<MultipartError> for AppError {
    fn from(err: MultipartError) -> Self {
        match err {
            MultipartError::UnknownUpload(_) | MultipartError::NoSuchUpload(_) => {
                AppError::no_such_upload(err.to_string())
            }
            MultipartError::Io(err) => AppError::internal(err.to_string()),
        }
    }
}
