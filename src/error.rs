//! JSON error responses for the admin API

use crate::pipeline::ApplyError;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Error codes returned by the admin API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdminErrorCode {
    /// Missing or wrong bearer token
    Unauthorized,
    /// Unknown route or entity
    NotFound,
    /// Request body is not the expected JSON
    InvalidBody,
    /// Input parsed but failed validation
    ValidationFailed,
    /// Stored, but the configuration directory could not be written
    SyncFailed,
    /// The store rejected the operation
    StoreError,
    InternalError,
}

impl AdminErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            AdminErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            AdminErrorCode::NotFound => StatusCode::NOT_FOUND,
            AdminErrorCode::InvalidBody => StatusCode::BAD_REQUEST,
            AdminErrorCode::ValidationFailed => StatusCode::UNPROCESSABLE_ENTITY,
            AdminErrorCode::SyncFailed => StatusCode::INTERNAL_SERVER_ERROR,
            AdminErrorCode::StoreError => StatusCode::INTERNAL_SERVER_ERROR,
            AdminErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Admin-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            AdminErrorCode::Unauthorized => "UNAUTHORIZED",
            AdminErrorCode::NotFound => "NOT_FOUND",
            AdminErrorCode::InvalidBody => "INVALID_BODY",
            AdminErrorCode::ValidationFailed => "VALIDATION_FAILED",
            AdminErrorCode::SyncFailed => "SYNC_FAILED",
            AdminErrorCode::StoreError => "STORE_ERROR",
            AdminErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl From<&ApplyError> for AdminErrorCode {
    fn from(e: &ApplyError) -> Self {
        match e {
            ApplyError::NotFound { .. } => AdminErrorCode::NotFound,
            ApplyError::Invalid(_) => AdminErrorCode::ValidationFailed,
            ApplyError::Store(_) => AdminErrorCode::StoreError,
            ApplyError::Sync(_) => AdminErrorCode::SyncFailed,
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: AdminErrorCode,
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: AdminErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Admin-Error header
pub fn json_error_response(code: AdminErrorCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    let error = ErrorResponse::new(code, message);

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Admin-Error", code.as_header_value())
        .body(Full::new(Bytes::from(error.to_json())))
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::SyncError;
    use std::path::PathBuf;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(AdminErrorCode::Unauthorized.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(AdminErrorCode::InvalidBody.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            AdminErrorCode::ValidationFailed.status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            AdminErrorCode::SyncFailed.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(AdminErrorCode::NotFound, "host 4 not found");
        let json = error.to_json();

        assert!(json.contains("\"code\":\"NOT_FOUND\""));
        assert!(json.contains("\"message\":\"host 4 not found\""));
        assert!(json.contains("\"status\":404"));
    }

    #[test]
    fn test_json_error_response() {
        let response = json_error_response(AdminErrorCode::SyncFailed, "disk full");

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(response.headers().get("X-Admin-Error").unwrap(), "SYNC_FAILED");
    }

    #[test]
    fn test_apply_error_mapping() {
        let not_found = ApplyError::NotFound { kind: "host", id: 1 };
        assert_eq!(AdminErrorCode::from(&not_found), AdminErrorCode::NotFound);

        let invalid = ApplyError::Invalid(anyhow::anyhow!("bad"));
        assert_eq!(AdminErrorCode::from(&invalid), AdminErrorCode::ValidationFailed);

        let sync = ApplyError::Sync(SyncError::CreateDir {
            path: PathBuf::from("/x"),
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        });
        assert_eq!(AdminErrorCode::from(&sync), AdminErrorCode::SyncFailed);
    }
}
