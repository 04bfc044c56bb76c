//!
//! # HTTP Error Mapping
//!
//! `AppError` is the error type every handler returns. It implements
//! `actix_web::error::ResponseError`, so a failure anywhere below a handler ends up as a
//! status code plus a JSON body of the form `{"error": "<message>"}`.
//!
//! Domain errors (`AuthError`) and request validation failures
//! (`validator::ValidationErrors`) convert into it through `From`, which keeps handlers
//! on `?`. Database errors never reach this layer directly; they arrive as `AuthError`.

use actix_web::{
    error::{JsonPayloadError, ResponseError},
    http::{header, StatusCode},
    HttpRequest, HttpResponse,
};
use serde_json::json;
use std::fmt;
use validator::ValidationErrors;

use crate::auth::AuthError;

/// Represents all possible errors a request can end in.
#[derive(Debug)]
pub enum AppError {
    /// Missing, expired or otherwise unusable credentials (HTTP 401).
    /// Responses carry `WWW-Authenticate: Bearer`.
    Unauthorized(String),
    /// Authenticated but not allowed to proceed (HTTP 403).
    Forbidden(String),
    /// Malformed request body (HTTP 400).
    BadRequest(String),
    /// Represents a situation where a requested resource was not found (HTTP 404).
    NotFound(String),
    /// The resource already exists (HTTP 409).
    Conflict(String),
    /// Represents an error due to failed input validation (HTTP 422 Unprocessable Entity).
    /// Wraps errors from the `validator` crate.
    ValidationError(String),
    /// A dependency such as the database is unreachable (HTTP 503).
    ServiceUnavailable(String),
    /// Represents an unexpected server-side error (HTTP 500).
    InternalServerError(String),
}

impl AppError {
    fn message(&self) -> &str {
        match self {
            AppError::Unauthorized(msg)
            | AppError::Forbidden(msg)
            | AppError::BadRequest(msg)
            | AppError::NotFound(msg)
            | AppError::Conflict(msg)
            | AppError::ValidationError(msg)
            | AppError::ServiceUnavailable(msg)
            | AppError::InternalServerError(msg) => msg,
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AppError::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            AppError::Forbidden(msg) => write!(f, "Forbidden: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad Request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not Found: {}", msg),
            AppError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation Error: {}", msg),
            AppError::ServiceUnavailable(msg) => write!(f, "Service Unavailable: {}", msg),
            AppError::InternalServerError(msg) => write!(f, "Internal Server Error: {}", msg),
        }
    }
}

/// Converts `AppError` variants into `HttpResponse` objects.
impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::ValidationError(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::InternalServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let mut response = HttpResponse::build(self.status_code());
        if let AppError::Unauthorized(_) = self {
            response.insert_header((header::WWW_AUTHENTICATE, "Bearer"));
        }
        response.json(json!({
            "error": self.message()
        }))
    }
}

impl From<AuthError> for AppError {
    fn from(error: AuthError) -> AppError {
        let msg = error.to_string();
        match error {
            AuthError::DuplicateEmail => AppError::Conflict(msg),
            AuthError::InvalidCredentials
            | AuthError::Expired
            | AuthError::Invalid
            | AuthError::AlreadyUsed => AppError::Unauthorized(msg),
            AuthError::Unverified => AppError::Forbidden(msg),
            AuthError::NotFound => AppError::NotFound(msg),
            AuthError::Unavailable(detail) => {
                log::error!("Storage unavailable: {}", detail);
                AppError::ServiceUnavailable("Service temporarily unavailable".into())
            }
            AuthError::Internal(detail) => {
                // Details stay in the log.
                log::error!("Internal error: {}", detail);
                AppError::InternalServerError("Internal server error".into())
            }
        }
    }
}

/// Converts `validator::ValidationErrors` into `AppError::ValidationError`.
///
/// The detailed validation messages are preserved.
impl From<ValidationErrors> for AppError {
    fn from(error: ValidationErrors) -> AppError {
        AppError::ValidationError(error.to_string())
    }
}

/// Error handler for `web::JsonConfig`; malformed bodies get the same JSON shape as
/// every other error.
pub fn json_error_handler(error: JsonPayloadError, _req: &HttpRequest) -> actix_web::Error {
    AppError::BadRequest(error.to_string()).into()
}
