use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use validator::{ValidationErrors, ValidationErrorsKind};

/// Messages reported against one request field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldError {
    pub field_name: String,
    pub errors: Vec<String>,
}

/// Field errors keyed (and therefore sorted) by field name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldErrors(BTreeMap<String, Vec<String>>);

impl FieldErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.0.entry(field.into()).or_default().push(message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, field: &str) -> Option<&[String]> {
        self.0.get(field).map(Vec::as_slice)
    }

    pub fn to_vec(&self) -> Vec<FieldError> {
        self.0
            .iter()
            .map(|(field_name, errors)| FieldError {
                field_name: field_name.clone(),
                errors: errors.clone(),
            })
            .collect()
    }

    fn collect(&mut self, prefix: Option<&str>, errors: &ValidationErrors) {
        for (field, kind) in errors.errors() {
            let field = field.to_string();
            let name = match (prefix, field.as_str()) {
                (Some(p), "__all__") | (Some(p), "") => p.to_string(),
                (Some(p), f) => format!("{}.{}", p, f),
                (None, "__all__") => String::new(),
                (None, f) => f.to_string(),
            };
            match kind {
                ValidationErrorsKind::Field(list) => {
                    for err in list {
                        let message = err
                            .message
                            .as_ref()
                            .map(|m| m.to_string())
                            .unwrap_or_else(|| err.code.to_string());
                        self.add(name.clone(), message);
                    }
                }
                ValidationErrorsKind::Struct(inner) => self.collect(Some(&name), inner),
                ValidationErrorsKind::List(items) => {
                    for (idx, inner) in items {
                        self.collect(Some(&format!("{}[{}]", name, idx)), inner);
                    }
                }
            }
        }
    }
}

impl std::fmt::Display for FieldErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|(field, errors)| {
                if field.is_empty() {
                    errors.join(", ")
                } else {
                    format!("{}: {}", field, errors.join(", "))
                }
            })
            .collect();
        write!(f, "{}", parts.join(", "))
    }
}

impl From<ValidationErrors> for FieldErrors {
    fn from(errors: ValidationErrors) -> Self {
        let mut out = FieldErrors::new();
        out.collect(None, &errors);
        out
    }
}

/// The JSON body of every API error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub code: u16,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub field_errors: Vec<FieldError>,
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("validation failed: {0}")]
    ValidationError(FieldErrors),

    #[error("bad request: {0}")]
    BadRequest(anyhow::Error),

    #[error("{0}")]
    NotFound(String),

    /// Credential failures; the detail is logged, never returned.
    #[error("unauthorized: {0}")]
    Unauthorized(anyhow::Error),

    #[error("token expired")]
    Expired,

    #[error("{0}")]
    Forbidden(String),

    #[error("{message}")]
    Conflict {
        message: String,
        field: Option<String>,
    },

    #[error("requested resource has expired")]
    Gone,

    #[error("{0}")]
    TooManyRequests(String, Option<u64>),

    #[error("Internal server error: {0}")]
    InternalError(#[from] anyhow::Error),

    #[error("bad gateway: {0}")]
    BadGateway(String),

    #[error("request timed out")]
    GatewayTimeout,

    #[error("client closed request")]
    ClientClosedRequest,

    #[error("not implemented")]
    NotImplemented,

    #[error("Service Unavailable")]
    ServiceUnavailable,

    #[error("Database error: {0}")]
    DatabaseError(anyhow::Error),

    #[error("Redis error: {0}")]
    RedisError(#[from] redis::RedisError),

    #[error("Email error: {0}")]
    EmailError(String),

    #[error("Configuration error: {0}")]
    ConfigError(anyhow::Error),
}

impl AppError {
    pub fn not_found() -> Self {
        AppError::NotFound("record not found".to_string())
    }

    pub fn unauthorized(detail: impl std::fmt::Display) -> Self {
        AppError::Unauthorized(anyhow::anyhow!("{}", detail))
    }

    pub fn bad_request(detail: impl std::fmt::Display) -> Self {
        AppError::BadRequest(anyhow::anyhow!("{}", detail))
    }

    /// A validation failure on a single field.
    pub fn field(field: impl Into<String>, message: impl Into<String>) -> Self {
        let mut errors = FieldErrors::new();
        errors.add(field, message);
        AppError::ValidationError(errors)
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::ValidationError(_) | AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Unauthorized(_) | AppError::Expired => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::Conflict { .. } => StatusCode::CONFLICT,
            AppError::Gone => StatusCode::GONE,
            AppError::TooManyRequests(..) => StatusCode::TOO_MANY_REQUESTS,
            AppError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            AppError::GatewayTimeout => StatusCode::GATEWAY_TIMEOUT,
            // 499 is a registered (non-standard) code, always in range.
            AppError::ClientClosedRequest => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST)
            }
            AppError::NotImplemented => StatusCode::NOT_IMPLEMENTED,
            AppError::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            AppError::InternalError(_)
            | AppError::DatabaseError(_)
            | AppError::RedisError(_)
            | AppError::EmailError(_)
            | AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn is_internal(&self) -> bool {
        self.status_code() == StatusCode::INTERNAL_SERVER_ERROR
    }

    /// Builds the response envelope without consuming the error.
    pub fn to_error_response(&self) -> ErrorResponse {
        let status = self.status_code();
        let (message, field_errors) = match self {
            AppError::ValidationError(errors) => (self.to_string(), errors.to_vec()),
            AppError::Unauthorized(_) => ("unauthorized".to_string(), Vec::new()),
            AppError::Conflict { message, field } => {
                let fields = field
                    .iter()
                    .map(|f| FieldError {
                        field_name: f.clone(),
                        errors: vec!["a record with that value already exists".to_string()],
                    })
                    .collect();
                (message.clone(), fields)
            }
            AppError::BadRequest(err) => (err.to_string(), Vec::new()),
            AppError::ServiceUnavailable => ("service unavailable".to_string(), Vec::new()),
            _ if self.is_internal() => ("internal server error".to_string(), Vec::new()),
            _ => (self.to_string(), Vec::new()),
        };
        ErrorResponse {
            code: status.as_u16(),
            message,
            field_errors,
        }
    }
}

impl From<ValidationErrors> for AppError {
    fn from(err: ValidationErrors) -> Self {
        AppError::ValidationError(FieldErrors::from(err))
    }
}

impl From<FieldErrors> for AppError {
    fn from(err: FieldErrors) -> Self {
        AppError::ValidationError(err)
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(anyhow::Error::new(err))
    }
}

impl From<lettre::error::Error> for AppError {
    fn from(err: lettre::error::Error) -> Self {
        AppError::EmailError(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalError(anyhow::Error::new(err))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.is_internal() {
            tracing::error!(error = ?self, "internal error");
        }

        let body = self.to_error_response();
        let retry_after = match &self {
            AppError::TooManyRequests(_, retry) => *retry,
            _ => None,
        };

        let mut res = (self.status_code(), Json(body)).into_response();

        if let Some(retry) = retry_after {
            res.headers_mut()
                .insert(axum::http::header::RETRY_AFTER, retry.into());
        }

        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_errors_are_sorted_by_name() {
        let mut errors = FieldErrors::new();
        errors.add("name", "is required");
        errors.add("expiry", "must be positive");
        let list = errors.to_vec();
        assert_eq!(list[0].field_name, "expiry");
        assert_eq!(list[1].field_name, "name");
    }

    #[test]
    fn unauthorized_hides_detail() {
        let err = AppError::unauthorized("bad secret for key abc");
        let body = err.to_error_response();
        assert_eq!(body.code, 401);
        assert_eq!(body.message, "unauthorized");
    }

    #[test]
    fn internal_errors_hide_detail() {
        let err = AppError::DatabaseError(anyhow::anyhow!("connection refused"));
        let body = err.to_error_response();
        assert_eq!(body.code, 500);
        assert_eq!(body.message, "internal server error");
    }

    #[test]
    fn conflict_names_the_field() {
        let err = AppError::Conflict {
            message: "value for name already exists".to_string(),
            field: Some("name".to_string()),
        };
        let body = err.to_error_response();
        assert_eq!(body.code, 409);
        assert_eq!(body.field_errors.len(), 1);
        assert_eq!(body.field_errors[0].field_name, "name");
    }

    #[test]
    fn validation_message_lists_fields() {
        let err = AppError::field("name", "is required");
        assert_eq!(err.to_string(), "validation failed: name: is required");
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn client_closed_request_is_499() {
        assert_eq!(AppError::ClientClosedRequest.status_code().as_u16(), 499);
    }

    #[test]
    fn too_many_requests_sets_retry_after() {
        let res = AppError::TooManyRequests("slow down".to_string(), Some(7)).into_response();
        assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(res.headers()[axum::http::header::RETRY_AFTER], "7");
    }
}
