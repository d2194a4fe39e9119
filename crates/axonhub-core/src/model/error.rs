use http::StatusCode;
use serde::{Deserialize, Serialize};

/// Neutral error kinds. Every provider error envelope is normalized to one
/// of these before crossing a pipeline hop.
pub const ERROR_TYPE_INVALID_REQUEST: &str = "invalid_request";
pub const ERROR_TYPE_AUTH: &str = "auth_error";
pub const ERROR_TYPE_PERMISSION: &str = "permission_error";
pub const ERROR_TYPE_NOT_FOUND: &str = "not_found";
pub const ERROR_TYPE_RATE_LIMIT: &str = "rate_limit";
pub const ERROR_TYPE_API: &str = "api_error";
pub const ERROR_TYPE_STREAM: &str = "stream_error";

/// The dialect-independent payload of an error response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub code: Option<String>,
    pub request_id: Option<String>,
}

/// Wire form: `{"error": {...}}`. The HTTP status code travels out of band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorDetail,
}

/// A neutral error carrying the HTTP status to render plus the detail to
/// wrap in each dialect's envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseError {
    pub status_code: u16,
    pub detail: ErrorDetail,
}

impl std::fmt::Display for ResponseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Request failed: {}, error: {}, code: {}, type: {}",
            status_text(self.status_code),
            self.detail.message,
            self.detail.code.as_deref().unwrap_or(""),
            self.detail.kind,
        )?;
        if let Some(request_id) = self.detail.request_id.as_deref() {
            write!(f, ", request_id: {request_id}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ResponseError {}

fn status_text(code: u16) -> &'static str {
    StatusCode::from_u16(code)
        .ok()
        .and_then(|status| status.canonical_reason())
        .unwrap_or("Unknown")
}

impl ResponseError {
    pub fn new(status_code: u16, kind: &str, message: impl Into<String>) -> Self {
        Self {
            status_code,
            detail: ErrorDetail {
                message: message.into(),
                kind: kind.to_owned(),
                code: None,
                request_id: None,
            },
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(400, ERROR_TYPE_INVALID_REQUEST, message)
    }

    pub fn auth_error(message: impl Into<String>) -> Self {
        Self::new(401, ERROR_TYPE_AUTH, message)
    }

    pub fn permission_error(message: impl Into<String>) -> Self {
        Self::new(403, ERROR_TYPE_PERMISSION, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(404, ERROR_TYPE_NOT_FOUND, message)
    }

    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self::new(429, ERROR_TYPE_RATE_LIMIT, message)
    }

    pub fn api_error(message: impl Into<String>) -> Self {
        Self::new(500, ERROR_TYPE_API, message)
    }

    pub fn stream_error(message: impl Into<String>) -> Self {
        Self::new(500, ERROR_TYPE_STREAM, message)
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.detail.code = Some(code.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.detail.request_id = Some(request_id.into());
        self
    }

    /// The neutral kind matching an upstream HTTP status.
    pub fn kind_for_status(status: u16) -> &'static str {
        match status {
            400 => ERROR_TYPE_INVALID_REQUEST,
            401 => ERROR_TYPE_AUTH,
            403 => ERROR_TYPE_PERMISSION,
            404 => ERROR_TYPE_NOT_FOUND,
            429 => ERROR_TYPE_RATE_LIMIT,
            _ => ERROR_TYPE_API,
        }
    }

    pub fn envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            error: self.detail.clone(),
        }
    }
}

impl From<serde_json::Error> for ResponseError {
    fn from(err: serde_json::Error) -> Self {
        Self::api_error(format!("JSON error: {err}"))
    }
}
