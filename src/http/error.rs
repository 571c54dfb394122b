use reqwest::StatusCode;

/// Everything that can go wrong on the request/response path.
///
/// Payloads are plain strings so the error can be cloned into observable
/// request state and fanned out to every waiter of a shared refresh.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    #[error("network error: {0}")]
    Transport(String),
    #[error("request timed out")]
    Timeout,
    #[error("{message}")]
    Status { status: u16, message: String },
    #[error("{message} (code {code})")]
    Application { code: i64, message: String },
    #[error("malformed response: {0}")]
    Decode(String),
    #[error("session expired, please sign in again")]
    SessionExpired,
    #[error("not authorized after refreshing credentials")]
    Unauthorized,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ApiError {
    /// Errors that end the session and send the user back to the login page.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ApiError::SessionExpired)
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub(crate) fn from_status(status: StatusCode, server_message: Option<&str>) -> Self {
        ApiError::Status {
            status: status.as_u16(),
            message: server_message
                .map(str::to_owned)
                .unwrap_or_else(|| default_status_message(status)),
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ApiError::Timeout
        } else if e.is_decode() {
            ApiError::Decode(e.to_string())
        } else if e.is_builder() {
            ApiError::InvalidRequest(e.to_string())
        } else {
            ApiError::Transport(e.to_string())
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        ApiError::Decode(e.to_string())
    }
}

pub(crate) fn default_status_message(status: StatusCode) -> String {
    let message = match status.as_u16() {
        400 => "bad request parameters",
        401 => "not authorized, please sign in again",
        403 => "permission denied for this operation",
        404 => "requested resource does not exist",
        405 => "method not allowed",
        408 => "request timed out",
        409 => "data conflict",
        422 => "validation failed",
        429 => "too many requests, please retry later",
        500 => "internal server error",
        502 => "bad gateway",
        503 => "service temporarily unavailable",
        504 => "gateway timed out",
        code => return format!("request failed ({})", code),
    };
    message.to_string()
}
