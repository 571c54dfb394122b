use serde::{Deserialize, Serialize};

/// Uniform wrapper around every REST payload: `{code, data, message}`.
///
/// Error bodies from the gateway sometimes carry `{error: {message}}`
/// instead of a top-level message; both shapes deserialize here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    #[serde(default)]
    pub code: i64,
    pub data: Option<T>,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
}

impl<T> Envelope<T> {
    pub fn is_success(&self) -> bool {
        self.code == 0
    }

    /// The most specific message the server gave, if any.
    pub fn server_message(&self) -> Option<&str> {
        self.error
            .as_ref()
            .map(|e| e.message.as_str())
            .filter(|m| !m.is_empty())
            .or_else(|| Some(self.message.as_str()).filter(|m| !m.is_empty()))
    }
}
