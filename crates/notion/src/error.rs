//! Error type shared by every remote operation.

/// Result alias for remote operations.
pub type Result<T> = std::result::Result<T, NotionError>;

#[derive(Debug, thiserror::Error)]
pub enum NotionError {
    /// The service asked us to slow down (HTTP 429 / `rate_limited`).
    #[error("rate limited by remote service: {message}")]
    RateLimited { message: String },

    #[error("remote API error ({status}, {code}): {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{object} response is missing field `{field}`")]
    MissingField { object: String, field: String },

    #[error("unexpected remote response: {0}")]
    Unexpected(String),
}

impl NotionError {
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::RateLimited {
            message: message.into(),
        }
    }

    pub fn missing_field(object: impl Into<String>, field: impl Into<String>) -> Self {
        Self::MissingField {
            object: object.into(),
            field: field.into(),
        }
    }

    /// Only rate-limit responses are worth retrying; everything else is
    /// surfaced to the caller immediately.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}
