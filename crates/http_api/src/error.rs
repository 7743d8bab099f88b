use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("server {0} is not configured")]
    UnknownServer(String),
    #[error("invalid server endpoint {0}")]
    InvalidEndpoint(String),
    #[error("request failed with status {0}")]
    Status(u16),
    #[error("server error ({status}): {reason}")]
    Server { status: u16, reason: String },
    #[error("unexpected result: {0}")]
    UnexpectedResult(String),
    #[error("response carries no {0}")]
    MissingField(&'static str),
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
    #[error("invalid response body: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    status: u16,
    reason: String,
}

impl ApiError {
    /// Maps a failed response to the server's own error when the body has one.
    pub(crate) fn from_failure(status: u16, body: &str) -> Self {
        match serde_json::from_str::<ErrorEnvelope>(body) {
            Ok(envelope) => ApiError::Server {
                status: envelope.error.status,
                reason: envelope.error.reason,
            },
            Err(_) => ApiError::Status(status),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_server_reason_over_status() {
        let err = ApiError::from_failure(
            500,
            r#"{"error":{"status":409,"reason":"session is closed"}}"#,
        );
        assert_eq!(err.to_string(), "server error (409): session is closed");
        assert!(matches!(ApiError::from_failure(502, "<html>"), ApiError::Status(502)));
        assert!(matches!(ApiError::from_failure(404, ""), ApiError::Status(404)));
    }
}
