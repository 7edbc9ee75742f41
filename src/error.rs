use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Failures talking to the upstream model endpoint.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    /// Connect / TLS / DNS failure before any response.
    #[error("upstream unavailable: {0}")]
    Unavailable(String),
    /// No bytes arrived within the configured window.
    #[error("upstream timed out after {0}s")]
    Timeout(u64),
    /// Malformed stream framing.
    #[error("upstream protocol error: {0}")]
    Protocol(String),
    /// Non-2xx response before the stream began.
    #[error("upstream returned status {0}")]
    Status(u16),
}

/// Request-level errors surfaced as JSON HTTP responses.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    InvalidInput(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("rate limited")]
    RateLimited { retry_after_secs: u64 },
    #[error("user not found")]
    UserNotFound,
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error("commit failed: {0}")]
    CommitFailed(String),
    #[error("internal error")]
    Internal(anyhow::Error),
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::UserNotFound => StatusCode::NOT_FOUND,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::CommitFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        if let ApiError::Internal(ref source) = self {
            tracing::error!("internal error: {:#}", source);
        }

        let body = match &self {
            ApiError::RateLimited { retry_after_secs } => json!({
                "error": { "message": self.to_string(), "retry_after": retry_after_secs }
            }),
            // Hide internal detail from clients; the log already has it.
            ApiError::Internal(_) => json!({
                "error": { "message": "Internal server error" }
            }),
            _ => json!({
                "error": { "message": self.to_string() }
            }),
        };

        let mut response = (status, Json(body)).into_response();
        if let ApiError::RateLimited { retry_after_secs } = self {
            if let Ok(value) = retry_after_secs.to_string().parse() {
                response.headers_mut().insert("retry-after", value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_match_error_kinds() {
        assert_eq!(
            ApiError::InvalidInput("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ApiError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ApiError::RateLimited { retry_after_secs: 30 }.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(ApiError::UserNotFound.status(), StatusCode::NOT_FOUND);
        // Every upstream failure kind surfaces as a 502 before the stream.
        for upstream in [
            UpstreamError::Unavailable("dns".into()),
            UpstreamError::Timeout(30),
            UpstreamError::Protocol("bad frame".into()),
            UpstreamError::Status(500),
        ] {
            assert_eq!(ApiError::Upstream(upstream).status(), StatusCode::BAD_GATEWAY);
        }
    }

    #[test]
    fn rate_limited_response_sets_retry_after() {
        let response = ApiError::RateLimited { retry_after_secs: 42 }.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get("retry-after").unwrap(), "42");
    }
}
