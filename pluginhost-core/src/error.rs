use axum::response::{IntoResponse, Response};
use axum::{http::StatusCode, Json};

/// The error taxonomy shared by every RPC boundary in the core.
///
/// Each variant carries a human-readable message and maps to exactly one
/// HTTP status, standing in for the Connect-style error codes the original
/// transport would use. Leaf helpers (validation, crypto) return this type
/// directly; RPC handlers wrap lower-level errors once with context.
#[derive(Debug)]
pub enum RuntimeError {
    /// Bad magic cookie, bad version, malformed metadata/service type/version/path.
    InvalidArgument(String),
    /// Missing headers, unknown runtime id, invalid or expired token.
    Unauthenticated(String),
    /// Runtime not authorized to register this service type, or non-owner unregister.
    PermissionDenied(String),
    /// No eligible provider, unknown registration id, unknown provider id.
    NotFound(String),
    /// Required-for-startup dependency absent, or a dependency cycle.
    FailedPrecondition(String),
    /// Rate limiter denied the request.
    ResourceExhausted(String),
    /// Provider not in a traffic-eligible health state.
    Unavailable(String),
    /// Readiness wait, shutdown wait, or proxy timeout exceeded.
    DeadlineExceeded(String),
    /// CSPRNG failure or invariant violation.
    Internal(String),
}

impl RuntimeError {
    /// The HTTP status this error kind maps to at the RPC boundary.
    pub fn status(&self) -> StatusCode {
        match self {
            RuntimeError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            RuntimeError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            RuntimeError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            RuntimeError::NotFound(_) => StatusCode::NOT_FOUND,
            RuntimeError::FailedPrecondition(_) => StatusCode::PRECONDITION_FAILED,
            RuntimeError::ResourceExhausted(_) => StatusCode::TOO_MANY_REQUESTS,
            RuntimeError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            RuntimeError::DeadlineExceeded(_) => StatusCode::GATEWAY_TIMEOUT,
            RuntimeError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// A short machine-readable kind name, included in the JSON error body.
    pub fn kind(&self) -> &'static str {
        match self {
            RuntimeError::InvalidArgument(_) => "invalid_argument",
            RuntimeError::Unauthenticated(_) => "unauthenticated",
            RuntimeError::PermissionDenied(_) => "permission_denied",
            RuntimeError::NotFound(_) => "not_found",
            RuntimeError::FailedPrecondition(_) => "failed_precondition",
            RuntimeError::ResourceExhausted(_) => "resource_exhausted",
            RuntimeError::Unavailable(_) => "unavailable",
            RuntimeError::DeadlineExceeded(_) => "deadline_exceeded",
            RuntimeError::Internal(_) => "internal",
        }
    }

    fn message(&self) -> &str {
        match self {
            RuntimeError::InvalidArgument(m)
            | RuntimeError::Unauthenticated(m)
            | RuntimeError::PermissionDenied(m)
            | RuntimeError::NotFound(m)
            | RuntimeError::FailedPrecondition(m)
            | RuntimeError::ResourceExhausted(m)
            | RuntimeError::Unavailable(m)
            | RuntimeError::DeadlineExceeded(m)
            | RuntimeError::Internal(m) => m,
        }
    }
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind(), self.message())
    }
}

impl std::error::Error for RuntimeError {}

impl IntoResponse for RuntimeError {
    fn into_response(self) -> Response {
        tracing::warn!(kind = self.kind(), message = self.message(), "rpc error");
        let body = serde_json::json!({
            "error": self.message(),
            "kind": self.kind(),
        });
        (self.status(), Json(body)).into_response()
    }
}

impl From<pluginhost_crypto::CsprngError> for RuntimeError {
    fn from(err: pluginhost_crypto::CsprngError) -> Self {
        RuntimeError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn status_mapping_matches_taxonomy() {
        let cases: Vec<(RuntimeError, StatusCode)> = vec![
            (RuntimeError::InvalidArgument("x".into()), StatusCode::BAD_REQUEST),
            (RuntimeError::Unauthenticated("x".into()), StatusCode::UNAUTHORIZED),
            (RuntimeError::PermissionDenied("x".into()), StatusCode::FORBIDDEN),
            (RuntimeError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (RuntimeError::FailedPrecondition("x".into()), StatusCode::PRECONDITION_FAILED),
            (RuntimeError::ResourceExhausted("x".into()), StatusCode::TOO_MANY_REQUESTS),
            (RuntimeError::Unavailable("x".into()), StatusCode::SERVICE_UNAVAILABLE),
            (RuntimeError::DeadlineExceeded("x".into()), StatusCode::GATEWAY_TIMEOUT),
            (RuntimeError::Internal("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            assert_eq!(err.status(), expected);
        }
    }

    #[tokio::test]
    async fn into_response_carries_kind_and_message() {
        use http_body_util::BodyExt;
        let resp = RuntimeError::NotFound("no such provider".into()).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "no such provider");
        assert_eq!(json["kind"], "not_found");
    }
}
