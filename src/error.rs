use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Crate-wide error taxonomy for the control plane.
///
/// Every fallible control-plane operation reduces to one of these kinds. CLI
/// entry points still use `anyhow::Result` with `.context(..)` the way the
/// rest of this repo does; this type exists at the service boundary so HTTP
/// handlers and internal retry logic can match on a closed set of cases.
#[derive(Debug, thiserror::Error)]
pub enum ControlPlaneError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("at capacity: {0}")]
    CapacityExceeded(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("policy denied: {0}")]
    PolicyDenied(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl ControlPlaneError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ControlPlaneError::Validation(_) => StatusCode::BAD_REQUEST,
            ControlPlaneError::CapacityExceeded(_) => StatusCode::SERVICE_UNAVAILABLE,
            ControlPlaneError::NotFound(_) => StatusCode::NOT_FOUND,
            ControlPlaneError::Conflict(_) => StatusCode::CONFLICT,
            ControlPlaneError::Transient(_) => StatusCode::BAD_GATEWAY,
            ControlPlaneError::PolicyDenied(_) => StatusCode::FORBIDDEN,
            ControlPlaneError::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ControlPlaneError::Validation(_) => "validation",
            ControlPlaneError::CapacityExceeded(_) => "capacity_exceeded",
            ControlPlaneError::NotFound(_) => "not_found",
            ControlPlaneError::Conflict(_) => "conflict",
            ControlPlaneError::Transient(_) => "transient",
            ControlPlaneError::PolicyDenied(_) => "policy_denied",
            ControlPlaneError::Fatal(_) => "fatal",
        }
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: String,
}

impl IntoResponse for ControlPlaneError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorBody {
            error: self.kind(),
            message: self.to_string(),
        };
        (status, axum::Json(body)).into_response()
    }
}

/// Translates a `kube::Error` into the taxonomy above, distinguishing the
/// two API-error codes the rest of the crate actually branches on.
impl From<kube::Error> for ControlPlaneError {
    fn from(err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(resp) if resp.code == 404 => {
                ControlPlaneError::NotFound(resp.message.clone())
            }
            kube::Error::Api(resp) if resp.code == 409 => {
                ControlPlaneError::Conflict(resp.message.clone())
            }
            kube::Error::Api(resp) => ControlPlaneError::Transient(resp.message.clone()),
            other => ControlPlaneError::Transient(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for ControlPlaneError {
    fn from(err: reqwest::Error) -> Self {
        ControlPlaneError::Transient(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_taxonomy() {
        assert_eq!(
            ControlPlaneError::NotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ControlPlaneError::CapacityExceeded("x".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ControlPlaneError::PolicyDenied("x".into()).status_code(),
            StatusCode::FORBIDDEN
        );
    }

    #[test]
    fn kind_strings_are_snake_case() {
        assert_eq!(ControlPlaneError::CapacityExceeded("x".into()).kind(), "capacity_exceeded");
        assert_eq!(ControlPlaneError::PolicyDenied("x".into()).kind(), "policy_denied");
    }
}
