//! Error types and their mapping onto HTTP responses.

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::{error, warn};

/// Failures talking to the inference provider.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("inference request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("inference provider returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed inference chunk: {0}")]
    Malformed(String),

    #[error("inference stream broke: {0}")]
    Stream(String),
}

/// Failures of the executor itself, as opposed to the submitted program.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("stage scratch file: {0}")]
    Stage(std::io::Error),

    #[error("spawn {interpreter}: {source}")]
    Spawn {
        interpreter: String,
        source: std::io::Error,
    },

    #[error("wait for child: {0}")]
    Wait(std::io::Error),
}

/// Request-boundary error; every handler returns this.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(&'static str),

    /// Body was not JSON, had the wrong shape, or lacked a JSON content type.
    #[error("{0}")]
    InvalidBody(String),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("{0}")]
    Execution(String),

    #[error("{0}")]
    Persistence(#[from] std::io::Error),

    #[error("Snippet not found")]
    NotFound,
}

impl From<ExecError> for AppError {
    fn from(err: ExecError) -> Self {
        match err {
            ExecError::Stage(e) => AppError::Persistence(e),
            other => AppError::Execution(other.to_string()),
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::InvalidBody(rejection.body_text())
    }
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) | AppError::InvalidBody(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Upstream(_) | AppError::Execution(_) | AppError::Persistence(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

#[derive(Serialize)]
pub struct ErrorBody {
    pub error: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        match &self {
            AppError::Validation(msg) => warn!(%msg, "Rejected request"),
            AppError::InvalidBody(msg) => warn!(%msg, "Rejected request body"),
            AppError::Execution(msg) => warn!(%msg, "Run failed"),
            AppError::Upstream(e) => error!(error = %e, "Upstream failure"),
            AppError::Persistence(e) => error!(error = %e, "Filesystem failure"),
            AppError::NotFound => {}
        }
        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_taxonomy() {
        assert_eq!(
            AppError::InvalidBody("Expected request with `Content-Type: application/json`".into())
                .status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::Validation("No code provided").status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::Execution("boom".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        assert_eq!(
            AppError::Persistence(io).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        let upstream = UpstreamError::Status {
            status: 401,
            body: "bad token".into(),
        };
        assert_eq!(
            AppError::from(upstream).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn staging_failures_are_persistence_errors() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only");
        assert!(matches!(
            AppError::from(ExecError::Stage(io)),
            AppError::Persistence(_)
        ));
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let err = AppError::from(ExecError::Spawn {
            interpreter: "python".into(),
            source: io,
        });
        assert!(matches!(err, AppError::Execution(ref m) if m.starts_with("spawn python")));
    }
}
