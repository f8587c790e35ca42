//! The typed, wire-mappable error surface for the lifecycle controller (§7).
//!
//! Internal plumbing (`registry`, `engine`) returns `anyhow::Result` /
//! [`crate::engine::EngineError`]; `controller` converts those into
//! [`AppError`] at the boundary, the same split the daemon draws between
//! its internal errors and the handler-facing error type.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("profile not allowed: {0}")]
    ProfileNotAllowed(String),

    #[error("image missing for profile: {0}")]
    ImageMissing(String),

    #[error("sandbox engine unavailable")]
    EngineUnavailable,

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session gone: {0}")]
    SessionGone(String),

    #[error("exec failed: {0}")]
    ExecFailed(String),

    #[error("start failed: {0}")]
    StartFailed(String),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            Self::ProfileNotAllowed(_) => StatusCode::FORBIDDEN,
            Self::ImageMissing(_) | Self::SessionNotFound(_) | Self::SessionGone(_) => {
                StatusCode::NOT_FOUND
            }
            Self::EngineUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::ExecFailed(_) | Self::StartFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::ProfileNotAllowed(_) => "ProfileNotAllowed",
            Self::ImageMissing(_) => "ImageMissing",
            Self::EngineUnavailable => "EngineUnavailable",
            Self::SessionNotFound(_) => "SessionNotFound",
            Self::SessionGone(_) => "SessionGone",
            Self::ExecFailed(_) => "ExecFailed",
            Self::StartFailed(_) => "StartFailed",
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            error: self.kind(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
