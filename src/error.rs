#![forbid(unsafe_code)]

//! Error types shared by the delivery pipeline and the HTTP layer.

use std::{path::PathBuf, process::ExitStatus};

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Failures of a single downloader invocation. Every variant is terminal for
/// the job that produced it.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("failed to launch {bin}: {source}")]
    Spawn {
        bin: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("downloader exited with {status}: {stderr}")]
    Subprocess { status: ExitStatus, stderr: String },

    #[error("downloader finished but produced no file for {0}")]
    MissingOutput(PathBuf),

    #[error("unexpected downloader output: {0}")]
    Metadata(String),

    #[error("failed to move {from} to {to}: {source}")]
    Rename {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failures while publishing a finished download into the cache directory.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("refusing to cache empty file {0}")]
    Empty(PathBuf),

    #[error("failed to move {from} into the cache: {source}")]
    Rename {
        from: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// JSON error returned by every HTTP handler.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    /// Upstream host or the downloader failed to hand us a stream.
    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_GATEWAY,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
        });
        let mut response = (self.status, Json(body)).into_response();
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        response
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
