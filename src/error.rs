use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// Failure kinds produced by the media processor.
///
/// `Input`, `Extraction` and `Download` messages are meant for the client.
/// `Internal` carries operator detail and is never shown verbatim.
#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("{0}")]
    Input(String),
    #[error("{0}")]
    Extraction(String),
    #[error("{0}")]
    Download(String),
    #[error("{0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

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

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }

    /// Maps a processor failure onto a response. Internal failures are
    /// logged here and replaced by `generic`.
    pub fn from_processor(error: ProcessorError, generic: &str) -> Self {
        match error {
            ProcessorError::Input(message)
            | ProcessorError::Extraction(message)
            | ProcessorError::Download(message) => Self::bad_request(message),
            ProcessorError::Internal(detail) => {
                tracing::error!(%detail, "internal error while handling request");
                Self::internal(generic)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                error: self.message,
            }),
        )
            .into_response()
    }
}
