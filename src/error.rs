use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use thiserror::Error;

/// Failures of the artifact store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("image payload is not valid base64: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("image payload is empty")]
    Empty,

    #[error("storage failure: {0}")]
    Storage(#[from] std::io::Error),

    #[error("no stored image named {0}")]
    NotFound(String),
}

/// Failures of a single external generator call.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("generator process failed: {reason}")]
    ProcessFailed { reason: String },

    #[error("generator did not finish within {0:?}")]
    Timeout(Duration),

    #[error("generator output is not the expected JSON: {0}")]
    MalformedOutput(String),
}

/// Request-level failures produced by the pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{0}")]
    Validation(String),

    #[error("failed to store image: {0}")]
    StoreFailed(StoreError),

    #[error("failed to caption {image_name}: {source}")]
    CaptionFailed {
        image_name: String,
        #[source]
        source: GenerationError,
    },

    #[error("failed to generate poem: {0}")]
    ConvertFailed(GenerationError),

    #[error("{0} not found")]
    NotFound(&'static str),
}

impl PipelineError {
    pub fn status(&self) -> StatusCode {
        match self {
            PipelineError::Validation(_) => StatusCode::BAD_REQUEST,
            PipelineError::StoreFailed(StoreError::Decode(_) | StoreError::Empty) => {
                StatusCode::BAD_REQUEST
            }
            PipelineError::StoreFailed(StoreError::NotFound(_)) | PipelineError::NotFound(_) => {
                StatusCode::NOT_FOUND
            }
            PipelineError::StoreFailed(StoreError::Storage(_))
            | PipelineError::CaptionFailed { .. }
            | PipelineError::ConvertFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to hand to a client. Never carries paths or child stderr.
    pub fn public_message(&self) -> String {
        match self {
            PipelineError::Validation(msg) => msg.clone(),
            PipelineError::StoreFailed(StoreError::Decode(_)) => {
                "Image payload is not valid base64".to_string()
            }
            PipelineError::StoreFailed(StoreError::Empty) => "Image must not be empty".to_string(),
            PipelineError::StoreFailed(_) => "Failed to save image".to_string(),
            PipelineError::CaptionFailed { .. } => "Failed to generate caption".to_string(),
            PipelineError::ConvertFailed(_) => "Failed to generate poetry".to_string(),
            PipelineError::NotFound(what) => format!("{what} not found"),
        }
    }
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "request rejected");
        }
        let body = Json(serde_json::json!({ "error": self.public_message() }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_taxonomy() {
        assert_eq!(
            PipelineError::Validation("bad".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            PipelineError::NotFound("Caption").status(),
            StatusCode::NOT_FOUND
        );
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "/srv/uploads");
        let err = PipelineError::StoreFailed(StoreError::Storage(io));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!err.public_message().contains("/srv"));
    }

    #[test]
    fn caption_failure_hides_generator_details() {
        let err = PipelineError::CaptionFailed {
            image_name: "image_1_0.jpg".into(),
            source: GenerationError::ProcessFailed {
                reason: "Traceback in /opt/models/caption.py".into(),
            },
        };
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.public_message(), "Failed to generate caption");
    }
}
