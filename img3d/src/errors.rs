use crate::conversion::ConversionError;
use axum::{
    Json,
    extract::multipart::MultipartError,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;
use utoipa::ToSchema;

#[derive(ThisError, Debug)]
pub enum Error {
    /// Invalid request data
    #[error("{message}")]
    BadRequest { message: String },

    /// Requested file not found
    #[error("{resource} {id} not found")]
    NotFound { resource: String, id: String },

    /// Upload exceeded the configured body limit
    #[error("{message}")]
    PayloadTooLarge { message: String },

    /// No conversion slot became available in time
    #[error("{message}")]
    TooManyRequests { message: String },

    /// Generic internal service error
    #[error("Failed to {operation}")]
    Internal { operation: String },

    /// Failure while running the external conversion pipeline
    #[error(transparent)]
    Conversion(#[from] ConversionError),

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// JSON body returned for every failed request.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Always `false`
    pub success: bool,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// Artifact filenames the converter should have produced but did not
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing: Option<Vec<String>>,
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Error::TooManyRequests { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Conversion(err) => match err {
                ConversionError::Validation { .. } => StatusCode::BAD_REQUEST,
                ConversionError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                ConversionError::Upload(_)
                | ConversionError::Spawn { .. }
                | ConversionError::Io(_)
                | ConversionError::Process { .. }
                | ConversionError::OutputParse { .. }
                | ConversionError::ArtifactMissing { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns a user-safe error message, without leaking internal implementation details
    pub fn user_message(&self) -> String {
        match self {
            Error::BadRequest { message } | Error::PayloadTooLarge { message } | Error::TooManyRequests { message } => message.clone(),
            Error::NotFound { resource, .. } => format!("{resource} not found"),
            Error::Internal { .. } | Error::Other(_) => "Internal server error".to_string(),
            Error::Conversion(err) => match err {
                ConversionError::Upload(_) => "Error saving uploaded file".to_string(),
                ConversionError::Spawn { .. } => "Failed to start conversion process".to_string(),
                ConversionError::Io(_) => "Failed to read conversion process output".to_string(),
                ConversionError::Timeout { after } => {
                    format!("Conversion timed out after {}", humantime::format_duration(*after))
                }
                ConversionError::Process { message, .. } => match message {
                    Some(message) => format!("Conversion failed: {message}"),
                    None => "Conversion failed".to_string(),
                },
                ConversionError::OutputParse { .. } => "Invalid output from conversion script".to_string(),
                ConversionError::Validation { message, .. } => message.clone(),
                ConversionError::ArtifactMissing { .. } => "Conversion finished without producing all model files".to_string(),
            },
        }
    }

    /// Diagnostic detail passed through to the client alongside the message
    pub fn details(&self) -> Option<String> {
        match self {
            Error::Conversion(err) => match err {
                ConversionError::Spawn { program, source } => Some(format!("{program}: {source}")),
                ConversionError::Process { status, stderr, .. } => Some(format!("{status}\n{stderr}")),
                ConversionError::OutputParse { reason, stdout, stderr } => {
                    Some(format!("{reason}\n\nstdout:\n{stdout}\nstderr:\n{stderr}"))
                }
                ConversionError::Validation { details, .. } => details.clone(),
                ConversionError::ArtifactMissing { missing } => Some(format!("missing: {}", missing.join(", "))),
                ConversionError::Upload(_) | ConversionError::Io(_) | ConversionError::Timeout { .. } => None,
            },
            _ => None,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        // Log full error details for debugging - different log levels based on severity
        match &self {
            Error::Internal { .. } | Error::Other(_) => {
                tracing::error!("Internal service error: {:#}", self);
            }
            Error::Conversion(ConversionError::Validation { .. }) => {
                tracing::info!("Image rejected by converter: {}", self);
            }
            Error::Conversion(err) => {
                tracing::error!(kind = err.kind(), "Conversion error: {:#}", self);
            }
            Error::TooManyRequests { .. } | Error::PayloadTooLarge { .. } => {
                tracing::warn!("Request limit hit: {}", self);
            }
            Error::BadRequest { .. } | Error::NotFound { .. } => {
                tracing::debug!("Client error: {}", self);
            }
        }

        let missing = match &self {
            Error::Conversion(ConversionError::ArtifactMissing { missing }) => Some(missing.clone()),
            _ => None,
        };

        let body = ErrorResponse {
            success: false,
            error: self.user_message(),
            details: self.details(),
            missing,
        };

        (self.status_code(), Json(body)).into_response()
    }
}

impl From<MultipartError> for Error {
    fn from(err: MultipartError) -> Self {
        if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
            Error::PayloadTooLarge { message: err.body_text() }
        } else {
            Error::BadRequest {
                message: format!("Failed to parse multipart data: {}", err.body_text()),
            }
        }
    }
}

/// Type alias for service operation results
pub type Result<T> = std::result::Result<T, Error>;
