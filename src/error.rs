use crate::{decoder::DecodeError, executor::ExecutorError};
use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Every way a detection request can fail, as reported to the client.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    InvalidInput(String),
    #[error("Payload exceeds the limit of {limit} bytes")]
    PayloadTooLarge { limit: usize },
    #[error(transparent)]
    Decode(DecodeError),
    #[error("Server is at capacity, retry later")]
    Overloaded,
    #[error("Request did not complete within {} ms", .0.as_millis())]
    Timeout(Duration),
    #[error("{0}")]
    Internal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    DecodeError,
    Overloaded,
    Timeout,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::DecodeError => "decode_error",
            ErrorKind::Overloaded => "overloaded",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Internal => "internal",
        }
    }
}

impl ApiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::InvalidInput(_) | ApiError::PayloadTooLarge { .. } => ErrorKind::InvalidInput,
            ApiError::Decode(_) => ErrorKind::DecodeError,
            ApiError::Overloaded => ErrorKind::Overloaded,
            ApiError::Timeout(_) => ErrorKind::Timeout,
            ApiError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ApiError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Decode(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Overloaded => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to show a client. Internal details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            ApiError::Internal(_) => "Internal server error".to_string(),
            ApiError::Decode(DecodeError::Subprocess { .. }) => {
                "ffmpeg could not decode the payload as a video".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl From<DecodeError> for ApiError {
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::Spool(_) | DecodeError::Spawn(_) | DecodeError::Task(_) => {
                ApiError::Internal(err.to_string())
            }
            other => ApiError::Decode(other),
        }
    }
}

impl From<ExecutorError> for ApiError {
    fn from(err: ExecutorError) -> Self {
        match err {
            ExecutorError::Overloaded => ApiError::Overloaded,
            other => ApiError::Internal(other.to_string()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorKind,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
    pub request_id: String,
}

/// An `ApiError` tagged with the request it ended.
#[derive(Debug)]
pub struct RequestFailure {
    pub request_id: String,
    pub error: ApiError,
}

impl IntoResponse for RequestFailure {
    fn into_response(self) -> Response {
        let status = self.error.status();
        if let ApiError::Internal(detail) = &self.error {
            tracing::error!(request_id = %self.request_id, "Internal error: {}", detail);
        }

        let body = ErrorResponse {
            error: ErrorBody {
                code: self.error.kind(),
                message: self.error.public_message(),
            },
            request_id: self.request_id,
        };

        let mut response = (status, Json(body)).into_response();
        if matches!(self.error, ApiError::Overloaded) {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
        }
        response
    }
}
