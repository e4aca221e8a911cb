use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::decode::DecodeError;

#[derive(Error, Debug)]
pub enum RumError {
    #[error("request body is empty")]
    EmptyBody,
    #[error("failed to decompress request: {0}")]
    RequestDecodingError(String),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("request holds no point")]
    NoPoints,
    #[error("app_id [{0}] is not allowed")]
    AppIdNotAllowed(String),
    #[error("failed to feed points: {0}")]
    FeedFailed(String),
    #[error("decompressed body exceeds {0} bytes")]
    InflatedTooLarge(usize),

    #[error("request body exceeds {0} bytes")]
    BodyTooLarge(usize),
    #[error("invalid multipart request: {0}")]
    InvalidMultipart(String),
    #[error("failed to enqueue replay: {0}")]
    EnqueueFailed(String),
}

impl RumError {
    pub fn code(&self) -> &'static str {
        match self {
            RumError::EmptyBody => "rum.empty_body",
            RumError::RequestDecodingError(_) => "rum.invalid_compression",
            RumError::Decode(err) => match err {
                DecodeError::InvalidPrecision(_) => "rum.invalid_precision",
                DecodeError::InvalidLineProtocol { .. } | DecodeError::TimestampOverflow(_) => {
                    "rum.invalid_line_protocol"
                }
                DecodeError::InvalidJsonPoint(_) => "rum.invalid_json_point",
                DecodeError::InvalidProtobuf(_) => "rum.invalid_protobuf",
                DecodeError::UnknownMeasurement(_) => "rum.unknown_measurement",
            },
            RumError::NoPoints => "rum.no_points",
            RumError::AppIdNotAllowed(_) => "rum.app_id_not_allowed",
            RumError::FeedFailed(_) => "rum.feed_failed",
            RumError::InflatedTooLarge(_) => "rum.body_too_large",
            RumError::BodyTooLarge(_) => "replay.body_too_large",
            RumError::InvalidMultipart(_) => "replay.invalid_multipart",
            RumError::EnqueueFailed(_) => "replay.enqueue_failed",
        }
    }

    /// Label for `rum_requests_rejected_total`.
    pub fn cause(&self) -> &'static str {
        self.code()
            .split_once('.')
            .map(|(_, cause)| cause)
            .unwrap_or("unknown")
    }

    fn status(&self) -> StatusCode {
        match self {
            RumError::EmptyBody
            | RumError::RequestDecodingError(_)
            | RumError::Decode(_)
            | RumError::NoPoints
            | RumError::InflatedTooLarge(_)
            | RumError::BodyTooLarge(_)
            | RumError::InvalidMultipart(_) => StatusCode::BAD_REQUEST,

            RumError::AppIdNotAllowed(_) => StatusCode::FORBIDDEN,

            RumError::FeedFailed(_) | RumError::EnqueueFailed(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct ErrorBody {
    pub error_code: String,
    pub message: String,
}

impl IntoResponse for RumError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error_code: self.code().to_string(),
            message: self.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}

/// Envelope of every source map management answer.
#[derive(Debug, PartialEq, Deserialize, Serialize)]
pub struct SourcemapResponse<T> {
    pub content: Option<T>,
    #[serde(rename = "errorMsg")]
    pub error_msg: String,
    pub success: bool,
}

impl<T> SourcemapResponse<T> {
    pub fn ok(content: T) -> Self {
        Self {
            content: Some(content),
            error_msg: String::new(),
            success: true,
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            content: None,
            error_msg: msg.into(),
            success: false,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct SourcemapCheck {
    pub error_stack: String,
    pub original_error_stack: String,
}
