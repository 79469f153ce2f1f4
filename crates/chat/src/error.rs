use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::messages::openai::{ErrorDetails, ErrorResponse};

/// Validation failures raised before anything is dispatched to the runtime.
#[derive(Debug, Error)]
pub enum RequestError {
    /// Body is not JSON or misses a required field.
    #[error("Invalid request: {0}")]
    Malformed(String),

    #[error("Invalid request: 'messages' must contain at least one message")]
    NoMessages,

    /// No session identifier in the body nor in the request headers.
    #[error("session_id is required")]
    MissingSession,

    /// The turn forwarded to the runtime ended up without user input.
    #[error("No user message found")]
    NoUserMessage,
}

impl RequestError {
    /// Stable code reported in the `error.code` field.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "400000",
            Self::MissingSession => "400001",
            Self::NoUserMessage => "400002",
            Self::NoMessages => "400003",
        }
    }
}

/// Coarse failure categories the HTTP surface distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The request itself is invalid.
    Invalid,
    /// The request was well-formed but the runtime refused it.
    BadRequest,
    NotFound,
    Timeout,
    /// Anything unrecognized, including internal runtime failures.
    System,
}

impl ErrorCategory {
    pub fn status_code(self) -> StatusCode {
        match self {
            Self::Invalid | Self::BadRequest => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Timeout => StatusCode::REQUEST_TIMEOUT,
            Self::System => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_type(self) -> &'static str {
        match self {
            Self::Invalid | Self::BadRequest => "invalid_request_error",
            Self::NotFound => "not_found_error",
            Self::Timeout => "timeout_error",
            Self::System => "internal_error",
        }
    }
}

/// A failure after classification, ready to be rendered once.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ClassifiedError {
    pub category: ErrorCategory,
    pub code: String,
    pub message: String,
}

impl ClassifiedError {
    pub fn status_code(&self) -> StatusCode {
        self.category.status_code()
    }

    pub fn error_type(&self) -> &'static str {
        self.category.error_type()
    }

    pub(crate) fn into_details(self) -> ErrorDetails {
        ErrorDetails {
            r#type: self.error_type().to_string(),
            message: self.message,
            code: self.code,
        }
    }
}

impl IntoResponse for ClassifiedError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let body = ErrorResponse {
            error: self.into_details(),
        };

        (status, Json(body)).into_response()
    }
}
