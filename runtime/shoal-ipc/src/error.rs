use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

use crate::frame::FrameError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    MethodNotFound,
    MethodAlreadyRegistered,
    SecretMismatch,
    InvalidParams,
    /// Opaque failure reported by the database driver.
    Database,
    Internal,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::MethodNotFound => "method_not_found",
            ErrorCode::MethodAlreadyRegistered => "method_already_registered",
            ErrorCode::SecretMismatch => "secret_mismatch",
            ErrorCode::InvalidParams => "invalid_params",
            ErrorCode::Database => "database",
            ErrorCode::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error carried inside a response envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct RemoteError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

impl RemoteError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            detail: None,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(ErrorCode::MethodNotFound, format!("method '{method}' does not exist"))
    }

    pub fn secret_mismatch() -> Self {
        Self::new(ErrorCode::SecretMismatch, "secret key does not match")
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidParams, message)
    }

    pub fn database(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Database, message)
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

/// Failure of a single outbound call as seen by the caller.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("channel is not connected")]
    NotConnected,
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
    #[error("channel disconnected before the response arrived")]
    Disconnected,
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

impl CallError {
    pub fn remote_code(&self) -> Option<ErrorCode> {
        match self {
            CallError::Remote(err) => Some(err.code),
            _ => None,
        }
    }
}
