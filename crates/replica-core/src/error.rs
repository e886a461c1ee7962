use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::types::{EventKind, SyncPhase};

/// Label used for non-2xx statuses missing from the status table.
pub const GENERIC_ERROR_LABEL: &str = "Generic Error";

/// Broad error category used for reporting and retry decisions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Connection refused, timeout, abort, or a broken stream.
    Transport,
    /// Unexpected stream status, missing body, or undecodable event.
    Protocol,
    /// Non-2xx response to a request.
    Api,
    /// 401/403 responses.
    Auth,
    /// Invalid input such as a malformed URL or an unnamed object.
    Config,
    /// Invariant break inside the synchronizer.
    Internal,
}

/// Stable failure payload reported to observers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct SyncFailure {
    /// High-level error category.
    pub category: ErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// HTTP status when the failure came from a response.
    pub status: Option<u16>,
}

impl SyncFailure {
    pub fn new(
        category: ErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            status: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Build a standard invalid-phase-transition failure.
    pub fn invalid_state(current: SyncPhase, action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            ErrorCategory::Internal,
            "invalid_state_transition",
            format!("cannot run '{action}' while synchronizer is in phase {current:?}"),
        )
    }
}

/// Map HTTP status codes to error categories.
pub fn classify_http_status(status: u16) -> ErrorCategory {
    match status {
        401 | 403 => ErrorCategory::Auth,
        400..=599 => ErrorCategory::Api,
        _ => ErrorCategory::Internal,
    }
}

/// Human-readable label for a response status.
///
/// Returns `None` for 2xx, the table entry for known error statuses, and
/// [`GENERIC_ERROR_LABEL`] for any other status.
pub fn error_label(status: u16) -> Option<&'static str> {
    match status {
        400 => Some("Bad Request"),
        401 => Some("Unauthorized"),
        403 => Some("Forbidden"),
        404 => Some("Not Found"),
        500 => Some("Internal Server Error"),
        502 => Some("Bad Gateway"),
        503 => Some("Service Unavailable"),
        200..=299 => None,
        _ => Some(GENERIC_ERROR_LABEL),
    }
}

/// Non-2xx response to a resource request.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{label}: {method} {url} returned {status} {status_text}")]
pub struct ApiError {
    pub method: String,
    pub url: String,
    pub status: u16,
    pub status_text: String,
    /// Parsed JSON body, a JSON string for non-JSON bodies, or null.
    pub body: Value,
    pub label: &'static str,
}

impl ApiError {
    /// Check a response status, producing an error for anything but 2xx.
    pub fn check(
        method: impl Into<String>,
        url: impl Into<String>,
        status: u16,
        status_text: impl Into<String>,
        body: Value,
    ) -> Result<(), Self> {
        let Some(label) = error_label(status) else {
            return Ok(());
        };

        Err(Self {
            method: method.into(),
            url: url.into(),
            status,
            status_text: status_text.into(),
            body,
            label,
        })
    }

    pub fn category(&self) -> ErrorCategory {
        classify_http_status(self.status)
    }

    /// `message` field of a server status body, if any.
    pub fn body_message(&self) -> Option<&str> {
        self.body.get("message").and_then(Value::as_str)
    }

    /// Label followed by the server message when the body carries one.
    pub fn display_message(&self) -> String {
        match self.body_message() {
            Some(message) => format!("{}: {message}", self.label),
            None => self.label.to_owned(),
        }
    }
}

impl From<&ApiError> for SyncFailure {
    fn from(err: &ApiError) -> Self {
        SyncFailure::new(err.category(), "api_error", err.display_message()).with_status(err.status)
    }
}

/// Errors produced while decoding watch stream lines.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// A line was not a JSON watch event.
    #[error("invalid watch event line '{line}': {source}")]
    Line {
        line: String,
        #[source]
        source: serde_json::Error,
    },
    /// The event envelope was valid but its object did not match the resource type.
    #[error("invalid {kind:?} event object: {source}")]
    Object {
        kind: EventKind,
        #[source]
        source: serde_json::Error,
    },
}

impl From<&DecodeError> for SyncFailure {
    fn from(err: &DecodeError) -> Self {
        SyncFailure::new(ErrorCategory::Protocol, "watch_decode_error", err.to_string())
    }
}
