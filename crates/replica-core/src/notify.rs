use serde::{Deserialize, Serialize};

use crate::error::{ApiError, SyncFailure};

/// Severity of a user-facing notification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NotificationLevel {
    /// A one-shot request failed.
    Negative,
    /// Synchronization failed and is being retried.
    Warning,
}

/// Message a consumer shows for a failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notification {
    pub level: NotificationLevel,
    pub message: String,
    /// Transient notifications are superseded by the next sync attempt.
    pub transient: bool,
}

/// Convert a failed one-shot request (get/create/update/delete) into a single
/// negative notification.
pub fn notify_api_error(error: &ApiError) -> Notification {
    Notification {
        level: NotificationLevel::Negative,
        message: error.display_message(),
        transient: false,
    }
}

/// Convert a failed synchronization attempt into a transient warning.
pub fn notify_sync_failure(collection: &str, failure: &SyncFailure) -> Notification {
    Notification {
        level: NotificationLevel::Warning,
        message: format!("{collection}: {}", failure.message),
        transient: true,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::*;
    use crate::error::ErrorCategory;

    #[test]
    fn api_error_message_includes_server_message() {
        let err = ApiError::check(
            "DELETE",
            "http://x/apis/g/v1/devices/a",
            403,
            "Forbidden",
            json!({ "message": "devices \"a\" is forbidden" }),
        )
        .expect_err("403 must fail");

        let notification = notify_api_error(&err);
        assert_eq!(notification.level, NotificationLevel::Negative);
        assert_eq!(notification.message, "Forbidden: devices \"a\" is forbidden");
        assert!(!notification.transient);
    }

    #[test]
    fn api_error_without_body_message_uses_label() {
        let err = ApiError::check("GET", "http://x/a", 418, "I'm a teapot", Value::Null)
            .expect_err("418 must fail");
        assert_eq!(notify_api_error(&err).message, "Generic Error");
    }

    #[test]
    fn sync_failure_is_transient_warning() {
        let failure = SyncFailure::new(
            ErrorCategory::Transport,
            "list_transport_error",
            "connection refused",
        );
        let notification = notify_sync_failure("/apis/g/v1/devices", &failure);
        assert_eq!(notification.level, NotificationLevel::Warning);
        assert_eq!(notification.message, "/apis/g/v1/devices: connection refused");
        assert!(notification.transient);
    }
}
