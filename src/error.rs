//! Error types used by the relay runtime and by caller-supplied actions.
//!
//! This module defines three enums:
//!
//! - [`RelayError`]: failures surfaced to a caller awaiting a correlated result or stream.
//! - [`DispatchError`]: failures reported by a caller's own dispatch/invoker future.
//! - [`ConfigError`]: rejected configuration values.
//!
//! All of them provide `as_label` (stable snake_case string for logs/metrics).

use std::time::Duration;
use thiserror::Error;

/// # Errors delivered to callers of the task manager.
///
/// `RelayError` is `Clone`: one outcome is frequently delivered to more than one
/// party (the awaiting caller and the consumer of a relay stream).
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// An identifier was empty or whitespace.
    #[error("{field} is required")]
    InvalidArgument {
        /// Name of the offending argument.
        field: &'static str,
    },

    /// The request id is already registered.
    #[error("request '{request_id}' already pending")]
    AlreadyPending {
        /// Conflicting request id.
        request_id: String,
    },

    /// No external result (or stream) arrived before the deadline.
    #[error("'{request_id}' timed out after {:.1}s", .elapsed.as_secs_f64())]
    Timeout {
        /// Request that timed out.
        request_id: String,
        /// Time spent waiting.
        elapsed: Duration,
    },

    /// The request waited in the admission queue longer than allowed.
    #[error("request '{request_id}' timed out in queue after {:.1}s", .waited.as_secs_f64())]
    QueueTimeout {
        /// Request that expired.
        request_id: String,
        /// Time spent queued.
        waited: Duration,
    },

    /// The reaper reclaimed an entry that outlived every completion path.
    #[error("'{request_id}' was orphaned and timed out after {:.1}s", .age.as_secs_f64())]
    Orphaned {
        /// Reclaimed request id.
        request_id: String,
        /// Age of the entry when reclaimed.
        age: Duration,
    },

    /// The caller's dispatch or stream invoker failed.
    #[error("dispatch failed for '{request_id}': {error}")]
    Dispatch {
        /// Request whose dispatch failed.
        request_id: String,
        /// The underlying error message.
        error: String,
    },

    /// The request was cancelled before a result arrived.
    #[error("request '{request_id}' cancelled")]
    Canceled {
        /// Cancelled request id.
        request_id: String,
    },

    /// No active registration exists for the request id.
    #[error("no pending request '{request_id}'")]
    NotFound {
        /// Unknown request id.
        request_id: String,
    },

    /// A result of an unexpected type was delivered for the request.
    #[error("request '{request_id}' expected {expected}, got {actual}")]
    TypeMismatch {
        /// Request id.
        request_id: String,
        /// Type the caller awaits.
        expected: &'static str,
        /// Type that was delivered.
        actual: &'static str,
    },

    /// The external stream source failed while being relayed.
    #[error("stream '{request_id}' failed: {error}")]
    Stream {
        /// Request id of the stream.
        request_id: String,
        /// The underlying error message.
        error: String,
    },

    /// The task manager has been disposed.
    #[error("task manager disposed")]
    Disposed,
}

impl RelayError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    ///
    /// # Example
    /// ```
    /// use taskrelay::RelayError;
    ///
    /// let err = RelayError::NotFound { request_id: "r-1".into() };
    /// assert_eq!(err.as_label(), "relay_not_found");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            RelayError::InvalidArgument { .. } => "relay_invalid_argument",
            RelayError::AlreadyPending { .. } => "relay_already_pending",
            RelayError::Timeout { .. } => "relay_timeout",
            RelayError::QueueTimeout { .. } => "relay_queue_timeout",
            RelayError::Orphaned { .. } => "relay_orphaned",
            RelayError::Dispatch { .. } => "relay_dispatch_failed",
            RelayError::Canceled { .. } => "relay_canceled",
            RelayError::NotFound { .. } => "relay_not_found",
            RelayError::TypeMismatch { .. } => "relay_type_mismatch",
            RelayError::Stream { .. } => "relay_stream_failed",
            RelayError::Disposed => "relay_disposed",
        }
    }

    /// Indicates whether the error belongs to the timeout family
    /// (default timeout, queue wait, orphan reaping).
    ///
    /// # Example
    /// ```
    /// use std::time::Duration;
    /// use taskrelay::RelayError;
    ///
    /// let err = RelayError::QueueTimeout { request_id: "r-1".into(), waited: Duration::from_secs(3) };
    /// assert!(err.is_timeout());
    /// assert!(!RelayError::Disposed.is_timeout());
    /// ```
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            RelayError::Timeout { .. } | RelayError::QueueTimeout { .. } | RelayError::Orphaned { .. }
        )
    }
}

/// # Errors reported by a caller-supplied dispatch or stream invoker.
///
/// Mirrors the two ways a dispatch can end without success: it failed, or it
/// was cancelled. A panicking dispatch is reported as [`DispatchError::Fail`].
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// Dispatch failed.
    #[error("dispatch failed: {error}")]
    Fail {
        /// The underlying error message.
        error: String,
    },

    /// Dispatch was cancelled.
    #[error("dispatch cancelled")]
    Canceled,
}

impl DispatchError {
    /// Builds a [`DispatchError::Fail`] from anything printable.
    pub fn fail(error: impl std::fmt::Display) -> Self {
        DispatchError::Fail {
            error: error.to_string(),
        }
    }

    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            DispatchError::Fail { .. } => "dispatch_failed",
            DispatchError::Canceled => "dispatch_canceled",
        }
    }

    /// Converts into the caller-facing error for `request_id`.
    pub(crate) fn into_relay(self, request_id: &str) -> RelayError {
        match self {
            DispatchError::Fail { error } => RelayError::Dispatch {
                request_id: request_id.to_string(),
                error,
            },
            DispatchError::Canceled => RelayError::Canceled {
                request_id: request_id.to_string(),
            },
        }
    }
}

/// # Rejected configuration.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A limit or interval was zero.
    #[error("{field} must be greater than 0")]
    Zero {
        /// Offending field.
        field: &'static str,
    },

    /// An interval exceeded its upper bound.
    #[error("{field} cannot exceed {max:?}")]
    TooLarge {
        /// Offending field.
        field: &'static str,
        /// Allowed maximum.
        max: Duration,
    },

    /// The queue processor would tick less often than the health check.
    #[error("queue_poll_interval must not exceed health_check_interval")]
    PollSlowerThanHealthCheck,
}

impl ConfigError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            ConfigError::Zero { .. } => "config_zero",
            ConfigError::TooLarge { .. } => "config_too_large",
            ConfigError::PollSlowerThanHealthCheck => "config_poll_slower_than_health_check",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_names_request_and_mentions_timed_out() {
        let err = RelayError::Timeout {
            request_id: "req-9".into(),
            elapsed: Duration::from_secs(2),
        };
        let msg = err.to_string();
        assert!(msg.contains("timed out"));
        assert!(msg.contains("req-9"));
        assert!(msg.contains("2.0s"));
    }

    #[test]
    fn orphan_and_queue_timeouts_are_timeouts() {
        let orphan = RelayError::Orphaned {
            request_id: "a".into(),
            age: Duration::from_secs(10),
        };
        assert!(orphan.is_timeout());
        assert!(orphan.to_string().contains("timed out"));
        assert!(
            !RelayError::Canceled {
                request_id: "a".into()
            }
            .is_timeout()
        );
    }

    #[test]
    fn dispatch_error_maps_to_relay_error() {
        let err = DispatchError::fail("boom").into_relay("r");
        assert_eq!(
            err,
            RelayError::Dispatch {
                request_id: "r".into(),
                error: "boom".into()
            }
        );
        assert_eq!(
            DispatchError::Canceled.into_relay("r").as_label(),
            "relay_canceled"
        );
    }
}
