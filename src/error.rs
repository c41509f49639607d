//! Error handling types for annocache
//!
//! This module provides the error types used throughout the cache and the
//! engine client. Only `RequestError` is ever returned from a bounded
//! request; everything else is either a connection-level failure or a
//! settings problem.

use std::sync::PoisonError;
use std::time::Duration;
use thiserror::Error;

/// Failure of a bounded request, as seen by the waiting caller.
///
/// Callers must be able to tell a slow engine from a dead one, so the two
/// cases are kept apart.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RequestError {
    /// The deadline passed. The request stays in flight and its answer is
    /// still applied when it arrives.
    #[error("{method} timed out after {after:?}")]
    Timeout { method: &'static str, after: Duration },

    /// The connection went away (stopped, crashed, or never started).
    #[error("request cancelled: {reason}")]
    Cancelled { reason: String },
}

impl RequestError {
    pub fn cancelled(reason: impl Into<String>) -> Self {
        RequestError::Cancelled {
            reason: reason.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, RequestError::Timeout { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RequestError::Cancelled { .. })
    }
}

/// Connection-level error for the analysis engine client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// No engine connection is in the Ready state
    #[error("analysis engine is not connected")]
    NotConnected,

    /// `start()` was called while a connection is starting or ready
    #[error("analysis engine is already running")]
    AlreadyRunning,

    /// The launcher could not produce a connection
    #[error("failed to launch analysis engine: {0}")]
    Launch(#[from] std::io::Error),

    /// The engine never confirmed the connection
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The outbound queue is closed (transport gone)
    #[error("failed to send message to analysis engine")]
    SendFailed,

    /// An outbound message could not be encoded
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    /// The engine answered with an error response
    #[error("analysis engine rejected {method}: {message}")]
    Rejected {
        method: &'static str,
        message: String,
    },

    /// A request-level failure surfaced through a connection call
    #[error(transparent)]
    Request(#[from] RequestError),
}

/// Settings loading error
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read settings: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse settings: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid settings: {0}")]
    Invalid(String),
}

/// Helper trait to recover guards from poisoned locks.
pub trait LockResultExt<T> {
    /// Convert a poisoned lock result into its inner guard, logging once.
    ///
    /// The context parameter identifies which operation triggered lock
    /// recovery, for debugging panics on other threads.
    fn recover_poison(self, context: &str) -> T;
}

impl<T> LockResultExt<T> for Result<T, PoisonError<T>> {
    fn recover_poison(self, context: &str) -> T {
        match self {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!(
                    target: "annocache::lock_recovery",
                    "Recovered from poisoned lock in {}",
                    context
                );
                poisoned.into_inner()
            }
        }
    }
}
