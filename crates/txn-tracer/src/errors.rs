// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for the tracing engine.
//!
//! None of these ever reach instrumented application code: the call-in API in
//! [`crate::context`] converts them into `false`/`None` returns and a log line.

use crate::attributes::ValueTag;
use crate::transaction::TransactionState;
use reqwest::StatusCode;

/// Invalid transitions of a transaction or its segment tree.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TracerError {
    #[error("invalid state: expected {expected:?}, transaction is {actual:?}")]
    InvalidState {
        expected: TransactionState,
        actual: TransactionState,
    },

    #[error("segment tree is already finalized")]
    TreeFinalized,

    #[error("segment {0} does not exist in this transaction")]
    UnknownSegment(usize),

    #[error("segment {0} was already stopped")]
    AlreadyStopped(usize),

    #[error("the root segment is closed by finalize, not stop_segment")]
    RootSegment,

    #[error("no transaction is active on this execution context")]
    NoActiveTransaction,

    #[error("a transaction is already active on this execution context")]
    AlreadyActive,

    #[error("invalid custom event type '{0}'")]
    InvalidEventType(String),

    #[error("attribute rejected: {0}")]
    Attribute(#[from] AttributeError),
}

/// Reasons an attribute write is refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AttributeError {
    #[error("attribute keys must be strings, got {0}")]
    UnsupportedKey(ValueTag),

    #[error("attribute values must be scalar, got {0}")]
    UnsupportedValue(ValueTag),

    #[error("attribute values must be finite numbers")]
    NonFinite,

    #[error("attribute key is empty")]
    EmptyKey,

    #[error("attribute key exceeds {limit} bytes")]
    KeyTooLong { limit: usize },

    #[error("custom attributes are disabled by security policy")]
    Blocked,

    #[error("at most {limit} user attributes may be set")]
    LimitExceeded { limit: usize },
}

/// Configuration errors raised while reading or validating [`crate::config::TracerConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Could not parse {key}={value}: {reason}")]
    Parse {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Failures while shipping a payload to the collector.
#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    /// The payload could not be prepared. Retrying would fail the same way.
    #[error("Failed to prepare payload: {0}")]
    Payload(String),

    /// The collector could not be reached or answered with an error status.
    #[error("Error shipping data: {0:?} {1}")]
    Destination(Option<StatusCode>, String),
}

impl CollectorError {
    /// Transport errors and 5xx answers are retryable; 4xx and malformed
    /// payloads are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            CollectorError::Payload(_) => false,
            CollectorError::Destination(status, _) => {
                !status.map_or(false, |code| code.is_client_error())
            }
        }
    }
}

/// A trace payload that does not have the expected shape.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    #[error("malformed trace segment: {0}")]
    MalformedSegment(String),

    #[error("string table reference {0} is out of range")]
    UnknownReference(usize),
}

/// Failure of an external metadata provider.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("package metadata provider failed: {0}")]
    Failed(String),

    #[error("package metadata provider panicked")]
    Panicked,
}

/// The global log subscriber could not be installed.
#[derive(Debug, thiserror::Error)]
pub enum LoggerError {
    #[error("invalid log filter '{0}': {1}")]
    Filter(String, String),

    #[error("a global subscriber is already installed: {0}")]
    AlreadyInstalled(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = AttributeError::KeyTooLong { limit: 255 };
        assert_eq!(error.to_string(), "attribute key exceeds 255 bytes");

        let error = TracerError::from(AttributeError::NonFinite);
        assert_eq!(
            error.to_string(),
            "attribute rejected: attribute values must be finite numbers"
        );
    }

    #[test]
    fn test_collector_error_retryability() {
        assert!(!CollectorError::Payload("bad".into()).is_retryable());
        assert!(CollectorError::Destination(None, "timeout".into()).is_retryable());
        assert!(
            CollectorError::Destination(Some(StatusCode::SERVICE_UNAVAILABLE), "503".into())
                .is_retryable()
        );
        assert!(
            !CollectorError::Destination(Some(StatusCode::UNAUTHORIZED), "401".into())
                .is_retryable()
        );
    }
}
