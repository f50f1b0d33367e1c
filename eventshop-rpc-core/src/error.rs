// eventshop-rpc-core/src/error.rs
use std::fmt::Display;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Expected failure that is safe to hand to a remote caller verbatim
/// (validation failures, duplicate keys, timeouts...).
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct MinorError {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip)]
    pub retryable: bool,
}

impl MinorError {
    pub const NAME: &'static str = "MinorException";

    pub fn new(message: impl Into<String>) -> Self {
        Self::named(Self::NAME, message)
    }

    pub fn named(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            details: None,
            retryable: false,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }
}

#[derive(Debug, Clone, Error)]
pub enum MessagingError {
    /// Business failure, revealed to the remote caller as-is.
    #[error(transparent)]
    Minor(#[from] MinorError),

    /// Unexpected failure. Its message crosses the wire under a generic type.
    #[error("{0}")]
    Internal(String),

    /// Connection, channel or queue failure.
    #[error("{0}")]
    Critical(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl MessagingError {
    pub fn minor(message: impl Into<String>) -> Self {
        Self::Minor(MinorError::new(message))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Wraps a broker client failure, e.g. `critical("Queue binding error", err)`.
    pub fn critical(context: &str, err: impl Display) -> Self {
        Self::Critical(format!("{context}: {err}"))
    }

    pub fn not_connected() -> Self {
        Self::Critical("Connection has not been established!".to_string())
    }

    pub fn is_minor(&self) -> bool {
        matches!(self, Self::Minor(_))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Minor(e) if e.retryable)
    }
}

impl From<serde_json::Error> for MessagingError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minor_error_displays_its_message_only() {
        let err = MessagingError::from(MinorError::named("ValidationError", "NAME_REQUIRED"));
        assert_eq!(err.to_string(), "NAME_REQUIRED");
        assert!(err.is_minor());
        assert!(!err.is_retryable());
    }

    #[test]
    fn critical_error_carries_context() {
        let err = MessagingError::critical("Queue binding error", "NOT_FOUND");
        assert_eq!(err.to_string(), "Queue binding error: NOT_FOUND");
        assert!(!err.is_minor());
    }
}
