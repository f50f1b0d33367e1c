// eventshop-rpc-core/src/rpc/envelope.rs
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ErrorHandler, ErrorListeners, MessagingError, MinorError};

pub const MIN_TIMEOUT_MS: u64 = 1_000;
pub const MAX_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Wire type of every error that is not a [`MinorError`].
pub const INTERNAL_ERROR_TYPE: &str = "InternalErrorException";
pub const CRITICAL_ERROR_TYPE: &str = "CriticalException";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcResponse {
    pub is_success: bool,
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub payload: Value,
}

/// Failure payload of an unsuccessful [`RpcResponse`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

pub type ErrorFactory = Arc<dyn Fn(&ErrorPayload) -> MessagingError + Send + Sync>;

/// Maps wire error types back to local errors on the calling side.
#[derive(Clone)]
pub struct ErrorRegistry {
    factories: HashMap<String, ErrorFactory>,
}

impl Default for ErrorRegistry {
    fn default() -> Self {
        Self::empty()
            .with(MinorError::NAME, |e| {
                rebuild_minor(MinorError::NAME, e).into()
            })
            .with(INTERNAL_ERROR_TYPE, |e| {
                MessagingError::Internal(e.message.clone())
            })
            .with(CRITICAL_ERROR_TYPE, |e| {
                MessagingError::Critical(e.message.clone())
            })
    }
}

impl ErrorRegistry {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn with<F>(mut self, kind: &str, factory: F) -> Self
    where
        F: Fn(&ErrorPayload) -> MessagingError + Send + Sync + 'static,
    {
        self.register(kind, factory);
        self
    }

    pub fn register<F>(&mut self, kind: &str, factory: F)
    where
        F: Fn(&ErrorPayload) -> MessagingError + Send + Sync + 'static,
    {
        self.factories.insert(kind.to_string(), Arc::new(factory));
    }

    /// Registers `kind` as a minor error that keeps its name and details.
    pub fn with_minor(self, kind: &str) -> Self {
        let name = kind.to_string();
        self.with(kind, move |e| rebuild_minor(&name, e).into())
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// Unknown types come back as a plain minor error carrying the message.
    pub fn rebuild(&self, payload: &ErrorPayload) -> MessagingError {
        match self.factories.get(&payload.kind) {
            Some(factory) => factory(payload),
            None => MinorError::new(payload.message.clone()).into(),
        }
    }
}

fn rebuild_minor(name: &str, payload: &ErrorPayload) -> MinorError {
    MinorError {
        name: name.to_string(),
        message: payload.message.clone(),
        details: payload.detail.clone(),
        retryable: false,
    }
}

/// Naming, timeout and error (de)normalisation shared by caller and handler.
pub struct RpcBase {
    name: String,
    timeout_ms: AtomicU64,
    errors: ErrorRegistry,
    listeners: ErrorListeners,
}

impl RpcBase {
    pub fn new(name: impl Into<String>, errors: ErrorRegistry) -> Self {
        Self {
            name: name.into(),
            timeout_ms: AtomicU64::new(DEFAULT_TIMEOUT_MS),
            errors,
            listeners: ErrorListeners::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn set_errors(&mut self, errors: ErrorRegistry) {
        self.errors = errors;
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.load(Ordering::Relaxed))
    }

    /// Out-of-range values are ignored; returns whether the value was taken.
    pub fn set_timeout(&self, ms: u64) -> bool {
        if !(MIN_TIMEOUT_MS..=MAX_TIMEOUT_MS).contains(&ms) {
            return false;
        }
        self.timeout_ms.store(ms, Ordering::Relaxed);
        true
    }

    pub fn listeners(&self) -> &ErrorListeners {
        &self.listeners
    }

    pub fn on_error(&self, handler: ErrorHandler) {
        self.listeners.add(handler);
    }

    pub fn emit_error(&self, err: &MessagingError) {
        self.listeners.emit(err);
    }

    pub fn create_request(&self, to: &str, payload: Value) -> RpcRequest {
        RpcRequest {
            from: self.name.clone(),
            to: to.to_string(),
            payload,
        }
    }

    pub fn create_response(&self, is_success: bool, payload: Value, reply_to: &str) -> RpcResponse {
        RpcResponse {
            is_success,
            from: self.name.clone(),
            to: reply_to.to_string(),
            payload,
        }
    }

    /// Minor errors keep their identity; anything else is masked as an
    /// internal error and reported locally.
    pub fn create_error(&self, err: &MessagingError) -> ErrorPayload {
        match err {
            MessagingError::Minor(minor) => ErrorPayload {
                kind: minor.name.clone(),
                message: minor.message.clone(),
                detail: minor.details.clone(),
            },
            other => {
                self.emit_error(other);
                ErrorPayload {
                    kind: INTERNAL_ERROR_TYPE.to_string(),
                    message: other.to_string(),
                    detail: None,
                }
            }
        }
    }

    pub fn rebuild_error(&self, payload: &Value) -> MessagingError {
        match serde_json::from_value::<ErrorPayload>(payload.clone()) {
            Ok(error) => self.errors.rebuild(&error),
            Err(_) => MessagingError::internal(format!("Malformed error payload: {payload}")),
        }
    }
}
