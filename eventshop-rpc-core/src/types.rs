// eventshop-rpc-core/src/types.rs
use std::{fmt, sync::Arc};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::MessagingError;

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_TEXT: &str = "text/plain";
pub const CONTENT_ENCODING_UTF8: &str = "utf-8";

/// Message body. Text goes on the wire as UTF-8 `text/plain`,
/// everything else as `application/json`.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Text(String),
    Json(Value),
}

impl Payload {
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, MessagingError> {
        Ok(Self::Json(serde_json::to_value(value)?))
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Text(_) => CONTENT_TYPE_TEXT,
            Self::Json(_) => CONTENT_TYPE_JSON,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(text) => text.is_empty(),
            Self::Json(value) => value.is_null(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, MessagingError> {
        match self {
            Self::Text(text) => Ok(text.as_bytes().to_vec()),
            Self::Json(value) => Ok(serde_json::to_vec(value)?),
        }
    }

    /// Parses a received body according to its content type. Anything not
    /// tagged as JSON is read as text.
    pub fn from_bytes(content_type: Option<&str>, data: &[u8]) -> Result<Self, MessagingError> {
        match content_type {
            Some(ct) if ct.starts_with(CONTENT_TYPE_JSON) => {
                Ok(Self::Json(serde_json::from_slice(data)?))
            }
            _ => Ok(Self::Text(String::from_utf8_lossy(data).into_owned())),
        }
    }

    /// JSON view of the payload; text that is not itself JSON becomes a string value.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Json(value) => value.clone(),
            Self::Text(text) => {
                serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.clone()))
            }
        }
    }

    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, MessagingError> {
        Ok(serde_json::from_value(self.to_json())?)
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOptions {
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
}

impl PublishOptions {
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_reply_to(mut self, topic: impl Into<String>) -> Self {
        self.reply_to = Some(topic.into());
        self
    }
}

/// Settles a delivered message with the broker. Only meaningful when the
/// consumer was started with `no_ack = false`.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), MessagingError>;
    async fn nack(&self, requeue: bool) -> Result<(), MessagingError>;
}

/// Acknowledger for auto-ack consumers.
pub struct NoAck;

#[async_trait]
impl Acknowledger for NoAck {
    async fn ack(&self) -> Result<(), MessagingError> {
        Ok(())
    }

    async fn nack(&self, _requeue: bool) -> Result<(), MessagingError> {
        Ok(())
    }
}

/// A message delivered by a connector to its listener.
#[derive(Clone)]
pub struct IncomingMessage {
    pub routing_key: String,
    pub raw: Vec<u8>,
    pub payload: Payload,
    pub properties: MessageProperties,
    acker: Arc<dyn Acknowledger>,
}

impl IncomingMessage {
    pub fn new(
        routing_key: impl Into<String>,
        raw: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<Self, MessagingError> {
        let payload = Payload::from_bytes(properties.content_type.as_deref(), &raw)?;
        Ok(Self {
            routing_key: routing_key.into(),
            raw,
            payload,
            properties,
            acker: Arc::new(NoAck),
        })
    }

    pub fn with_acker(mut self, acker: Arc<dyn Acknowledger>) -> Self {
        self.acker = acker;
        self
    }

    pub async fn ack(&self) -> Result<(), MessagingError> {
        self.acker.ack().await
    }

    pub async fn nack(&self, requeue: bool) -> Result<(), MessagingError> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for IncomingMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingMessage")
            .field("routing_key", &self.routing_key)
            .field("payload", &self.payload)
            .field("properties", &self.properties)
            .finish()
    }
}
