// eventshop-rpc-core/src/handler.rs
use crate::{IncomingMessage, MessagingError};
use async_trait::async_trait;

/// Receives every message a connector delivers while it is listening.
/// Errors returned here are reported through the connector's error hook.
#[async_trait]
pub trait MessageCallback: Send + Sync {
    async fn on_message(&self, message: IncomingMessage) -> Result<(), MessagingError>;
}
