// eventshop-rpc-core/src/bus.rs
use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    ConnectionOptions, ErrorHandler, MessageCallback, MessagingError, Payload, PublishOptions,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Broker connector: one connection, a publish channel, a consume channel
/// and a single queue bound to the exchange under any number of patterns.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    async fn connect(&self, options: ConnectionOptions) -> Result<(), MessagingError>;

    /// Closes channels and connection. Does nothing if never connected.
    async fn disconnect(&self) -> Result<(), MessagingError>;

    fn status(&self) -> ConnectionStatus;

    async fn publish(
        &self,
        topic: &str,
        payload: Payload,
        options: PublishOptions,
    ) -> Result<(), MessagingError>;

    async fn subscribe(&self, pattern: &str) -> Result<(), MessagingError>;

    /// Unbinding a pattern that is not subscribed is a no-op.
    async fn unsubscribe(&self, pattern: &str) -> Result<(), MessagingError>;

    async fn unsubscribe_all(&self) -> Result<(), MessagingError>;

    fn subscribed_patterns(&self) -> Vec<String>;

    async fn listen(
        &self,
        callback: Arc<dyn MessageCallback>,
        no_ack: bool,
    ) -> Result<(), MessagingError>;

    async fn stop_listen(&self) -> Result<(), MessagingError>;

    fn is_listening(&self) -> bool;

    /// Fails with a minor error while a consumer is active.
    async fn delete_queue(&self) -> Result<(), MessagingError>;

    /// Returns the number of purged messages.
    async fn empty_queue(&self) -> Result<u32, MessagingError>;

    fn queue(&self) -> String;

    /// Rejected once the queue has been bound.
    fn set_queue(&self, name: &str) -> Result<(), MessagingError>;

    fn message_expired_in(&self) -> Option<u32>;

    /// Rejected once the queue has been bound.
    fn set_message_expired_in(&self, ttl_ms: Option<u32>) -> Result<(), MessagingError>;

    fn on_error(&self, handler: ErrorHandler);
}
