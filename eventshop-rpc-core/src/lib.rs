pub mod bus;
pub mod error;
pub mod events;
pub mod handler;
pub mod memory;
pub mod options;
pub mod queue;
pub mod rpc;
pub mod types;

pub use bus::{ConnectionStatus, MessageBroker};
pub use error::{MessagingError, MinorError};
pub use events::{ErrorHandler, ErrorListeners};
pub use handler::MessageCallback;
pub use memory::{InMemoryConnector, InMemoryExchange};
pub use options::{ConnectionOptions, DEFAULT_RECONNECT_DELAY_MS};
pub use queue::{topic_matches, QueueSpec, SubscribedPatterns};
pub use types::{
    Acknowledger, IncomingMessage, MessageProperties, NoAck, Payload, PublishOptions,
    CONTENT_ENCODING_UTF8, CONTENT_TYPE_JSON, CONTENT_TYPE_TEXT,
};
