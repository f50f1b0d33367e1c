//! RabbitMQ transport for the mediate RPC stack.

mod connector;
mod delivery;

pub use connector::RabbitConnector;
