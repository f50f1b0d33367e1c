// eventshop-rpc-core/src/options.rs
use std::{env, time::Duration};

use serde::{Deserialize, Serialize};

pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 3000;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionOptions {
    /// `host` or `host:port`.
    pub host_address: String,
    pub username: String,
    pub password: String,
    pub exchange: String,
    /// Empty means an auto-generated, exclusive queue.
    pub queue: String,
    /// Milliseconds; 0 falls back to the default.
    pub reconnect_delay: u64,
    /// Per-queue message TTL in milliseconds.
    pub message_expired_in: Option<u32>,
    /// Consumer prefetch; 0 leaves QoS untouched.
    pub prefetch: u16,
    /// Si true, activa publisher confirms y espera el ACK/NACK del broker.
    pub confirms: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            host_address: "localhost".to_string(),
            username: String::new(),
            password: String::new(),
            exchange: "eventshop.rpc".to_string(),
            queue: String::new(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY_MS,
            message_expired_in: None,
            prefetch: 0,
            confirms: false,
        }
    }
}

impl ConnectionOptions {
    /// Reads `RABBITMQ_*` variables, keeping defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut opts = Self::default();
        if let Ok(v) = env::var("RABBITMQ_HOST") {
            opts.host_address = v;
        }
        if let Ok(v) = env::var("RABBITMQ_USERNAME") {
            opts.username = v;
        }
        if let Ok(v) = env::var("RABBITMQ_PASSWORD") {
            opts.password = v;
        }
        if let Ok(v) = env::var("RABBITMQ_EXCHANGE") {
            opts.exchange = v;
        }
        if let Ok(v) = env::var("RABBITMQ_QUEUE") {
            opts.queue = v;
        }
        if let Some(v) = parse_env("RABBITMQ_RECONNECT_DELAY") {
            opts.reconnect_delay = v;
        }
        if let Some(v) = parse_env("RABBITMQ_MESSAGE_EXPIRED_IN") {
            opts.message_expired_in = Some(v);
        }
        if let Some(v) = parse_env("RABBITMQ_PREFETCH") {
            opts.prefetch = v;
        }
        if let Some(v) = parse_env("RABBITMQ_CONFIRMS") {
            opts.confirms = v;
        }
        opts
    }

    /// AMQP URI with the credentials folded in.
    pub fn uri(&self) -> String {
        if self.username.is_empty() {
            format!("amqp://{}", self.host_address)
        } else {
            format!(
                "amqp://{}:{}@{}",
                self.username, self.password, self.host_address
            )
        }
    }

    pub fn reconnect_delay(&self) -> Duration {
        match self.reconnect_delay {
            0 => Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS),
            ms => Duration::from_millis(ms),
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
