// eventshop-rpc-core/src/memory.rs
//! In-process broker with topic-exchange routing. Backs tests and local
//! development; follows the same usage rules as the RabbitMQ connector.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, RwLock,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    sync::{mpsc, Mutex as AsyncMutex},
    task::JoinHandle,
    time::Instant,
};
use tracing::debug;
use uuid::Uuid;

use crate::{
    topic_matches, ConnectionOptions, ConnectionStatus, ErrorHandler, ErrorListeners,
    IncomingMessage, MessageBroker, MessageCallback, MessageProperties, MessagingError,
    MinorError, Payload, PublishOptions, QueueSpec, SubscribedPatterns, CONTENT_ENCODING_UTF8,
};

struct Envelope {
    enqueued: Instant,
    ttl: Option<Duration>,
    message: IncomingMessage,
}

impl Envelope {
    fn is_expired(&self) -> bool {
        self.ttl
            .is_some_and(|ttl| self.enqueued.elapsed() > ttl)
    }
}

/// A named queue. Every connector bound to it competes for its messages,
/// which are handed out round-robin.
struct Binding {
    patterns: Vec<String>,
    ttl: Option<Duration>,
    consumers: Vec<mpsc::UnboundedSender<Envelope>>,
    next: AtomicUsize,
}

impl Binding {
    fn deliver(&self, mut envelope: Envelope) -> bool {
        let count = self.consumers.len();
        let start = self.next.fetch_add(1, Ordering::Relaxed);
        for offset in 0..count {
            match self.consumers[(start + offset) % count].send(envelope) {
                Ok(()) => return true,
                // connector liberado: probar el siguiente
                Err(mpsc::error::SendError(back)) => envelope = back,
            }
        }
        false
    }
}

/// A topic exchange shared by every [`InMemoryConnector`] created from it.
#[derive(Clone, Default)]
pub struct InMemoryExchange {
    queues: Arc<RwLock<HashMap<String, Binding>>>,
}

impl InMemoryExchange {
    fn bind(
        &self,
        queue: &str,
        pattern: &str,
        ttl: Option<Duration>,
        tx: &mpsc::UnboundedSender<Envelope>,
    ) {
        let mut queues = self.queues.write().unwrap_or_else(PoisonError::into_inner);
        let binding = queues.entry(queue.to_string()).or_insert_with(|| Binding {
            patterns: Vec::new(),
            ttl,
            consumers: Vec::new(),
            next: AtomicUsize::new(0),
        });
        binding.consumers.retain(|c| !c.is_closed());
        if !binding.consumers.iter().any(|c| c.same_channel(tx)) {
            binding.consumers.push(tx.clone());
        }
        if !binding.patterns.iter().any(|p| p == pattern) {
            binding.patterns.push(pattern.to_string());
        }
    }

    fn unbind(&self, queue: &str, pattern: &str) {
        let mut queues = self.queues.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(binding) = queues.get_mut(queue) {
            binding.patterns.retain(|p| p != pattern);
        }
    }

    /// Stops routing to `tx` while other consumers remain on the queue. The
    /// last one keeps buffering, like a durable queue with nobody attached.
    fn detach(&self, queue: &str, tx: &mpsc::UnboundedSender<Envelope>) {
        let mut queues = self.queues.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(binding) = queues.get_mut(queue) {
            if binding.consumers.len() > 1 {
                binding.consumers.retain(|c| !c.same_channel(tx));
            }
        }
    }

    fn remove(&self, queue: &str) {
        self.queues
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(queue);
    }

    /// Delivers once to every queue with at least one matching pattern.
    /// Returns the number of queues reached.
    fn route(
        &self,
        topic: &str,
        data: &[u8],
        properties: &MessageProperties,
    ) -> Result<usize, MessagingError> {
        let queues = self.queues.read().unwrap_or_else(PoisonError::into_inner);
        let mut delivered = 0;
        for binding in queues.values() {
            if !binding.patterns.iter().any(|p| topic_matches(p, topic)) {
                continue;
            }
            let message = IncomingMessage::new(topic, data.to_vec(), properties.clone())?;
            let envelope = Envelope {
                enqueued: Instant::now(),
                ttl: binding.ttl,
                message,
            };
            if binding.deliver(envelope) {
                delivered += 1;
            }
        }
        Ok(delivered)
    }
}

struct MemoryState {
    status: ConnectionStatus,
    queue: QueueSpec,
    patterns: SubscribedPatterns,
}

struct ActiveConsumer {
    tag: String,
    task: JoinHandle<()>,
}

pub struct InMemoryConnector {
    exchange: InMemoryExchange,
    state: Mutex<MemoryState>,
    tx: mpsc::UnboundedSender<Envelope>,
    inbox: Arc<AsyncMutex<mpsc::UnboundedReceiver<Envelope>>>,
    consumer: Mutex<Option<ActiveConsumer>>,
    listeners: ErrorListeners,
}

impl InMemoryConnector {
    pub fn new(exchange: InMemoryExchange) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            exchange,
            state: Mutex::new(MemoryState {
                status: ConnectionStatus::Disconnected,
                queue: QueueSpec::default(),
                patterns: SubscribedPatterns::default(),
            }),
            tx,
            inbox: Arc::new(AsyncMutex::new(rx)),
            consumer: Mutex::new(None),
            listeners: ErrorListeners::default(),
        }
    }

    /// Creates a connector on `exchange` and connects it right away.
    pub async fn connected(
        exchange: InMemoryExchange,
        options: ConnectionOptions,
    ) -> Result<Self, MessagingError> {
        let connector = Self::new(exchange);
        connector.connect(options).await?;
        Ok(connector)
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn active_consumer(&self) -> MutexGuard<'_, Option<ActiveConsumer>> {
        self.consumer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn assert_connection(&self) -> Result<(), MessagingError> {
        match self.state().status {
            ConnectionStatus::Disconnected => Err(MessagingError::not_connected()),
            _ => Ok(()),
        }
    }

    /// Drops everything waiting in this connector's inbox. A running
    /// consumer owns the inbox, so only call this once it has stopped.
    async fn drain_inbox(&self) -> u32 {
        let mut inbox = self.inbox.lock().await;
        let mut purged = 0;
        while let Ok(envelope) = inbox.try_recv() {
            if !envelope.is_expired() {
                purged += 1;
            }
        }
        purged
    }
}

#[async_trait]
impl MessageBroker for InMemoryConnector {
    async fn connect(&self, options: ConnectionOptions) -> Result<(), MessagingError> {
        let mut state = self.state();
        if state.status != ConnectionStatus::Disconnected {
            return Ok(());
        }
        if !state.queue.is_bound() {
            if !options.queue.is_empty() {
                state.queue.set_name(&options.queue)?;
            }
            if options.message_expired_in.is_some() {
                state.queue.set_message_ttl(options.message_expired_in)?;
            }
        }
        if state.queue.is_bound() {
            // volver a engancharse a la cola con sus bindings
            let ttl = state.queue.message_ttl().map(|ms| Duration::from_millis(ms.into()));
            for pattern in state.patterns.iter() {
                self.exchange.bind(state.queue.name(), pattern, ttl, &self.tx);
            }
        }
        state.status = ConnectionStatus::Connected;
        debug!("in-memory connector ready, queue={}", state.queue.name());
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), MessagingError> {
        if self.status() == ConnectionStatus::Disconnected {
            return Ok(());
        }
        self.stop_listen().await?;
        let mut state = self.state();
        if state.queue.is_ephemeral() {
            self.exchange.remove(state.queue.name());
            state.patterns.clear();
        } else {
            self.exchange.detach(state.queue.name(), &self.tx);
        }
        state.status = ConnectionStatus::Disconnected;
        Ok(())
    }

    fn status(&self) -> ConnectionStatus {
        self.state().status
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Payload,
        options: PublishOptions,
    ) -> Result<(), MessagingError> {
        self.assert_connection()?;
        if topic.is_empty() || payload.is_empty() {
            return Err(MinorError::new("`topic` and `payload` are required").into());
        }
        let data = payload.to_bytes()?;
        let properties = MessageProperties {
            content_type: Some(payload.content_type().to_string()),
            content_encoding: Some(CONTENT_ENCODING_UTF8.to_string()),
            correlation_id: options.correlation_id,
            reply_to: options.reply_to,
        };
        let delivered = self.exchange.route(topic, &data, &properties)?;
        if delivered == 0 {
            debug!("message on {topic} matched no queue");
        }
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<(), MessagingError> {
        self.assert_connection()?;
        if pattern.is_empty() {
            return Err(MinorError::new("`pattern` is required").into());
        }
        let mut state = self.state();
        state.queue.mark_bound();
        let ttl = state.queue.message_ttl().map(|ms| Duration::from_millis(ms.into()));
        self.exchange.bind(state.queue.name(), pattern, ttl, &self.tx);
        state.patterns.insert(pattern);
        Ok(())
    }

    async fn unsubscribe(&self, pattern: &str) -> Result<(), MessagingError> {
        self.assert_connection()?;
        if pattern.is_empty() {
            return Err(MinorError::new("`pattern` is required").into());
        }
        let mut state = self.state();
        if state.patterns.remove(pattern) {
            self.exchange.unbind(state.queue.name(), pattern);
        }
        Ok(())
    }

    async fn unsubscribe_all(&self) -> Result<(), MessagingError> {
        for pattern in self.subscribed_patterns() {
            self.unsubscribe(&pattern).await?;
        }
        Ok(())
    }

    fn subscribed_patterns(&self) -> Vec<String> {
        self.state().patterns.to_vec()
    }

    async fn listen(
        &self,
        callback: Arc<dyn MessageCallback>,
        _no_ack: bool,
    ) -> Result<(), MessagingError> {
        self.assert_connection()?;
        let mut consumer = self.active_consumer();
        if consumer.is_some() {
            return Err(MinorError::new("Already listening, call stop_listen first").into());
        }

        let inbox = Arc::clone(&self.inbox);
        let listeners = self.listeners.clone();
        let task = tokio::spawn(async move {
            let mut inbox = inbox.lock().await;
            while let Some(envelope) = inbox.recv().await {
                if envelope.is_expired() {
                    debug!("expired message on {} dropped", envelope.message.routing_key);
                    continue;
                }
                let callback = Arc::clone(&callback);
                let listeners = listeners.clone();
                tokio::spawn(async move {
                    if let Err(err) = callback.on_message(envelope.message).await {
                        listeners.emit(&err);
                    }
                });
            }
        });

        *consumer = Some(ActiveConsumer {
            tag: format!("consumer-{}", Uuid::new_v4().simple()),
            task,
        });
        Ok(())
    }

    async fn stop_listen(&self) -> Result<(), MessagingError> {
        let consumer = self.active_consumer().take();
        if let Some(consumer) = consumer {
            consumer.task.abort();
            // la task suelta el inbox al terminar
            let _ = consumer.task.await;
            debug!("consumer {} stopped", consumer.tag);
        }
        Ok(())
    }

    fn is_listening(&self) -> bool {
        self.active_consumer().is_some()
    }

    async fn delete_queue(&self) -> Result<(), MessagingError> {
        self.assert_connection()?;
        if self.is_listening() {
            return Err(MinorError::new("Must stop listening before deleting queue").into());
        }
        let name = {
            let mut state = self.state();
            state.patterns.clear();
            state.queue.mark_unbound();
            state.queue.name().to_string()
        };
        self.exchange.remove(&name);
        self.drain_inbox().await;
        Ok(())
    }

    async fn empty_queue(&self) -> Result<u32, MessagingError> {
        self.assert_connection()?;
        if self.is_listening() {
            // el consumidor activo ya vacia la cola
            return Ok(0);
        }
        Ok(self.drain_inbox().await)
    }

    fn queue(&self) -> String {
        self.state().queue.name().to_string()
    }

    fn set_queue(&self, name: &str) -> Result<(), MessagingError> {
        self.state().queue.set_name(name)
    }

    fn message_expired_in(&self) -> Option<u32> {
        self.state().queue.message_ttl()
    }

    fn set_message_expired_in(&self, ttl_ms: Option<u32>) -> Result<(), MessagingError> {
        self.state().queue.set_message_ttl(ttl_ms)
    }

    fn on_error(&self, handler: ErrorHandler) {
        self.listeners.add(handler);
    }
}
