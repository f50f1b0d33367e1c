use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::*,
    types::{AMQPValue, FieldTable},
    Channel, Connection, ConnectionProperties, Consumer, ExchangeKind,
};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak,
    },
    time::Duration,
};
use tokio::{
    runtime::Handle,
    sync::{watch, Mutex as AsyncMutex},
    task::JoinHandle,
    time::sleep,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::delivery::{into_message, outgoing_properties};
use eventshop_rpc_core::{
    ConnectionOptions, ConnectionStatus, ErrorHandler, ErrorListeners, MessageBroker,
    MessageCallback, MessagingError, MinorError, Payload, PublishOptions, QueueSpec,
    SubscribedPatterns,
};

/// Wait before replacing a channel the broker closed under us.
const CHANNEL_SETTLE_DELAY: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelKind {
    Publish,
    Consume,
}

impl ChannelKind {
    fn error_context(self) -> &'static str {
        match self {
            Self::Publish => "Publish channel error",
            Self::Consume => "Consume channel error",
        }
    }
}

/// A cached channel tagged with the generation that created it, so a stale
/// close event cannot evict its replacement.
type ChannelSlot = AsyncMutex<Option<(u64, Channel)>>;

struct ActiveConsumer {
    tag: String,
    no_ack: bool,
    callback: Arc<dyn MessageCallback>,
    /// False while `listen` is still setting the consumer up.
    started: bool,
    task: Option<JoinHandle<()>>,
}

struct Inner {
    options: RwLock<ConnectionOptions>,
    status: watch::Sender<ConnectionStatus>,
    connection: AsyncMutex<Option<Connection>>,
    publish: ChannelSlot,
    consume: ChannelSlot,
    generation: AtomicU64,
    queue: Mutex<QueueSpec>,
    patterns: Mutex<SubscribedPatterns>,
    consumer: Mutex<Option<ActiveConsumer>>,
    listeners: ErrorListeners,
}

/// [`MessageBroker`] over RabbitMQ: a topic exchange, one queue, and a
/// publish/consume channel pair on a single self-healing connection.
#[derive(Clone)]
pub struct RabbitConnector {
    inner: Arc<Inner>,
}

impl Default for RabbitConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl RabbitConnector {
    pub fn new() -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            inner: Arc::new(Inner {
                options: RwLock::new(ConnectionOptions::default()),
                status,
                connection: AsyncMutex::new(None),
                publish: AsyncMutex::new(None),
                consume: AsyncMutex::new(None),
                generation: AtomicU64::new(0),
                queue: Mutex::new(QueueSpec::default()),
                patterns: Mutex::new(SubscribedPatterns::default()),
                consumer: Mutex::new(None),
                listeners: ErrorListeners::default(),
            }),
        }
    }

    /// Creates a connector and connects it in one step.
    pub async fn connect_with(options: ConnectionOptions) -> Result<Self, MessagingError> {
        let connector = Self::new();
        connector.connect(options).await?;
        Ok(connector)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Auto-named queues are exclusive, so the broker drops them with the
/// connection. They are never auto-delete: the caller cancels its consumer
/// between calls and the queue, with its reply bindings, must survive that.
fn queue_declare_options(spec: &QueueSpec) -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: !spec.is_ephemeral(),
        auto_delete: false,
        exclusive: spec.is_ephemeral(),
        nowait: false,
        passive: false,
    }
}

impl Inner {
    fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.status.send_replace(status);
    }

    fn options(&self) -> ConnectionOptions {
        self.options
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn slot(&self, kind: ChannelKind) -> &ChannelSlot {
        match kind {
            ChannelKind::Publish => &self.publish,
            ChannelKind::Consume => &self.consume,
        }
    }

    /// Waits out a reconnect in progress; fails if there is no connection at all.
    async fn await_connected(&self) -> Result<(), MessagingError> {
        let mut rx = self.status.subscribe();
        let status = *rx
            .wait_for(|s| *s != ConnectionStatus::Connecting)
            .await
            .map_err(|_| MessagingError::not_connected())?;
        match status {
            ConnectionStatus::Connected => Ok(()),
            _ => Err(MessagingError::not_connected()),
        }
    }

    async fn open_connection(self: &Arc<Self>) -> Result<(), MessagingError> {
        let options = self.options();
        let conn = Connection::connect(&options.uri(), ConnectionProperties::default())
            .await
            .map_err(|e| MessagingError::critical("Connection error", e))?;

        let weak = Arc::downgrade(self);
        let handle = Handle::current();
        conn.on_error(move |err| {
            if let Some(inner) = weak.upgrade() {
                inner.on_connection_lost(err, &handle);
            }
        });

        let mut slot = self.connection.lock().await;
        if self.status() == ConnectionStatus::Disconnected {
            // disconnect() gano la carrera
            let _ = conn.close(200, "Bye").await;
            return Err(MessagingError::not_connected());
        }
        *slot = Some(conn);
        self.set_status(ConnectionStatus::Connected);
        info!(
            "RabbitMQ connected. host={} exchange={}",
            options.host_address, options.exchange
        );
        Ok(())
    }

    fn on_connection_lost(self: Arc<Self>, err: lapin::Error, handle: &Handle) {
        self.listeners
            .emit(&MessagingError::critical("Connection closed", err));
        if self.status() != ConnectionStatus::Connected {
            return;
        }
        self.set_status(ConnectionStatus::Connecting);
        handle.spawn(self.reconnect());
    }

    async fn reconnect(self: Arc<Self>) {
        self.publish.lock().await.take();
        self.consume.lock().await.take();
        if let Some(consumer) = lock(&self.consumer).as_mut() {
            if let Some(task) = consumer.task.take() {
                task.abort();
            }
        }
        self.connection.lock().await.take();

        let delay = self.options().reconnect_delay();
        loop {
            sleep(delay).await;
            if self.status() == ConnectionStatus::Disconnected {
                return;
            }
            info!("RabbitMQ reconnecting...");
            match self.open_connection().await {
                Ok(()) => {
                    if let Err(err) = self.resume().await {
                        self.listeners.emit(&err);
                    }
                    return;
                }
                Err(err) => {
                    warn!("reconnect failed, retrying in {delay:?}");
                    self.listeners.emit(&err);
                }
            }
        }
    }

    /// Cached channel of `kind`, created on first use. The slot lock is held
    /// while creating, so concurrent callers share one creation.
    async fn channel(self: &Arc<Self>, kind: ChannelKind) -> Result<Channel, MessagingError> {
        self.await_connected().await?;
        let mut slot = self.slot(kind).lock().await;
        if let Some((_, ch)) = slot.as_ref() {
            if ch.status().connected() {
                return Ok(ch.clone());
            }
        }
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let ch = self.create_channel(kind, generation).await?;
        *slot = Some((generation, ch.clone()));
        Ok(ch)
    }

    async fn create_channel(
        self: &Arc<Self>,
        kind: ChannelKind,
        generation: u64,
    ) -> Result<Channel, MessagingError> {
        let options = self.options();
        let ch = {
            let conn = self.connection.lock().await;
            let conn = conn.as_ref().ok_or_else(MessagingError::not_connected)?;
            conn.create_channel()
                .await
                .map_err(|e| MessagingError::critical("Channel creation error", e))?
        };

        ch.exchange_declare(
            &options.exchange,
            ExchangeKind::Topic,
            ExchangeDeclareOptions {
                durable: true,
                auto_delete: false,
                internal: false,
                nowait: false,
                passive: false,
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| MessagingError::critical("Exchange assertion error", e))?;

        match kind {
            ChannelKind::Publish if options.confirms => {
                ch.confirm_select(ConfirmSelectOptions::default())
                    .await
                    .map_err(|e| MessagingError::critical("Confirm select error", e))?;
            }
            ChannelKind::Consume => {
                if options.prefetch > 0 {
                    ch.basic_qos(options.prefetch, BasicQosOptions { global: false })
                        .await
                        .map_err(|e| MessagingError::critical("Channel QoS error", e))?;
                }
                self.rebind(&ch).await?;
            }
            _ => {}
        }

        let weak: Weak<Inner> = Arc::downgrade(self);
        let handle = Handle::current();
        ch.on_error(move |err| {
            if let Some(inner) = weak.upgrade() {
                inner.on_channel_lost(kind, generation, err, &handle);
            }
        });

        debug!("{kind:?} channel #{generation} ready");
        Ok(ch)
    }

    /// Re-declares the queue and replays every tracked pattern on a fresh
    /// consume channel.
    async fn rebind(&self, ch: &Channel) -> Result<(), MessagingError> {
        let patterns = lock(&self.patterns).to_vec();
        if patterns.is_empty() {
            return Ok(());
        }
        let queue = self.declare_queue(ch).await?;
        let exchange = self.options().exchange;
        for pattern in &patterns {
            ch.queue_bind(
                &queue,
                &exchange,
                pattern,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|e| MessagingError::critical("Queue binding error", e))?;
        }
        info!("replayed {} binding(s) on queue={queue}", patterns.len());
        Ok(())
    }

    fn on_channel_lost(
        self: Arc<Self>,
        kind: ChannelKind,
        generation: u64,
        err: lapin::Error,
        handle: &Handle,
    ) {
        self.listeners
            .emit(&MessagingError::critical(kind.error_context(), err));
        handle.spawn(async move {
            sleep(CHANNEL_SETTLE_DELAY).await;
            {
                let mut slot = self.slot(kind).lock().await;
                if slot.as_ref().map(|(current, _)| *current) != Some(generation) {
                    // ya reemplazado por uno mas nuevo
                    return;
                }
                slot.take();
            }
            if self.status() != ConnectionStatus::Connected {
                return;
            }
            let recreated = match kind {
                ChannelKind::Publish => self.channel(kind).await.map(|_| ()),
                ChannelKind::Consume => self.resume().await,
            };
            match recreated {
                Ok(()) => info!("{kind:?} channel recreated"),
                Err(err) => self.listeners.emit(&err),
            }
        });
    }

    async fn declare_queue(&self, ch: &Channel) -> Result<String, MessagingError> {
        let spec = lock(&self.queue).clone();
        let mut args = FieldTable::default();
        if let Some(ttl) = spec.message_ttl() {
            args.insert("x-message-ttl".into(), AMQPValue::LongUInt(ttl));
        }
        ch.queue_declare(spec.name(), queue_declare_options(&spec), args)
        .await
        .map_err(|e| MessagingError::critical("Queue assertion error", e))?;
        Ok(spec.name().to_string())
    }

    /// Claims the consumer slot before any await, so concurrent `listen`
    /// calls cannot both start a consumer.
    fn reserve_consumer(
        &self,
        tag: &str,
        no_ack: bool,
        callback: Arc<dyn MessageCallback>,
    ) -> Result<(), MessagingError> {
        let mut slot = lock(&self.consumer);
        if slot.is_some() {
            return Err(MinorError::new("Already listening, call stop_listen first").into());
        }
        *slot = Some(ActiveConsumer {
            tag: tag.to_string(),
            no_ack,
            callback,
            started: false,
            task: None,
        });
        Ok(())
    }

    /// Hands the consume loop to the reservation made for `tag`. Gives the
    /// task back when the reservation was dropped meanwhile (`stop_listen`).
    fn install_consumer(&self, tag: &str, task: JoinHandle<()>) -> Result<(), JoinHandle<()>> {
        match lock(&self.consumer).as_mut() {
            Some(active) if active.tag == tag && !active.started => {
                active.started = true;
                active.task = Some(task);
                Ok(())
            }
            _ => Err(task),
        }
    }

    fn release_consumer(&self, tag: &str) {
        let mut slot = lock(&self.consumer);
        if slot.as_ref().is_some_and(|active| active.tag == tag) {
            slot.take();
        }
    }

    /// Brings consumption back after the consume channel was replaced.
    async fn resume(self: &Arc<Self>) -> Result<(), MessagingError> {
        let resumable = lock(&self.consumer)
            .as_ref()
            .filter(|c| c.started)
            .map(|c| (c.tag.clone(), c.no_ack, Arc::clone(&c.callback)));
        if resumable.is_none() && lock(&self.patterns).is_empty() {
            return Ok(());
        }
        let ch = self.channel(ChannelKind::Consume).await?;
        let Some((tag, no_ack, callback)) = resumable else {
            return Ok(());
        };

        let consumer = self.start_consumer(&ch, &tag, no_ack).await?;
        let task = self.spawn_consume_loop(consumer, callback, no_ack);
        if let Some(active) = lock(&self.consumer).as_mut() {
            if let Some(old) = active.task.replace(task) {
                old.abort();
            }
        } else {
            task.abort();
        }
        info!("consumer {tag} resumed");
        Ok(())
    }

    async fn start_consumer(
        &self,
        ch: &Channel,
        tag: &str,
        no_ack: bool,
    ) -> Result<Consumer, MessagingError> {
        let queue = self.declare_queue(ch).await?;
        let consumer = ch
            .basic_consume(
                &queue,
                tag,
                BasicConsumeOptions {
                    no_ack,
                    exclusive: false,
                    nowait: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| MessagingError::critical("Consuming error", e))?;
        info!(
            "Consuming queue={} exchange={}",
            queue,
            self.options().exchange
        );
        Ok(consumer)
    }

    fn spawn_consume_loop(
        &self,
        mut consumer: Consumer,
        callback: Arc<dyn MessageCallback>,
        no_ack: bool,
    ) -> JoinHandle<()> {
        let listeners = self.listeners.clone();
        tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                match delivery {
                    Ok(d) => {
                        let message = match into_message(d, no_ack).await {
                            Ok(message) => message,
                            Err(err) => {
                                listeners.emit(&err);
                                continue;
                            }
                        };
                        let callback = Arc::clone(&callback);
                        let listeners = listeners.clone();
                        tokio::spawn(async move {
                            let rk = message.routing_key.clone();
                            if let Err(err) = callback.on_message(message).await {
                                error!("handler error: {}, routing_key={}", err, rk);
                                listeners.emit(&err);
                            }
                        });
                    }
                    Err(e) => {
                        error!("delivery error: {e}");
                        break;
                    }
                }
            }
        })
    }

    async fn close_channel(slot: Option<(u64, Channel)>) -> Result<(), MessagingError> {
        match slot {
            Some((_, ch)) if ch.status().connected() => ch
                .close(200, "Bye")
                .await
                .map_err(|e| MessagingError::critical("Channel closing error", e)),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl MessageBroker for RabbitConnector {
    async fn connect(&self, options: ConnectionOptions) -> Result<(), MessagingError> {
        if self.inner.status() != ConnectionStatus::Disconnected {
            return Ok(());
        }
        {
            let mut queue = lock(&self.inner.queue);
            if !queue.is_bound() {
                if !options.queue.is_empty() {
                    queue.set_name(&options.queue)?;
                }
                if options.message_expired_in.is_some() {
                    queue.set_message_ttl(options.message_expired_in)?;
                }
            }
        }
        *self
            .inner
            .options
            .write()
            .unwrap_or_else(PoisonError::into_inner) = options;
        self.inner.set_status(ConnectionStatus::Connecting);

        if let Err(err) = self.inner.open_connection().await {
            self.inner.set_status(ConnectionStatus::Disconnected);
            self.inner.listeners.emit(&err);
            return Err(err);
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), MessagingError> {
        if self.inner.status() == ConnectionStatus::Disconnected {
            return Ok(());
        }
        self.inner.set_status(ConnectionStatus::Disconnected);

        if let Some(consumer) = lock(&self.inner.consumer).take() {
            if let Some(task) = consumer.task {
                task.abort();
            }
        }
        // sacar del slot primero: los on_error viejos ya no coinciden
        let publish = self.inner.publish.lock().await.take();
        let consume = self.inner.consume.lock().await.take();
        let (published, consumed) = tokio::join!(
            Inner::close_channel(publish),
            Inner::close_channel(consume)
        );

        let closed = match self.inner.connection.lock().await.take() {
            Some(conn) => conn
                .close(200, "Bye")
                .await
                .map_err(|e| MessagingError::critical("Connection closing error", e)),
            None => Ok(()),
        };
        info!("RabbitMQ disconnected");
        published.and(consumed).and(closed)
    }

    fn status(&self) -> ConnectionStatus {
        self.inner.status()
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Payload,
        options: PublishOptions,
    ) -> Result<(), MessagingError> {
        if topic.is_empty() || payload.is_empty() {
            return Err(MinorError::new("`topic` and `payload` are required").into());
        }
        let ch = self.inner.channel(ChannelKind::Publish).await?;
        let body = payload.to_bytes()?;
        let exchange = self.inner.options().exchange;

        let confirm = ch
            .basic_publish(
                &exchange,
                topic,
                BasicPublishOptions {
                    mandatory: false,
                    immediate: false,
                },
                &body,
                outgoing_properties(payload.content_type(), options),
            )
            .await
            .map_err(|e| MessagingError::critical("Publishing error", e))?
            .await
            .map_err(|e| MessagingError::critical("Publishing error", e))?;

        if confirm.is_nack() {
            return Err(MessagingError::Critical(
                "Publishing error: publisher confirm NACK".to_string(),
            ));
        }
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<(), MessagingError> {
        if pattern.is_empty() {
            return Err(MinorError::new("`pattern` is required").into());
        }
        let ch = self.inner.channel(ChannelKind::Consume).await?;
        lock(&self.inner.queue).mark_bound();
        let queue = self.inner.declare_queue(&ch).await?;
        ch.queue_bind(
            &queue,
            &self.inner.options().exchange,
            pattern,
            QueueBindOptions { nowait: false },
            FieldTable::default(),
        )
        .await
        .map_err(|e| MessagingError::critical("Queue binding error", e))?;
        lock(&self.inner.patterns).insert(pattern);
        debug!("bound {pattern} to queue={queue}");
        Ok(())
    }

    async fn unsubscribe(&self, pattern: &str) -> Result<(), MessagingError> {
        if pattern.is_empty() {
            return Err(MinorError::new("`pattern` is required").into());
        }
        if !lock(&self.inner.patterns).contains(pattern) {
            return Ok(());
        }
        let ch = self.inner.channel(ChannelKind::Consume).await?;
        let queue = lock(&self.inner.queue).name().to_string();
        ch.queue_unbind(
            &queue,
            &self.inner.options().exchange,
            pattern,
            FieldTable::default(),
        )
        .await
        .map_err(|e| MessagingError::critical("Queue unbinding error", e))?;
        lock(&self.inner.patterns).remove(pattern);
        debug!("unbound {pattern} from queue={queue}");
        Ok(())
    }

    async fn unsubscribe_all(&self) -> Result<(), MessagingError> {
        for pattern in self.subscribed_patterns() {
            self.unsubscribe(&pattern).await?;
        }
        Ok(())
    }

    fn subscribed_patterns(&self) -> Vec<String> {
        lock(&self.inner.patterns).to_vec()
    }

    async fn listen(
        &self,
        callback: Arc<dyn MessageCallback>,
        no_ack: bool,
    ) -> Result<(), MessagingError> {
        let tag = format!("consumer-{}", Uuid::new_v4().simple());
        self.inner
            .reserve_consumer(&tag, no_ack, Arc::clone(&callback))?;

        let started = match self.inner.channel(ChannelKind::Consume).await {
            Ok(ch) => self
                .inner
                .start_consumer(&ch, &tag, no_ack)
                .await
                .map(|consumer| (ch, consumer)),
            Err(err) => Err(err),
        };
        let (ch, consumer) = match started {
            Ok(started) => started,
            Err(err) => {
                self.inner.release_consumer(&tag);
                return Err(err);
            }
        };

        let task = self.inner.spawn_consume_loop(consumer, callback, no_ack);
        if let Err(task) = self.inner.install_consumer(&tag, task) {
            // stop_listen llego mientras arrancaba
            task.abort();
            ch.basic_cancel(&tag, BasicCancelOptions::default())
                .await
                .map_err(|e| MessagingError::critical("Consumer cancelling error", e))?;
        }
        Ok(())
    }

    async fn stop_listen(&self) -> Result<(), MessagingError> {
        let Some(consumer) = lock(&self.inner.consumer).take() else {
            return Ok(());
        };
        if let Some(task) = consumer.task {
            task.abort();
        }
        let ch = self.inner.consume.lock().await.as_ref().map(|(_, ch)| ch.clone());
        if let Some(ch) = ch.filter(|ch| ch.status().connected()) {
            ch.basic_cancel(&consumer.tag, BasicCancelOptions::default())
                .await
                .map_err(|e| MessagingError::critical("Consumer cancelling error", e))?;
        }
        info!("consumer {} stopped", consumer.tag);
        Ok(())
    }

    fn is_listening(&self) -> bool {
        lock(&self.inner.consumer).is_some()
    }

    async fn delete_queue(&self) -> Result<(), MessagingError> {
        self.inner.await_connected().await?;
        if self.is_listening() {
            return Err(MinorError::new("Must stop listening before deleting queue").into());
        }
        let ch = self.inner.channel(ChannelKind::Consume).await?;
        let queue = lock(&self.inner.queue).name().to_string();
        ch.queue_delete(&queue, QueueDeleteOptions::default())
            .await
            .map_err(|e| MessagingError::critical("Queue deleting error", e))?;
        lock(&self.inner.patterns).clear();
        lock(&self.inner.queue).mark_unbound();
        info!("queue={queue} deleted");
        Ok(())
    }

    async fn empty_queue(&self) -> Result<u32, MessagingError> {
        let ch = self.inner.channel(ChannelKind::Consume).await?;
        let queue = self.inner.declare_queue(&ch).await?;
        ch.queue_purge(&queue, QueuePurgeOptions::default())
            .await
            .map_err(|e| MessagingError::critical("Queue purging error", e))
    }

    fn queue(&self) -> String {
        lock(&self.inner.queue).name().to_string()
    }

    fn set_queue(&self, name: &str) -> Result<(), MessagingError> {
        lock(&self.inner.queue).set_name(name)
    }

    fn message_expired_in(&self) -> Option<u32> {
        lock(&self.inner.queue).message_ttl()
    }

    fn set_message_expired_in(&self, ttl_ms: Option<u32>) -> Result<(), MessagingError> {
        lock(&self.inner.queue).set_message_ttl(ttl_ms)
    }

    fn on_error(&self, handler: ErrorHandler) {
        self.inner.listeners.add(handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventshop_rpc_core::IncomingMessage;

    struct Ignore;

    #[async_trait]
    impl MessageCallback for Ignore {
        async fn on_message(&self, _message: IncomingMessage) -> Result<(), MessagingError> {
            Ok(())
        }
    }

    #[test]
    fn reply_queues_survive_consumer_cancel() {
        let ephemeral = queue_declare_options(&QueueSpec::default());
        assert!(ephemeral.exclusive);
        assert!(!ephemeral.auto_delete);
        assert!(!ephemeral.durable);

        let named = queue_declare_options(&QueueSpec::new("billing", None));
        assert!(named.durable);
        assert!(!named.exclusive);
        assert!(!named.auto_delete);
    }

    #[tokio::test]
    async fn only_one_listen_can_claim_the_consumer() {
        let cnn = RabbitConnector::new();
        cnn.inner
            .reserve_consumer("consumer-a", true, Arc::new(Ignore))
            .unwrap();
        let err = cnn
            .inner
            .reserve_consumer("consumer-b", true, Arc::new(Ignore))
            .unwrap_err();
        assert!(err.is_minor());
        assert!(cnn.is_listening());

        // el perdedor no puede instalar su loop
        let loser = tokio::spawn(std::future::pending::<()>());
        let loser = cnn.inner.install_consumer("consumer-b", loser).unwrap_err();
        loser.abort();

        let winner = tokio::spawn(std::future::pending::<()>());
        assert!(cnn.inner.install_consumer("consumer-a", winner).is_ok());
        cnn.stop_listen().await.unwrap();
        assert!(!cnn.is_listening());
    }

    #[tokio::test]
    async fn stop_during_setup_hands_the_task_back() {
        let cnn = RabbitConnector::new();
        cnn.inner
            .reserve_consumer("consumer-a", true, Arc::new(Ignore))
            .unwrap();
        cnn.stop_listen().await.unwrap();

        let task = tokio::spawn(std::future::pending::<()>());
        let task = cnn.inner.install_consumer("consumer-a", task).unwrap_err();
        task.abort();
        assert!(!cnn.is_listening());
    }

    #[tokio::test]
    async fn failed_listen_releases_the_consumer_slot() {
        let cnn = RabbitConnector::new();
        assert!(cnn.listen(Arc::new(Ignore), true).await.is_err());
        assert!(!cnn.is_listening());
        assert!(cnn.listen(Arc::new(Ignore), true).await.is_err());
    }

    #[tokio::test]
    async fn operations_fail_fast_without_connection() {
        let cnn = RabbitConnector::new();
        assert_eq!(cnn.status(), ConnectionStatus::Disconnected);

        cnn.disconnect().await.unwrap();
        cnn.stop_listen().await.unwrap();

        let err = cnn
            .publish("a.b", Payload::from("x"), PublishOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MessagingError::Critical(_)));
        assert!(cnn.subscribe("a.b").await.is_err());
        assert!(cnn.empty_queue().await.is_err());
        assert!(cnn.delete_queue().await.is_err());
    }

    #[tokio::test]
    async fn arguments_are_validated_before_touching_the_broker() {
        let cnn = RabbitConnector::new();
        assert!(cnn
            .publish("", Payload::from("x"), PublishOptions::default())
            .await
            .unwrap_err()
            .is_minor());
        assert!(cnn.subscribe("").await.unwrap_err().is_minor());
        assert!(cnn.unsubscribe("").await.unwrap_err().is_minor());
        // patron nunca suscrito: no-op
        cnn.unsubscribe("never.bound").await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_broker_reports_and_resets() {
        let cnn = RabbitConnector::new();
        let seen = Arc::new(Mutex::new(0));
        {
            let seen = Arc::clone(&seen);
            cnn.on_error(Arc::new(move |_: &MessagingError| *seen.lock().unwrap() += 1));
        }

        let err = cnn
            .connect(ConnectionOptions {
                host_address: "127.0.0.1:1".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, MessagingError::Critical(_)));
        assert_eq!(cnn.status(), ConnectionStatus::Disconnected);
        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[test]
    fn queue_settings_apply_until_bound() {
        let cnn = RabbitConnector::new();
        assert!(cnn.queue().starts_with("auto-gen-"));
        cnn.set_queue("billing").unwrap();
        cnn.set_message_expired_in(Some(30_000)).unwrap();

        lock(&cnn.inner.queue).mark_bound();
        assert!(cnn.set_queue("orders").unwrap_err().is_minor());
        assert!(cnn.set_message_expired_in(None).unwrap_err().is_minor());
        assert_eq!(cnn.queue(), "billing");
        assert_eq!(cnn.message_expired_in(), Some(30_000));
    }
}
