// eventshop-rpc-core/src/rpc/caller.rs
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    rpc::{reply_topic, request_topic, ErrorRegistry, RpcBase, RpcResponse},
    ErrorHandler, ErrorListeners, IncomingMessage, MessageBroker, MessageCallback, MessagingError,
    MinorError, Payload, PublishOptions,
};

pub const RESPONSE_TIMEOUT_MESSAGE: &str = "Response waiting timeout";

type Reply = Result<RpcResponse, MessagingError>;

/// Correlation id -> single-completion channel. Whoever removes an entry
/// owns the call's completion.
#[derive(Default)]
struct PendingCalls {
    calls: Mutex<HashMap<String, oneshot::Sender<Reply>>>,
}

impl PendingCalls {
    fn insert(&self, id: &str) -> oneshot::Receiver<Reply> {
        let (tx, rx) = oneshot::channel();
        if let Ok(mut calls) = self.calls.lock() {
            calls.insert(id.to_string(), tx);
        }
        rx
    }

    fn take(&self, id: &str) -> Option<oneshot::Sender<Reply>> {
        self.calls.lock().ok()?.remove(id)
    }

    fn drain(&self) -> Vec<oneshot::Sender<Reply>> {
        match self.calls.lock() {
            Ok(mut calls) => calls.drain().map(|(_, tx)| tx).collect(),
            Err(_) => Vec::new(),
        }
    }

    fn len(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Listen callback that routes replies to the pending call with the same
/// correlation id and drops everything else.
struct ReplyRouter {
    pending: Arc<PendingCalls>,
    listeners: ErrorListeners,
}

#[async_trait]
impl MessageCallback for ReplyRouter {
    async fn on_message(&self, message: IncomingMessage) -> Result<(), MessagingError> {
        let Some(id) = message.properties.correlation_id.as_deref() else {
            debug!("reply without correlation id on {}", message.routing_key);
            return Ok(());
        };
        let reply = message.payload.parse::<RpcResponse>();
        match self.pending.take(id) {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => debug!("no pending call for correlation id {id}, reply dropped"),
        }
        if let Err(err) = message.ack().await {
            self.listeners.emit(&err);
        }
        Ok(())
    }
}

/// Request/response calls to other modules through the message broker.
pub struct MediateRpcCaller {
    base: RpcBase,
    broker: Arc<dyn MessageBroker>,
    pending: Arc<PendingCalls>,
    router: Arc<ReplyRouter>,
    listening: AsyncMutex<bool>,
}

impl MediateRpcCaller {
    pub fn new(broker: Arc<dyn MessageBroker>, name: impl Into<String>) -> Self {
        let base = RpcBase::new(name, ErrorRegistry::default());
        let pending = Arc::new(PendingCalls::default());
        let router = Arc::new(ReplyRouter {
            pending: Arc::clone(&pending),
            listeners: base.listeners().clone(),
        });
        Self {
            base,
            broker,
            pending,
            router,
            listening: AsyncMutex::new(false),
        }
    }

    pub fn with_errors(mut self, errors: ErrorRegistry) -> Self {
        self.base.set_errors(errors);
        self
    }

    pub fn name(&self) -> &str {
        self.base.name()
    }

    pub fn timeout(&self) -> Duration {
        self.base.timeout()
    }

    /// Accepts 1000..=60000 ms; anything else keeps the current value.
    pub fn set_timeout(&self, ms: u64) -> bool {
        self.base.set_timeout(ms)
    }

    pub fn on_error(&self, handler: ErrorHandler) {
        self.base.on_error(handler);
    }

    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    /// Forwards connector faults to this caller's error listeners.
    pub fn init(&self) {
        let listeners = self.base.listeners().clone();
        self.broker.on_error(Arc::new(move |err: &MessagingError| listeners.emit(err)));
    }

    /// Stops listening and fails every call still waiting for a reply.
    pub async fn dispose(&self) -> Result<(), MessagingError> {
        for tx in self.pending.drain() {
            let _ = tx.send(Err(MinorError::new("RPC caller has been disposed").into()));
        }
        let mut listening = self.listening.lock().await;
        if *listening {
            self.broker.stop_listen().await?;
            *listening = false;
        }
        Ok(())
    }

    /// Calls `action` on `module_name` and waits for its response or for the
    /// timeout, whichever comes first.
    pub async fn call<P: Serialize>(
        &self,
        module_name: &str,
        action: &str,
        params: P,
    ) -> Result<RpcResponse, MessagingError> {
        if module_name.is_empty() || action.is_empty() {
            return Err(MinorError::new("`moduleName` and `action` are required").into());
        }
        let params = serde_json::to_value(params)?;

        let correlation_id = Uuid::new_v4().to_string();
        let reply_to = reply_topic(module_name, action, &correlation_id);
        let reply = self.pending.insert(&correlation_id);

        if let Err(err) = self
            .send_request(module_name, action, params, &correlation_id, &reply_to)
            .await
        {
            self.pending.take(&correlation_id);
            self.release_reply_topic(&reply_to).await;
            return Err(MinorError::new(format!("RPC error: {err}")).into());
        }

        let outcome = self
            .wait_for_reply(reply, &correlation_id, &reply_to)
            .await;
        self.release_reply_topic(&reply_to).await;
        let response = outcome?;

        if response.is_success {
            Ok(response)
        } else {
            Err(self.base.rebuild_error(&response.payload))
        }
    }

    async fn send_request(
        &self,
        module_name: &str,
        action: &str,
        params: serde_json::Value,
        correlation_id: &str,
        reply_to: &str,
    ) -> Result<(), MessagingError> {
        self.broker.subscribe(reply_to).await?;
        self.ensure_listening().await?;

        let request = self.base.create_request(module_name, params);
        let options = PublishOptions::default()
            .with_correlation_id(correlation_id)
            .with_reply_to(reply_to);
        self.broker
            .publish(
                &request_topic(module_name, action),
                Payload::json(&request)?,
                options,
            )
            .await
    }

    async fn wait_for_reply(
        &self,
        mut reply: oneshot::Receiver<Reply>,
        correlation_id: &str,
        reply_to: &str,
    ) -> Reply {
        tokio::select! {
            received = &mut reply => {
                received.unwrap_or_else(|_| Err(MessagingError::internal("Reply channel closed")))
            }
            _ = tokio::time::sleep(self.base.timeout()) => {
                if self.pending.take(correlation_id).is_some() {
                    warn!("no response on {reply_to} within {:?}", self.base.timeout());
                    return Err(MinorError::new(RESPONSE_TIMEOUT_MESSAGE).retryable().into());
                }
                // la respuesta gano la carrera: ya esta en camino
                reply
                    .await
                    .unwrap_or_else(|_| Err(MinorError::new(RESPONSE_TIMEOUT_MESSAGE).retryable().into()))
            }
        }
    }

    async fn ensure_listening(&self) -> Result<(), MessagingError> {
        let mut listening = self.listening.lock().await;
        if !*listening {
            let callback: Arc<dyn MessageCallback> = self.router.clone();
            self.broker.listen(callback, true).await?;
            *listening = true;
        }
        Ok(())
    }

    /// Best effort: unbinds the reply topic and stops listening once no call
    /// is waiting.
    async fn release_reply_topic(&self, reply_to: &str) {
        if let Err(err) = self.broker.unsubscribe(reply_to).await {
            debug!("could not unsubscribe {reply_to}: {err}");
        }
        let mut listening = self.listening.lock().await;
        if *listening && self.pending.is_empty() {
            if let Err(err) = self.broker.stop_listen().await {
                self.base.emit_error(&err);
            }
            *listening = false;
        }
    }
}
