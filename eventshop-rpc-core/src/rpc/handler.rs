// eventshop-rpc-core/src/rpc/handler.rs
use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use futures_util::FutureExt;
use serde_json::Value;
use tracing::{debug, info};

use crate::{
    rpc::{
        request_topic, ActionFactory, ActionRegistry, ErrorRegistry, Responder, RpcBase,
        RpcRequest,
    },
    ErrorHandler, IncomingMessage, MessageBroker, MessageCallback, MessagingError, MinorError,
    Payload, PublishOptions,
};

pub const CRUD_ACTIONS: [&str; 6] = ["countAll", "create", "delete", "find", "patch", "update"];

/// Serves a module's actions on `request.<module>.<action>` topics.
///
/// Consumption is auto-ack: a request is acknowledged on delivery, so a crash
/// while the action runs loses that request instead of redelivering it.
/// Callers see a timeout in that case.
pub struct MediateRpcHandler {
    base: RpcBase,
    module: String,
    broker: Arc<dyn MessageBroker>,
    registry: Arc<dyn ActionRegistry>,
    actions: Mutex<Vec<String>>,
}

impl MediateRpcHandler {
    pub fn new(broker: Arc<dyn MessageBroker>, registry: Arc<dyn ActionRegistry>) -> Self {
        Self {
            base: RpcBase::new("", ErrorRegistry::default()),
            module: String::new(),
            broker,
            registry,
            actions: Mutex::new(Vec::new()),
        }
    }

    /// Name stamped as `from` on every response.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.base.set_name(name);
        self
    }

    pub fn with_module(mut self, module: impl Into<String>) -> Self {
        self.module = module.into();
        self
    }

    pub fn name(&self) -> &str {
        self.base.name()
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn on_error(&self, handler: ErrorHandler) {
        self.base.on_error(handler);
    }

    /// Validates configuration and forwards connector faults to this
    /// handler's error listeners.
    pub fn init(&self) -> Result<(), MessagingError> {
        self.assert_configured()?;
        let listeners = self.base.listeners().clone();
        self.broker.on_error(Arc::new(move |err: &MessagingError| listeners.emit(err)));
        Ok(())
    }

    /// Registers `actions` against `identifier` and binds their request topics.
    pub async fn handle(
        &self,
        actions: &[&str],
        identifier: &str,
        factory: Option<ActionFactory>,
    ) -> Result<(), MessagingError> {
        self.assert_configured()?;
        for action in actions {
            self.registry.register(action, identifier, factory.clone());
            self.broker
                .subscribe(&request_topic(&self.module, action))
                .await?;
            if let Ok(mut served) = self.actions.lock() {
                if !served.iter().any(|a| a == action) {
                    served.push(action.to_string());
                }
            }
        }
        Ok(())
    }

    pub async fn handle_crud(
        &self,
        identifier: &str,
        factory: Option<ActionFactory>,
    ) -> Result<(), MessagingError> {
        self.handle(&CRUD_ACTIONS, identifier, factory).await
    }

    /// Starts consuming requests.
    pub async fn start(self: &Arc<Self>) -> Result<(), MessagingError> {
        self.assert_configured()?;
        let callback: Arc<dyn MessageCallback> = self.clone();
        self.broker.listen(callback, true).await?;
        info!("RPC handler {} serving module {}", self.name(), self.module);
        Ok(())
    }

    /// Stops consuming, unbinds the request topics this handler bound and
    /// drops its own registrations. Other actions in a shared registry stay.
    pub async fn dispose(&self) -> Result<(), MessagingError> {
        self.broker.stop_listen().await?;
        let served = match self.actions.lock() {
            Ok(mut served) => std::mem::take(&mut *served),
            Err(_) => Vec::new(),
        };
        for action in served {
            self.broker
                .unsubscribe(&request_topic(&self.module, &action))
                .await?;
            self.registry.unregister(&action);
        }
        Ok(())
    }

    fn assert_configured(&self) -> Result<(), MessagingError> {
        if self.base.name().is_empty() || self.module.is_empty() {
            return Err(
                MinorError::new("`name` and `module` are required for an RPC handler").into(),
            );
        }
        Ok(())
    }

    async fn execute(&self, action: &str, request: RpcRequest) -> Result<Value, MessagingError> {
        let callable = self.registry.resolve(action)?;
        let (responder, mut outcome) = Responder::channel();
        let payload = request.payload.clone();

        let fut = match panic::catch_unwind(AssertUnwindSafe(|| {
            callable(payload, responder, request)
        })) {
            Ok(fut) => fut,
            Err(panic) => return Err(panic_error(action, panic)),
        };

        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(Ok(())) => outcome.await.unwrap_or_else(|_| {
                Err(MessagingError::internal(format!(
                    "Action \"{action}\" finished without responding"
                )))
            }),
            // lo primero que se resuelva gana
            Ok(Err(err)) => outcome.try_recv().unwrap_or(Err(err)),
            Err(panic) => Err(panic_error(action, panic)),
        }
    }

    async fn respond(
        &self,
        reply_to: &str,
        correlation_id: &str,
        to: &str,
        outcome: Result<Value, MessagingError>,
    ) {
        let response = match outcome {
            Ok(result) => self.base.create_response(true, result, to),
            Err(err) => match serde_json::to_value(self.base.create_error(&err)) {
                Ok(error) => self.base.create_response(false, error, to),
                Err(build_err) => {
                    self.base.emit_error(&MessagingError::from(build_err));
                    return;
                }
            },
        };

        let published = match Payload::json(&response) {
            Ok(payload) => {
                let options = PublishOptions::default().with_correlation_id(correlation_id);
                self.broker.publish(reply_to, payload, options).await
            }
            Err(err) => Err(err),
        };
        if let Err(err) = published {
            self.base.emit_error(&err);
        }
    }
}

#[async_trait]
impl MessageCallback for MediateRpcHandler {
    async fn on_message(&self, message: IncomingMessage) -> Result<(), MessagingError> {
        let action = message
            .routing_key
            .rsplit('.')
            .next()
            .unwrap_or_default()
            .to_string();
        let props = &message.properties;
        let (Some(correlation_id), Some(reply_to)) =
            (props.correlation_id.as_deref(), props.reply_to.as_deref())
        else {
            return Err(MinorError::new(format!(
                "Request on {} has no correlation id or reply address",
                message.routing_key
            ))
            .into());
        };

        debug!("RPC request {action} ({correlation_id})");
        match message.payload.parse::<RpcRequest>() {
            Ok(request) => {
                let to = request.from.clone();
                let outcome = self.execute(&action, request).await;
                self.respond(reply_to, correlation_id, &to, outcome).await;
            }
            Err(err) => self.respond(reply_to, correlation_id, "", Err(err)).await,
        }
        Ok(())
    }
}

fn panic_error(action: &str, panic: Box<dyn Any + Send>) -> MessagingError {
    let reason = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    MessagingError::internal(format!("Action \"{action}\" panicked: {reason}"))
}
