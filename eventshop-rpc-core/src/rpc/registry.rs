// eventshop-rpc-core/src/rpc/registry.rs
use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, RwLock},
};

use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::{rpc::RpcRequest, MessagingError};

pub type ActionResult = Result<Value, MessagingError>;
pub type ActionFuture = BoxFuture<'static, Result<(), MessagingError>>;

/// `(payload, responder, raw request)`. The action settles through the
/// responder, now or later; an `Err` from the future counts as a reject.
pub type ActionFn = Arc<dyn Fn(Value, Responder, RpcRequest) -> ActionFuture + Send + Sync>;

/// Picks the callable for `action` out of a resolved controller.
pub type ActionFactory =
    Arc<dyn Fn(Arc<dyn RpcController>, &str) -> Option<ActionFn> + Send + Sync>;

/// One-shot settlement handle given to every action invocation.
pub struct Responder {
    tx: oneshot::Sender<ActionResult>,
}

impl Responder {
    pub(crate) fn channel() -> (Self, oneshot::Receiver<ActionResult>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    pub fn resolve(self, value: Value) {
        self.settle(Ok(value));
    }

    pub fn reject(self, err: MessagingError) {
        self.settle(Err(err));
    }

    pub fn settle(self, result: ActionResult) {
        // el handler ya no espera: nada que hacer
        let _ = self.tx.send(result);
    }
}

/// Wraps `async fn(payload, request) -> Result<Value>` as an [`ActionFn`].
pub fn action_fn<F, Fut>(f: F) -> ActionFn
where
    F: Fn(Value, RpcRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ActionResult> + Send + 'static,
{
    Arc::new(
        move |payload: Value, responder: Responder, request: RpcRequest| -> ActionFuture {
            let fut = f(payload, request);
            Box::pin(async move {
                responder.settle(fut.await);
                Ok(())
            })
        },
    )
}

/// A resolved dependency exposing actions by name.
pub trait RpcController: Send + Sync {
    fn action(&self, name: &str) -> Option<ActionFn>;
}

pub trait DependencyResolver: Send + Sync {
    fn resolve(&self, identifier: &str) -> Option<Arc<dyn RpcController>>;
}

pub trait ActionRegistry: Send + Sync {
    fn register(&self, action: &str, identifier: &str, factory: Option<ActionFactory>);

    /// Fails with an internal error when the action is unknown or its target
    /// has no matching callable.
    fn resolve(&self, action: &str) -> Result<ActionFn, MessagingError>;

    fn unregister(&self, action: &str);

    fn clear(&self);
}

/// Resolver backed by a fixed identifier -> controller map.
#[derive(Default, Clone)]
pub struct ControllerMap {
    controllers: Arc<RwLock<HashMap<String, Arc<dyn RpcController>>>>,
}

impl ControllerMap {
    pub fn bind(&self, identifier: &str, controller: Arc<dyn RpcController>) {
        if let Ok(mut controllers) = self.controllers.write() {
            controllers.insert(identifier.to_string(), controller);
        }
    }
}

impl DependencyResolver for ControllerMap {
    fn resolve(&self, identifier: &str) -> Option<Arc<dyn RpcController>> {
        self.controllers.read().ok()?.get(identifier).cloned()
    }
}

#[derive(Clone)]
struct ActionRegistration {
    identifier: String,
    factory: Option<ActionFactory>,
}

/// Resolves actions lazily through a [`DependencyResolver`] at call time.
pub struct DependencyActionRegistry {
    resolver: Arc<dyn DependencyResolver>,
    actions: RwLock<HashMap<String, ActionRegistration>>,
}

impl DependencyActionRegistry {
    pub fn new(resolver: Arc<dyn DependencyResolver>) -> Self {
        Self {
            resolver,
            actions: RwLock::new(HashMap::new()),
        }
    }
}

impl ActionRegistry for DependencyActionRegistry {
    fn register(&self, action: &str, identifier: &str, factory: Option<ActionFactory>) {
        if let Ok(mut actions) = self.actions.write() {
            actions.insert(
                action.to_string(),
                ActionRegistration {
                    identifier: identifier.to_string(),
                    factory,
                },
            );
        }
    }

    fn resolve(&self, action: &str) -> Result<ActionFn, MessagingError> {
        let registration = self
            .actions
            .read()
            .ok()
            .and_then(|actions| actions.get(action).cloned())
            .ok_or_else(|| {
                MessagingError::internal(format!("Action \"{action}\" has not been registered"))
            })?;

        let target = self.resolver.resolve(&registration.identifier).ok_or_else(|| {
            MessagingError::internal(format!(
                "Cannot resolve dependency \"{}\"",
                registration.identifier
            ))
        })?;

        let callable = match &registration.factory {
            Some(factory) => factory(target, action),
            None => target.action(action),
        };
        callable.ok_or_else(|| {
            MessagingError::internal(format!(
                "\"{}\" has no callable for action \"{action}\"",
                registration.identifier
            ))
        })
    }

    fn unregister(&self, action: &str) {
        if let Ok(mut actions) = self.actions.write() {
            actions.remove(action);
        }
    }

    fn clear(&self) {
        if let Ok(mut actions) = self.actions.write() {
            actions.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Greeter;

    impl RpcController for Greeter {
        fn action(&self, name: &str) -> Option<ActionFn> {
            match name {
                "greet" => Some(action_fn(|payload, _| async move {
                    Ok(json!(format!("hello {}", payload["who"].as_str().unwrap_or("?"))))
                })),
                _ => None,
            }
        }
    }

    fn registry() -> DependencyActionRegistry {
        let controllers = ControllerMap::default();
        controllers.bind("greeter", Arc::new(Greeter));
        DependencyActionRegistry::new(Arc::new(controllers))
    }

    async fn invoke(f: ActionFn, payload: Value) -> ActionResult {
        let (responder, rx) = Responder::channel();
        let request = RpcRequest {
            from: "t".into(),
            to: "t".into(),
            payload: payload.clone(),
        };
        f(payload, responder, request).await?;
        rx.await.unwrap()
    }

    #[tokio::test]
    async fn resolves_by_action_name() {
        let reg = registry();
        reg.register("greet", "greeter", None);
        let f = reg.resolve("greet").unwrap();
        assert_eq!(invoke(f, json!({"who": "bob"})).await.unwrap(), json!("hello bob"));
    }

    #[tokio::test]
    async fn factory_picks_another_method() {
        let reg = registry();
        let factory: ActionFactory =
            Arc::new(|ctrl: Arc<dyn RpcController>, _action: &str| ctrl.action("greet"));
        reg.register("salute", "greeter", Some(factory));
        let f = reg.resolve("salute").unwrap();
        assert_eq!(invoke(f, json!({"who": "ann"})).await.unwrap(), json!("hello ann"));
    }

    #[test]
    fn unknown_action_or_target_is_internal() {
        let reg = registry();
        assert!(matches!(reg.resolve("nope"), Err(MessagingError::Internal(_))));

        reg.register("wave", "greeter", None);
        assert!(matches!(reg.resolve("wave"), Err(MessagingError::Internal(_))));

        reg.register("greet", "missing", None);
        assert!(matches!(reg.resolve("greet"), Err(MessagingError::Internal(_))));

        reg.clear();
        assert!(reg.resolve("greet").is_err());
    }

    #[test]
    fn unregister_removes_only_that_action() {
        let reg = registry();
        reg.register("greet", "greeter", None);
        reg.register("salute", "greeter", None);

        reg.unregister("salute");
        reg.unregister("never-registered");
        assert!(reg.resolve("salute").is_err());
        assert!(reg.resolve("greet").is_ok());
    }
}
