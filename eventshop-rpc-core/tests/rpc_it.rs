use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use eventshop_rpc_core::{
    rpc::{
        action_fn, reply_topic, request_topic, ActionFactory, ActionFn, ActionFuture,
        ActionRegistry, ActionResult, ControllerMap, DependencyActionRegistry, MediateRpcCaller,
        MediateRpcHandler, Responder, RpcController, RpcRequest, RpcResponse,
        RESPONSE_TIMEOUT_MESSAGE,
    },
    ConnectionOptions, IncomingMessage, InMemoryConnector, InMemoryExchange, MessageBroker,
    MessageCallback, MessagingError, MinorError, Payload, PublishOptions,
};
use serde_json::{json, Value};
use tokio::sync::mpsc;

struct Billing;

async fn explode(_: Value, _: RpcRequest) -> ActionResult {
    panic!("kaboom")
}

impl RpcController for Billing {
    fn action(&self, name: &str) -> Option<ActionFn> {
        match name {
            "echo" => Some(action_fn(|payload, _| async move {
                Ok(json!({ "text": payload["text"] }))
            })),
            "create" => Some(action_fn(|_, _| async {
                Err(MessagingError::from(MinorError::new("DUPLICATE_UNIQUE_KEY")))
            })),
            "remove" => Some(action_fn(|payload, _| async move {
                Ok(json!({ "deleted": payload["id"] }))
            })),
            // resuelve mas tarde desde otra task
            "slow" => Some(Arc::new(
                |payload: Value, responder: Responder, _: RpcRequest| -> ActionFuture {
                    Box::pin(async move {
                        tokio::spawn(async move {
                            tokio::time::sleep(Duration::from_millis(3500)).await;
                            responder.resolve(payload);
                        });
                        Ok(())
                    })
                },
            )),
            "explode" => Some(action_fn(explode)),
            _ => None,
        }
    }
}

struct Forward(mpsc::UnboundedSender<IncomingMessage>);

#[async_trait]
impl MessageCallback for Forward {
    async fn on_message(&self, message: IncomingMessage) -> Result<(), MessagingError> {
        let _ = self.0.send(message);
        Ok(())
    }
}

struct Rig {
    exchange: InMemoryExchange,
    caller: MediateRpcCaller,
    caller_cnn: Arc<InMemoryConnector>,
    handler_cnn: Arc<InMemoryConnector>,
    handler_errors: Arc<Mutex<Vec<String>>>,
}

async fn rig() -> Rig {
    let exchange = InMemoryExchange::default();

    let handler_cnn = Arc::new(
        InMemoryConnector::connected(
            exchange.clone(),
            ConnectionOptions {
                queue: "ModB".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap(),
    );
    let controllers = ControllerMap::default();
    controllers.bind("billing", Arc::new(Billing));
    let registry = Arc::new(DependencyActionRegistry::new(Arc::new(controllers)));
    let handler = Arc::new(
        MediateRpcHandler::new(handler_cnn.clone(), registry)
            .with_name("ModB")
            .with_module("ModB"),
    );
    let handler_errors = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = Arc::clone(&handler_errors);
        handler.on_error(Arc::new(move |e: &MessagingError| {
            seen.lock().unwrap().push(e.to_string())
        }));
    }
    handler.init().unwrap();
    handler
        .handle(&["echo", "create", "slow", "remove", "explode"], "billing", None)
        .await
        .unwrap();
    let remove: ActionFactory =
        Arc::new(|ctrl: Arc<dyn RpcController>, _: &str| ctrl.action("remove"));
    handler.handle(&["delete"], "billing", Some(remove)).await.unwrap();
    handler.start().await.unwrap();

    let caller_cnn = Arc::new(
        InMemoryConnector::connected(exchange.clone(), ConnectionOptions::default())
            .await
            .unwrap(),
    );
    let caller = MediateRpcCaller::new(caller_cnn.clone(), "ModA");
    caller.init();

    Rig {
        exchange,
        caller,
        caller_cnn,
        handler_cnn,
        handler_errors,
    }
}

#[tokio::test]
async fn echo_round_trip() {
    let rig = rig().await;

    let res = rig
        .caller
        .call("ModB", "echo", json!({ "text": "hi" }))
        .await
        .unwrap();

    assert!(res.is_success);
    assert_eq!(res.payload["text"], "hi");
    assert_eq!(res.from, "ModB");
    assert_eq!(res.to, "ModA");

    assert_eq!(rig.caller.pending_calls(), 0);
    assert!(rig.caller_cnn.subscribed_patterns().is_empty());
    assert!(!rig.caller_cnn.is_listening());
}

#[tokio::test]
async fn minor_error_crosses_the_wire_verbatim() {
    let rig = rig().await;

    let err = rig
        .caller
        .call("ModB", "create", json!({ "name": "dup" }))
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "DUPLICATE_UNIQUE_KEY");
    assert!(matches!(err, MessagingError::Minor(ref m) if m.name == MinorError::NAME));
    assert!(rig.handler_errors.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn slow_action_times_out_once() {
    let rig = rig().await;
    assert!(rig.caller.set_timeout(1000));

    let started = tokio::time::Instant::now();
    let err = rig
        .caller
        .call("ModB", "slow", json!({ "n": 1 }))
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert_eq!(err.to_string(), RESPONSE_TIMEOUT_MESSAGE);
    assert!(err.is_minor());
    assert!(err.is_retryable());
    assert!(elapsed >= Duration::from_millis(1000));
    assert!(elapsed < Duration::from_millis(1100));

    // la respuesta tardia llega a un topic ya desligado
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(rig.caller.pending_calls(), 0);
    assert!(rig.caller_cnn.subscribed_patterns().is_empty());
    assert!(!rig.caller_cnn.is_listening());
}

#[tokio::test]
async fn concurrent_calls_get_their_own_replies() {
    let rig = rig().await;

    let (first, second) = tokio::join!(
        rig.caller.call("ModB", "echo", json!({ "text": "first" })),
        rig.caller.call("ModB", "echo", json!({ "text": "second" })),
    );

    assert_eq!(first.unwrap().payload["text"], "first");
    assert_eq!(second.unwrap().payload["text"], "second");
    assert_eq!(rig.caller.pending_calls(), 0);
}

#[tokio::test]
async fn factory_resolution_matches_direct_lookup() {
    let rig = rig().await;

    let via_factory = rig
        .caller
        .call("ModB", "delete", json!({ "id": 7 }))
        .await
        .unwrap();
    let direct = rig
        .caller
        .call("ModB", "remove", json!({ "id": 7 }))
        .await
        .unwrap();

    assert_eq!(via_factory, direct);
    assert_eq!(via_factory.payload, json!({ "deleted": 7 }));
}

#[tokio::test]
async fn unregistered_action_is_an_internal_error() {
    let rig = rig().await;
    rig.handler_cnn.subscribe("request.ModB.ghost").await.unwrap();

    let err = rig
        .caller
        .call("ModB", "ghost", json!({}))
        .await
        .unwrap_err();

    assert!(matches!(err, MessagingError::Internal(_)), "got {err:?}");
    assert!(!err.is_minor());
    let seen = rig.handler_errors.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].contains("ghost"));
}

#[tokio::test]
async fn panicking_action_is_reported_not_fatal() {
    let rig = rig().await;

    let err = rig
        .caller
        .call("ModB", "explode", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, MessagingError::Internal(ref m) if m.contains("kaboom")));

    // el handler sigue vivo
    let res = rig
        .caller
        .call("ModB", "echo", json!({ "text": "still here" }))
        .await
        .unwrap();
    assert_eq!(res.payload["text"], "still here");
}

#[tokio::test]
async fn call_requires_module_and_action() {
    let rig = rig().await;
    let err = rig.caller.call("", "echo", json!({})).await.unwrap_err();
    assert!(err.is_minor());
    assert_eq!(rig.caller.pending_calls(), 0);
}

#[tokio::test]
async fn broker_failure_is_wrapped_as_minor() {
    let rig = rig().await;
    rig.caller_cnn.disconnect().await.unwrap();

    let err = rig
        .caller
        .call("ModB", "echo", json!({ "text": "hi" }))
        .await
        .unwrap_err();

    assert!(err.is_minor());
    assert!(err.to_string().starts_with("RPC error:"));
    assert_eq!(rig.caller.pending_calls(), 0);
}

#[tokio::test]
async fn misconfigured_handler_fails_fast() {
    let exchange = InMemoryExchange::default();
    let cnn = Arc::new(
        InMemoryConnector::connected(exchange, ConnectionOptions::default())
            .await
            .unwrap(),
    );
    let registry = Arc::new(DependencyActionRegistry::new(Arc::new(
        ControllerMap::default(),
    )));
    let handler = MediateRpcHandler::new(cnn.clone(), registry).with_name("ModB");

    assert!(handler.init().unwrap_err().is_minor());
    assert!(handler.handle(&["echo"], "billing", None).await.is_err());
    assert!(cnn.subscribed_patterns().is_empty());
}

#[tokio::test]
async fn handle_crud_binds_conventional_actions() {
    let exchange = InMemoryExchange::default();
    let cnn = Arc::new(
        InMemoryConnector::connected(exchange, ConnectionOptions::default())
            .await
            .unwrap(),
    );
    let registry = Arc::new(DependencyActionRegistry::new(Arc::new(
        ControllerMap::default(),
    )));
    let handler = Arc::new(
        MediateRpcHandler::new(cnn.clone(), registry)
            .with_name("billing-svc")
            .with_module("Billing"),
    );

    handler.handle_crud("billing", None).await.unwrap();
    let mut topics = cnn.subscribed_patterns();
    topics.sort();
    assert_eq!(
        topics,
        vec![
            "request.Billing.countAll",
            "request.Billing.create",
            "request.Billing.delete",
            "request.Billing.find",
            "request.Billing.patch",
            "request.Billing.update",
        ]
    );

    handler.start().await.unwrap();
    handler.dispose().await.unwrap();
    assert!(cnn.subscribed_patterns().is_empty());
    assert!(!cnn.is_listening());
}

#[tokio::test(start_paused = true)]
async fn each_request_gets_exactly_one_correlated_response() {
    let rig = rig().await;
    let client = InMemoryConnector::connected(rig.exchange.clone(), ConnectionOptions::default())
        .await
        .unwrap();
    let reply_to = reply_topic("ModB", "echo", "corr-1");
    client.subscribe(&reply_to).await.unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    client.listen(Arc::new(Forward(tx)), true).await.unwrap();

    let request = RpcRequest {
        from: "raw-client".into(),
        to: "ModB".into(),
        payload: json!({ "text": "once" }),
    };
    client
        .publish(
            &request_topic("ModB", "echo"),
            Payload::json(&request).unwrap(),
            PublishOptions::default()
                .with_correlation_id("corr-1")
                .with_reply_to(&reply_to),
        )
        .await
        .unwrap();

    let reply = rx.recv().await.unwrap();
    assert_eq!(reply.properties.correlation_id.as_deref(), Some("corr-1"));
    let response: RpcResponse = reply.payload.parse().unwrap();
    assert!(response.is_success);
    assert_eq!(response.to, "raw-client");
    assert_eq!(response.payload["text"], "once");

    // nada mas llega despues
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn dispose_keeps_other_handlers_actions() {
    let exchange = InMemoryExchange::default();
    let controllers = ControllerMap::default();
    controllers.bind("billing", Arc::new(Billing));
    let registry = Arc::new(DependencyActionRegistry::new(Arc::new(controllers)));

    let mut handlers = Vec::new();
    for module in ["Orders", "Invoices"] {
        let cnn = Arc::new(
            InMemoryConnector::connected(exchange.clone(), ConnectionOptions::default())
                .await
                .unwrap(),
        );
        let handler = MediateRpcHandler::new(cnn, registry.clone())
            .with_name(module)
            .with_module(module);
        handlers.push(handler);
    }
    handlers[0].handle(&["echo"], "billing", None).await.unwrap();
    handlers[1].handle(&["remove"], "billing", None).await.unwrap();

    handlers[0].dispose().await.unwrap();
    assert!(registry.resolve("echo").is_err());
    assert!(registry.resolve("remove").is_ok());
}
