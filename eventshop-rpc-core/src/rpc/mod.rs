// eventshop-rpc-core/src/rpc/mod.rs
mod caller;
mod envelope;
mod handler;
mod registry;

pub use caller::{MediateRpcCaller, RESPONSE_TIMEOUT_MESSAGE};
pub use envelope::{
    ErrorFactory, ErrorPayload, ErrorRegistry, RpcBase, RpcRequest, RpcResponse,
    CRITICAL_ERROR_TYPE, DEFAULT_TIMEOUT_MS, INTERNAL_ERROR_TYPE, MAX_TIMEOUT_MS, MIN_TIMEOUT_MS,
};
pub use handler::{MediateRpcHandler, CRUD_ACTIONS};
pub use registry::{
    action_fn, ActionFactory, ActionFn, ActionFuture, ActionRegistry, ActionResult,
    ControllerMap, DependencyActionRegistry, DependencyResolver, Responder, RpcController,
};

/// `request.<module>.<action>`
pub fn request_topic(module: &str, action: &str) -> String {
    format!("request.{module}.{action}")
}

/// `response.<module>.<action>@<correlationId>`
pub fn reply_topic(module: &str, action: &str, correlation_id: &str) -> String {
    format!("response.{module}.{action}@{correlation_id}")
}
