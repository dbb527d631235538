//! Websocket RPC surface used by agents' clients.
//!
//! Clients call named methods and subscribe to named events. Events are
//! registered by the envoy (one per agent wormhole) and pushed to every
//! connection subscribed to them.

pub mod protocol;
pub mod server;

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::RpcError;

pub use server::{RpcServer, RpcServerHandle};

/// Who is on the other end of a websocket connection, from the query
/// parameters it connected with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionContext {
    pub connection_id: u64,
    pub agent_id: Option<String>,
    pub hha_hash: Option<String>,
    pub anonymous: bool,
}

/// A method callable over RPC.
#[async_trait]
pub trait RpcMethod: Send + Sync + 'static {
    async fn call(&self, params: Value, ctx: &ConnectionContext) -> Result<Value, RpcError>;
}

#[async_trait]
impl<F, Fut> RpcMethod for F
where
    F: Fn(Value, ConnectionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
{
    async fn call(&self, params: Value, ctx: &ConnectionContext) -> Result<Value, RpcError> {
        (self)(params, ctx.clone()).await
    }
}

/// Method and event registry that the envoy builds on.
pub trait RpcDispatcher: Send + Sync + 'static {
    /// Register or replace a method.
    fn register_method(&self, name: &str, method: Arc<dyn RpcMethod>);

    /// Register an event clients may subscribe to. Registering the same
    /// name twice is an error.
    fn register_event(&self, name: &str) -> Result<(), RpcError>;

    fn has_event(&self, name: &str) -> bool;

    /// Push `params` to every subscriber of `name`. Returns how many
    /// connections were sent the notification.
    fn emit(&self, name: &str, params: Value) -> Result<usize, RpcError>;

    /// Close every connection opened for `agent_id` and drop the events
    /// registered for it. Returns how many connections were closed.
    fn disconnect_agent(&self, agent_id: &str) -> usize;
}

/// Told about connections as they open and close.
pub trait ConnectionObserver: Send + Sync + 'static {
    fn on_open(&self, ctx: &ConnectionContext);
    fn on_close(&self, ctx: &ConnectionContext);
}
