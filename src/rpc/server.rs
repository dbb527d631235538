//! Axum websocket server for the RPC surface.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use axum::{
    Router,
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::error::RpcError;
use crate::rpc::protocol::{
    self, EVENT_INVALID, EVENT_OK, RpcRequest, RpcResponse, SUBSCRIBE, UNSUBSCRIBE,
};
use crate::rpc::{ConnectionContext, ConnectionObserver, RpcDispatcher, RpcMethod};

/// Query parameters a client connects with.
#[derive(Debug, Default, Deserialize)]
struct ConnectionParams {
    agent_id: Option<String>,
    hha_hash: Option<String>,
    anonymous: Option<String>,
}

struct Connection {
    ctx: ConnectionContext,
    outgoing: mpsc::UnboundedSender<Message>,
    close: CancellationToken,
}

#[derive(Default)]
struct Registry {
    connections: HashMap<u64, Connection>,
    /// Registered events and the connections subscribed to each.
    events: HashMap<String, HashSet<u64>>,
}

struct Inner {
    namespace: String,
    methods: RwLock<HashMap<String, Arc<dyn RpcMethod>>>,
    registry: Mutex<Registry>,
    observer: RwLock<Option<Arc<dyn ConnectionObserver>>>,
    next_connection_id: AtomicU64,
}

impl Inner {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn observer(&self) -> Option<Arc<dyn ConnectionObserver>> {
        self.observer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn method(&self, name: &str) -> Option<Arc<dyn RpcMethod>> {
        self.methods
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }
}

/// RPC server. Cheap to clone; clones share registrations and connections.
#[derive(Clone)]
pub struct RpcServer {
    inner: Arc<Inner>,
}

/// A running server. Dropping it leaves the server running.
pub struct RpcServerHandle {
    local_addr: SocketAddr,
    server: RpcServer,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl RpcServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Close every connection and stop accepting new ones.
    pub async fn shutdown(mut self) {
        let closed = self.server.close_all();
        tracing::debug!(closed, "Closed RPC connections");
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Err(e) = self.task.await {
            tracing::warn!("RPC server task failed: {}", e);
        }
    }
}

impl RpcServer {
    /// Create a server answering on `namespace` (e.g. `/hosting/`).
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                namespace: namespace.into(),
                methods: RwLock::new(HashMap::new()),
                registry: Mutex::new(Registry::default()),
                observer: RwLock::new(None),
                next_connection_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    pub fn set_observer(&self, observer: Arc<dyn ConnectionObserver>) {
        *self
            .inner
            .observer
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(observer);
    }

    pub fn connection_count(&self) -> usize {
        self.inner.registry().connections.len()
    }

    /// Routes for the websocket endpoint, with and without a trailing slash.
    pub fn router(&self) -> Router {
        let namespace = self.inner.namespace.clone();
        let mut router = Router::new().route(&namespace, get(ws_handler));
        let trimmed = namespace.trim_end_matches('/');
        if !trimmed.is_empty() && trimmed != namespace {
            router = router.route(trimmed, get(ws_handler));
        }
        router
            .layer(TraceLayer::new_for_http())
            .with_state(Arc::clone(&self.inner))
    }

    /// Bind `addr` and serve in a background task.
    ///
    /// Returns once the listener is bound; the handle reports the actual
    /// address (useful when binding to port 0).
    pub async fn start(&self, addr: SocketAddr) -> Result<RpcServerHandle, RpcError> {
        let startup_failed = |reason: String| RpcError::StartupFailed {
            addr: addr.to_string(),
            reason,
        };
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| startup_failed(e.to_string()))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| startup_failed(e.to_string()))?;

        let app = self.router();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                    tracing::info!("RPC server shutting down");
                })
                .await
            {
                tracing::error!("RPC server error: {}", e);
            }
        });

        tracing::info!(
            addr = %local_addr,
            namespace = %self.inner.namespace,
            "RPC server listening"
        );
        Ok(RpcServerHandle {
            local_addr,
            server: self.clone(),
            shutdown_tx: Some(shutdown_tx),
            task,
        })
    }

    fn close_all(&self) -> usize {
        let registry = self.inner.registry();
        for conn in registry.connections.values() {
            conn.close.cancel();
        }
        registry.connections.len()
    }
}

impl RpcDispatcher for RpcServer {
    fn register_method(&self, name: &str, method: Arc<dyn RpcMethod>) {
        let replaced = self
            .inner
            .methods
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), method)
            .is_some();
        tracing::debug!(method = name, replaced, "Registered RPC method");
    }

    fn register_event(&self, name: &str) -> Result<(), RpcError> {
        let mut registry = self.inner.registry();
        if registry.events.contains_key(name) {
            return Err(RpcError::EventAlreadyRegistered(name.to_string()));
        }
        registry.events.insert(name.to_string(), HashSet::new());
        tracing::debug!(event = name, "Registered RPC event");
        Ok(())
    }

    fn has_event(&self, name: &str) -> bool {
        self.inner.registry().events.contains_key(name)
    }

    fn emit(&self, name: &str, params: Value) -> Result<usize, RpcError> {
        let registry = self.inner.registry();
        let subscribers = registry
            .events
            .get(name)
            .ok_or_else(|| RpcError::UnknownEvent(name.to_string()))?;
        let text = protocol::notification(name, &params);
        let mut sent = 0;
        for id in subscribers {
            if let Some(conn) = registry.connections.get(id)
                && conn.outgoing.send(Message::Text(text.clone().into())).is_ok()
            {
                sent += 1;
            }
        }
        tracing::debug!(event = name, sent, "Emitted RPC event");
        Ok(sent)
    }

    fn disconnect_agent(&self, agent_id: &str) -> usize {
        let mut registry = self.inner.registry();
        let prefix = format!("{agent_id}/");
        registry.events.retain(|name, _| !name.starts_with(&prefix));

        let mut closed = 0;
        for conn in registry.connections.values() {
            if conn.ctx.agent_id.as_deref() == Some(agent_id) {
                conn.close.cancel();
                closed += 1;
            }
        }
        tracing::info!(agent = agent_id, closed, "Disconnected agent");
        closed
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectionParams>,
    State(inner): State<Arc<Inner>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, params, inner))
}

async fn handle_connection(socket: WebSocket, params: ConnectionParams, inner: Arc<Inner>) {
    let ctx = ConnectionContext {
        connection_id: inner.next_connection_id.fetch_add(1, Ordering::Relaxed),
        agent_id: params.agent_id,
        hha_hash: params.hha_hash,
        anonymous: params.anonymous.as_deref() == Some("true"),
    };
    let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
    let close = CancellationToken::new();
    inner.registry().connections.insert(
        ctx.connection_id,
        Connection {
            ctx: ctx.clone(),
            outgoing: outgoing_tx.clone(),
            close: close.clone(),
        },
    );
    tracing::info!(
        connection = ctx.connection_id,
        agent = ctx.agent_id.as_deref().unwrap_or("-"),
        hha_hash = ctx.hha_hash.as_deref().unwrap_or("-"),
        anonymous = ctx.anonymous,
        "RPC connection opened"
    );
    if let Some(observer) = inner.observer() {
        observer.on_open(&ctx);
    }

    let (mut sink, mut stream) = socket.split();
    let writer_close = close.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = writer_close.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
                message = outgoing_rx.recv() => match message {
                    Some(message) => {
                        if sink.send(message).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
    });

    loop {
        tokio::select! {
            _ = close.cancelled() => break,
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let inner = Arc::clone(&inner);
                    let ctx = ctx.clone();
                    let reply_tx = outgoing_tx.clone();
                    // Handlers may wait on other messages from this same
                    // connection, so each request runs on its own task.
                    tokio::spawn(async move {
                        if let Some(reply) = handle_text(&inner, &ctx, text.as_str()).await {
                            let _ = reply_tx.send(Message::Text(reply.into()));
                        }
                    });
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(connection = ctx.connection_id, "RPC socket error: {}", e);
                    break;
                }
            },
        }
    }

    {
        let mut registry = inner.registry();
        registry.connections.remove(&ctx.connection_id);
        for subscribers in registry.events.values_mut() {
            subscribers.remove(&ctx.connection_id);
        }
    }
    close.cancel();
    let _ = writer.await;
    if let Some(observer) = inner.observer() {
        observer.on_close(&ctx);
    }
    tracing::info!(
        connection = ctx.connection_id,
        agent = ctx.agent_id.as_deref().unwrap_or("-"),
        "RPC connection closed"
    );
}

/// Run one client message. Returns the reply text, if the message wants one.
async fn handle_text(inner: &Inner, ctx: &ConnectionContext, text: &str) -> Option<String> {
    let request: RpcRequest = match serde_json::from_str(text) {
        Ok(request) => request,
        Err(e) => {
            tracing::debug!(connection = ctx.connection_id, "Unparsable RPC message: {}", e);
            return Some(RpcResponse::error(Value::Null, &RpcError::Parse(e.to_string())).to_text());
        }
    };
    tracing::debug!(
        connection = ctx.connection_id,
        method = %request.method,
        "RPC request"
    );

    let result = match request.method.as_str() {
        SUBSCRIBE => subscribe(inner, ctx.connection_id, &request.params, true),
        UNSUBSCRIBE => subscribe(inner, ctx.connection_id, &request.params, false),
        name => match inner.method(name) {
            Some(method) => method.call(request.params, ctx).await,
            None => Err(RpcError::MethodNotFound(name.to_string())),
        },
    };
    if let Err(e) = &result {
        tracing::warn!(method = %request.method, "RPC request failed: {}", e);
    }

    let id = request.id?;
    Some(match result {
        Ok(value) => RpcResponse::result(id, value),
        Err(e) => RpcResponse::error(id, &e),
    }
    .to_text())
}

fn subscribe(inner: &Inner, connection_id: u64, params: &Value, on: bool) -> Result<Value, RpcError> {
    let names = protocol::event_names(params)?;
    let mut registry = inner.registry();
    let mut results = Map::new();
    for name in names {
        let status = match registry.events.get_mut(&name) {
            Some(subscribers) => {
                if on {
                    subscribers.insert(connection_id);
                } else {
                    subscribers.remove(&connection_id);
                }
                EVENT_OK
            }
            None => EVENT_INVALID,
        };
        results.insert(name, Value::String(status.to_string()));
    }
    Ok(Value::Object(results))
}
