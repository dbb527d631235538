//! Websocket client for the conductor interfaces.
//!
//! Requests are `{"id", "method", "args"}` text frames; replies carry the
//! same `id` with either `result` or `error`. Each interface gets one lazily
//! opened socket that is re-opened on the next call after it drops.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::backend::{Backend, BackendTarget, classify_remote};
use crate::config::ConductorConfig;
use crate::error::BackendError;

type ReplySlot = oneshot::Sender<Result<Value, String>>;
type PendingCalls = Mutex<HashMap<u64, ReplySlot>>;

/// Client for all four conductor interfaces.
pub struct ConductorClient {
    connections: HashMap<BackendTarget, ConductorConnection>,
}

impl ConductorClient {
    pub fn new(config: &ConductorConfig) -> Self {
        let connections = BackendTarget::ALL
            .into_iter()
            .map(|target| {
                (
                    target,
                    ConductorConnection {
                        target,
                        url: config.url(target),
                        reconnect_interval: config.reconnect_interval,
                        max_reconnects: config.max_reconnects,
                        outgoing: tokio::sync::Mutex::new(None),
                        pending: Arc::new(Mutex::new(HashMap::new())),
                        next_id: AtomicU64::new(0),
                    },
                )
            })
            .collect();
        Self { connections }
    }

    fn connection(&self, target: BackendTarget) -> Result<&ConductorConnection, BackendError> {
        self.connections
            .get(&target)
            .ok_or_else(|| BackendError::NotConnected {
                target: target.to_string(),
                reason: "no interface configured".to_string(),
            })
    }

    /// Open every interface, logging the ones that cannot be reached.
    pub async fn connect_all(&self, timeout: Duration) {
        let attempts = self.connections.values().map(|conn| async move {
            match tokio::time::timeout(timeout, conn.sender()).await {
                Ok(Ok(_)) => {
                    tracing::info!(target = %conn.target, url = %conn.url, "Conductor client connected")
                }
                Ok(Err(e)) => tracing::error!(target = %conn.target, "Conductor client failed to connect: {}", e),
                Err(_) => tracing::error!(
                    target = %conn.target,
                    "Conductor client did not connect within {:?}",
                    timeout
                ),
            }
        });
        futures::future::join_all(attempts).await;
    }

    /// Close every open socket. Calls still waiting fail.
    pub async fn close(&self) {
        for conn in self.connections.values() {
            if conn.outgoing.lock().await.take().is_some() {
                tracing::debug!(target = %conn.target, "Closed conductor client");
            }
        }
    }
}

#[async_trait]
impl Backend for ConductorClient {
    async fn call(
        &self,
        target: BackendTarget,
        method: &str,
        args: Value,
        timeout: Duration,
    ) -> Result<Value, BackendError> {
        let conn = self.connection(target)?;
        tracing::debug!(%target, method, "Calling conductor");
        match tokio::time::timeout(timeout, conn.call(method, args)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(%target, method, "Conductor call timed out after {:?}", timeout);
                Err(BackendError::Timeout {
                    target: target.to_string(),
                    method: method.to_string(),
                    timeout,
                })
            }
        }
    }
}

struct ConductorConnection {
    target: BackendTarget,
    url: String,
    reconnect_interval: Duration,
    max_reconnects: u32,
    outgoing: tokio::sync::Mutex<Option<mpsc::UnboundedSender<Message>>>,
    pending: Arc<PendingCalls>,
    next_id: AtomicU64,
}

/// Drops the reply slot of a call that was abandoned (e.g. timed out).
struct PendingGuard<'a> {
    pending: &'a PendingCalls,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

impl ConductorConnection {
    /// Writer for the open socket, connecting first if needed.
    async fn sender(&self) -> Result<mpsc::UnboundedSender<Message>, BackendError> {
        let mut outgoing = self.outgoing.lock().await;
        if let Some(tx) = outgoing.as_ref()
            && !tx.is_closed()
        {
            return Ok(tx.clone());
        }

        let mut attempt: u32 = 0;
        let stream = loop {
            match tokio_tungstenite::connect_async(self.url.as_str()).await {
                Ok((stream, _response)) => break stream,
                Err(e) if attempt >= self.max_reconnects => {
                    return Err(BackendError::NotConnected {
                        target: self.target.to_string(),
                        reason: format!("{} (after {} attempts)", e, attempt + 1),
                    });
                }
                Err(e) => {
                    attempt += 1;
                    tracing::debug!(
                        target = %self.target,
                        attempt,
                        "Conductor connection failed, retrying in {:?}: {}",
                        self.reconnect_interval,
                        e
                    );
                    tokio::time::sleep(self.reconnect_interval).await;
                }
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_socket(self.target, stream, rx, Arc::clone(&self.pending)));
        *outgoing = Some(tx.clone());
        Ok(tx)
    }

    async fn call(&self, method: &str, args: Value) -> Result<Value, BackendError> {
        let tx = self.sender().await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, reply);
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };

        let request = json!({ "id": id, "method": method, "args": args });
        if tx.send(Message::Text(request.to_string().into())).is_err() {
            return Err(self.closed());
        }

        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(classify_remote(self.target, method, message)),
            Err(_) => Err(self.closed()),
        }
    }

    fn closed(&self) -> BackendError {
        BackendError::NotConnected {
            target: self.target.to_string(),
            reason: "connection closed before reply".to_string(),
        }
    }
}

async fn run_socket(
    target: BackendTarget,
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut outgoing: mpsc::UnboundedReceiver<Message>,
    pending: Arc<PendingCalls>,
) {
    let (mut sink, mut source) = stream.split();
    loop {
        tokio::select! {
            message = outgoing.recv() => match message {
                Some(message) => {
                    if let Err(e) = sink.send(message).await {
                        tracing::warn!(%target, "Conductor socket write failed: {}", e);
                        break;
                    }
                }
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            incoming = source.next() => match incoming {
                Some(Ok(Message::Text(text))) => deliver_reply(target, text.as_str(), &pending),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!(%target, "Conductor socket read failed: {}", e);
                    break;
                }
            },
        }
    }

    // Dropping the reply slots fails every call still waiting on this socket.
    let abandoned = {
        let mut pending = pending.lock().unwrap_or_else(PoisonError::into_inner);
        let n = pending.len();
        pending.clear();
        n
    };
    tracing::info!(%target, abandoned, "Conductor socket closed");
}

fn deliver_reply(target: BackendTarget, text: &str, pending: &PendingCalls) {
    let reply: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(%target, "Ignoring unparsable conductor message: {}", e);
            return;
        }
    };
    let Some(id) = reply.get("id").and_then(Value::as_u64) else {
        tracing::debug!(%target, "Ignoring conductor message without id");
        return;
    };
    let Some(slot) = pending
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&id)
    else {
        tracing::debug!(%target, id, "Reply for unknown call");
        return;
    };

    let outcome = match reply.get("error") {
        Some(error) if !error.is_null() => Err(error_text(error)),
        _ => Ok(reply.get("result").cloned().unwrap_or(Value::Null)),
    };
    let _ = slot.send(outcome);
}

fn error_text(error: &Value) -> String {
    match error {
        Value::String(s) => s.clone(),
        Value::Object(obj) => {
            let message = obj.get("message").and_then(Value::as_str).unwrap_or("");
            match obj.get("data") {
                Some(Value::String(data)) => format!("{message}: {data}"),
                Some(data) if !data.is_null() => format!("{message}: {data}"),
                _ => message.to_string(),
            }
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Minimal conductor: `echo` returns its args, `moved` and `unsigned`
    /// fail, `hang` never answers.
    async fn fake_conductor() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                    while let Some(Ok(Message::Text(text))) = ws.next().await {
                        let req: Value = serde_json::from_str(text.as_str()).unwrap();
                        let id = req["id"].clone();
                        let reply = match req["method"].as_str().unwrap() {
                            "echo" => json!({ "id": id, "result": req["args"] }),
                            "moved" => json!({ "id": id, "error": { "message": "Internal error", "data": "source chain head has moved" } }),
                            "unsigned" => json!({ "id": id, "error": "response from service is not success" }),
                            _ => continue,
                        };
                        ws.send(Message::Text(reply.to_string().into())).await.unwrap();
                    }
                });
            }
        });
        port
    }

    fn config(port: u16) -> ConductorConfig {
        ConductorConfig {
            host: "127.0.0.1".to_string(),
            admin_port: port,
            service_port: port,
            internal_port: port,
            hosted_port: port,
            call_timeout: Duration::from_secs(5),
            reconnect_interval: Duration::from_millis(10),
            max_reconnects: 2,
        }
    }

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn call_returns_result() {
        let client = ConductorClient::new(&config(fake_conductor().await));
        let value = client
            .call(BackendTarget::Hosted, "echo", json!({ "x": 1 }), TIMEOUT)
            .await
            .unwrap();
        assert_eq!(value, json!({ "x": 1 }));

        // Second call reuses the socket.
        let value = client
            .call(BackendTarget::Hosted, "echo", json!([2]), TIMEOUT)
            .await
            .unwrap();
        assert_eq!(value, json!([2]));
    }

    #[tokio::test]
    async fn remote_errors_are_classified() {
        let client = ConductorClient::new(&config(fake_conductor().await));
        let err = client
            .call(BackendTarget::Service, "moved", Value::Null, TIMEOUT)
            .await
            .unwrap_err();
        assert!(err.is_head_moved(), "{err}");

        let err = client
            .call(BackendTarget::Hosted, "unsigned", Value::Null, TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::SigningFailed));
    }

    #[tokio::test]
    async fn unanswered_call_times_out() {
        let client = ConductorClient::new(&config(fake_conductor().await));
        let err = client
            .call(BackendTarget::Admin, "hang", Value::Null, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Timeout { .. }));
        let conn = client.connection(BackendTarget::Admin).unwrap();
        assert!(conn.pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unreachable_conductor_gives_up_after_retries() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = ConductorClient::new(&config(port));
        let err = client
            .call(BackendTarget::Internal, "echo", Value::Null, TIMEOUT)
            .await
            .unwrap_err();
        match err {
            BackendError::NotConnected { reason, .. } => assert!(reason.contains("after 3 attempts")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn error_text_joins_message_and_data() {
        assert_eq!(
            error_text(&json!({ "message": "Internal", "data": "boom" })),
            "Internal: boom"
        );
        assert_eq!(error_text(&json!("plain")), "plain");
    }
}
