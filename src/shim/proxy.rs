//! Unix socket relay between the conductor and the keystore.
//!
//! For every backend connection accepted on the shim socket one keystore
//! connection is opened. Keystore output is relayed unchanged. Backend
//! output is decoded frame by frame so sign-by-public-key requests can be
//! answered here instead of by the keystore.

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use crate::config::ShimConfig;
use crate::error::{FrameError, ShimError};
use crate::shim::codec::{Frame, FrameCodec, RawFrameCodec};
use crate::shim::wire::{
    SIGN_BY_PUBLIC_KEY_REQUEST, SignByPublicKeyRequest, Signature, error_response,
    signature_response,
};

/// Prefix of every error reply synthesized for an intercepted request.
pub const SIGNING_FAILURE_PREFIX: &str = "Failed to fulfill hosted signing request";

/// How an intercepted signing request was settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SigningOutcome {
    /// Reply to the backend with this signature.
    Signed(Signature),
    /// Reply to the backend with an error frame.
    Failed(String),
    /// Let the keystore answer: the original frame is forwarded to it.
    Keystore,
}

/// Answers intercepted sign-by-public-key requests.
#[async_trait]
pub trait SigningHandler: Send + Sync + 'static {
    async fn sign(&self, request: SignByPublicKeyRequest) -> SigningOutcome;
}

/// Handler that sends every request on to the keystore.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeystoreFallback;

#[async_trait]
impl SigningHandler for KeystoreFallback {
    async fn sign(&self, _request: SignByPublicKeyRequest) -> SigningOutcome {
        SigningOutcome::Keystore
    }
}

/// Open backend/keystore connection pairs, tracked only so they can be
/// torn down on shutdown.
#[derive(Default)]
struct ConnectionRegistry {
    next_id: AtomicU64,
    open: Mutex<HashMap<u64, CancellationToken>>,
}

impl ConnectionRegistry {
    fn register(&self) -> (u64, CancellationToken) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        self.open
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, token.clone());
        (id, token)
    }

    fn remove(&self, id: u64) {
        self.open
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    fn len(&self) -> usize {
        self.open.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn close_all(&self) -> usize {
        let open: Vec<CancellationToken> = self
            .open
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, token)| token)
            .collect();
        for token in &open {
            token.cancel();
        }
        open.len()
    }
}

/// A running shim listener.
pub struct Shim {
    socket_path: PathBuf,
    shutdown: CancellationToken,
    connections: Arc<ConnectionRegistry>,
    listener: JoinHandle<()>,
}

impl Shim {
    /// Bind the shim socket and start accepting backend connections.
    ///
    /// A stale socket file left at the path is replaced. The socket is made
    /// world read/writable so the conductor can connect regardless of the
    /// user it runs as.
    pub async fn start(
        config: &ShimConfig,
        handler: Arc<dyn SigningHandler>,
    ) -> Result<Self, ShimError> {
        let socket_path = config.shim_socket.clone();
        let bind_failed = |reason: String| ShimError::BindFailed {
            path: socket_path.display().to_string(),
            reason,
        };

        match tokio::fs::remove_file(&socket_path).await {
            Ok(()) => tracing::debug!(path = %socket_path.display(), "Removed stale shim socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(bind_failed(format!("cannot remove stale socket: {e}"))),
        }

        let listener = UnixListener::bind(&socket_path).map_err(|e| bind_failed(e.to_string()))?;
        std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o666))
            .map_err(|e| bind_failed(format!("cannot set socket permissions: {e}")))?;

        let shutdown = CancellationToken::new();
        let connections = Arc::new(ConnectionRegistry::default());
        let listener = tokio::spawn(accept_loop(
            listener,
            config.keystore_socket.clone(),
            config.max_frame_len,
            handler,
            Arc::clone(&connections),
            shutdown.clone(),
        ));

        tracing::info!(
            shim = %socket_path.display(),
            keystore = %config.keystore_socket.display(),
            "Keystore shim listening"
        );

        Ok(Self {
            socket_path,
            shutdown,
            connections,
            listener,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Number of backend connections currently relayed.
    pub fn open_connections(&self) -> usize {
        self.connections.len()
    }

    /// Close the listener and every open connection, then remove the socket
    /// file. In-flight signing requests are not awaited; their replies are
    /// dropped.
    pub async fn stop(self) {
        tracing::info!(path = %self.socket_path.display(), "Stopping keystore shim");
        self.shutdown.cancel();
        if let Err(e) = self.listener.await {
            tracing::warn!("Shim listener task ended abnormally: {}", e);
        }

        let closed = self.connections.close_all();
        tracing::debug!(closed, "Closed shim connections");

        if let Err(e) = tokio::fs::remove_file(&self.socket_path).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(path = %self.socket_path.display(), "Failed to remove shim socket: {}", e);
        }
    }
}

async fn accept_loop(
    listener: UnixListener,
    keystore_socket: PathBuf,
    max_frame_len: usize,
    handler: Arc<dyn SigningHandler>,
    connections: Arc<ConnectionRegistry>,
    shutdown: CancellationToken,
) {
    loop {
        let backend = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(e) => {
                    tracing::warn!("Shim accept failed: {}", e);
                    continue;
                }
            },
        };

        let (conn_id, cancel) = connections.register();
        tracing::info!(conn_id, "New conductor connection");

        let keystore_socket = keystore_socket.clone();
        let handler = Arc::clone(&handler);
        let connections = Arc::clone(&connections);
        tokio::spawn(async move {
            match UnixStream::connect(&keystore_socket).await {
                Ok(keystore) => {
                    relay_connection(conn_id, backend, keystore, handler, max_frame_len, cancel)
                        .await;
                }
                Err(e) => {
                    let err = ShimError::KeystoreUnavailable {
                        path: keystore_socket.display().to_string(),
                        reason: e.to_string(),
                    };
                    tracing::error!(conn_id, "Dropping conductor connection: {}", err);
                }
            }
            connections.remove(conn_id);
        });
    }
    tracing::debug!("Shim listener closed");
}

/// Relay one backend/keystore pair.
///
/// A leg that ends cleanly only stops being read: replies still owed on the
/// other leg are written, then the write half is shut down. A stream or
/// write error on either leg, or `cancel`, tears the whole pair down
/// without draining.
pub async fn relay_connection<B, K>(
    conn_id: u64,
    backend: B,
    keystore: K,
    handler: Arc<dyn SigningHandler>,
    max_frame_len: usize,
    cancel: CancellationToken,
) where
    B: AsyncRead + AsyncWrite + Send + 'static,
    K: AsyncRead + AsyncWrite + Send + 'static,
{
    let (backend_rx, backend_tx) = tokio::io::split(backend);
    let (keystore_rx, keystore_tx) = tokio::io::split(keystore);

    let (to_backend, backend_writer) = FrameSink::spawn(backend_tx, "conductor", cancel.clone());
    let (to_keystore, keystore_writer) = FrameSink::spawn(keystore_tx, "keystore", cancel.clone());

    let keystore_leg = read_leg(
        conn_id,
        "keystore",
        pipe_keystore(keystore_rx, to_backend.clone(), max_frame_len),
        cancel.clone(),
    );
    let backend_leg = read_leg(
        conn_id,
        "conductor",
        route_backend_frames(
            conn_id,
            backend_rx,
            to_backend,
            to_keystore,
            handler,
            max_frame_len,
        ),
        cancel.clone(),
    );
    tokio::join!(keystore_leg, backend_leg);

    // Writers exit once every sender is gone, including those held by
    // signing requests still in flight.
    let (backend_done, keystore_done) = tokio::join!(backend_writer, keystore_writer);
    for done in [backend_done, keystore_done] {
        if let Err(e) = done {
            tracing::warn!(conn_id, "Shim writer task ended abnormally: {}", e);
        }
    }
    if cancel.is_cancelled() {
        tracing::debug!(conn_id, "Connection torn down");
    } else {
        tracing::debug!(conn_id, "Connection closed by both sides");
    }
}

/// Read one leg until it ends. Dropping `reader` releases the senders it
/// holds; only an error cancels the connection.
async fn read_leg<F, E>(conn_id: u64, leg: &'static str, reader: F, cancel: CancellationToken)
where
    F: Future<Output = Result<(), E>>,
    E: std::fmt::Display,
{
    tokio::select! {
        _ = cancel.cancelled() => {}
        result = reader => match result {
            Ok(()) => tracing::debug!(conn_id, leg, "Stream ended, draining replies"),
            Err(e) => {
                tracing::warn!(conn_id, leg, "Stream failed: {}", e);
                cancel.cancel();
            }
        },
    }
}

/// Ordered writer for one leg of a connection.
///
/// Writes are queued to a single task so concurrent replies never
/// interleave. The queue is drained before the write half is shut down,
/// unless the connection is cancelled first.
#[derive(Clone)]
struct FrameSink {
    tx: mpsc::UnboundedSender<Bytes>,
    leg: &'static str,
}

impl FrameSink {
    fn spawn<W>(mut writer: W, leg: &'static str, cancel: CancellationToken) -> (Self, JoinHandle<()>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        let task = tokio::spawn(async move {
            loop {
                let chunk = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    chunk = rx.recv() => match chunk {
                        Some(chunk) => chunk,
                        None => break,
                    },
                };
                if let Err(e) = writer.write_all(&chunk).await {
                    tracing::debug!(leg, "Write failed, closing connection: {}", e);
                    cancel.cancel();
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });
        (Self { tx, leg }, task)
    }

    fn send(&self, chunk: Bytes) {
        if self.tx.send(chunk).is_err() {
            tracing::trace!(leg = self.leg, "Dropped write to closed stream");
        }
    }
}

async fn pipe_keystore<R>(
    reader: R,
    to_backend: FrameSink,
    max_frame_len: usize,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut chunks = FramedRead::new(reader, RawFrameCodec::new(max_frame_len));
    while let Some(chunk) = chunks.next().await {
        to_backend.send(chunk?);
    }
    Ok(())
}

async fn route_backend_frames<R>(
    conn_id: u64,
    reader: R,
    to_backend: FrameSink,
    to_keystore: FrameSink,
    handler: Arc<dyn SigningHandler>,
    max_frame_len: usize,
) -> Result<(), FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut frames = FramedRead::new(reader, FrameCodec::new(max_frame_len));
    while let Some(frame) = frames.next().await {
        let frame = frame?;
        if frame.wire_type != SIGN_BY_PUBLIC_KEY_REQUEST {
            tracing::trace!(conn_id, wire_type = frame.wire_type, "Forwarding frame to keystore");
            to_keystore.send(frame.into_raw());
            continue;
        }

        match SignByPublicKeyRequest::decode(&frame) {
            Ok(request) => {
                tracing::info!(
                    conn_id,
                    message_id = frame.message_id,
                    "Intercepted sign by public key"
                );
                tokio::spawn(fulfil_signing_request(
                    frame,
                    request,
                    Arc::clone(&handler),
                    to_backend.clone(),
                    to_keystore.clone(),
                ));
            }
            Err(e) => {
                tracing::warn!(conn_id, message_id = frame.message_id, "Malformed signing request: {}", e);
                let reply = error_response(frame.message_id, &format!("{SIGNING_FAILURE_PREFIX}: {e}"));
                send_reply(&to_backend, frame.message_id, reply);
            }
        }
    }
    Ok(())
}

async fn fulfil_signing_request(
    frame: Frame,
    request: SignByPublicKeyRequest,
    handler: Arc<dyn SigningHandler>,
    to_backend: FrameSink,
    to_keystore: FrameSink,
) {
    let message_id = frame.message_id;
    match handler.sign(request).await {
        SigningOutcome::Signed(signature) => {
            tracing::debug!(message_id, "Injecting signature response");
            send_reply(&to_backend, message_id, signature_response(message_id, &signature));
        }
        SigningOutcome::Failed(reason) => {
            tracing::info!(message_id, "Hosted signing failed: {}", reason);
            let reply = error_response(message_id, &format!("{SIGNING_FAILURE_PREFIX}: {reason}"));
            send_reply(&to_backend, message_id, reply);
        }
        SigningOutcome::Keystore => {
            tracing::debug!(message_id, "Routing signing request to keystore");
            to_keystore.send(frame.into_raw());
        }
    }
}

fn send_reply(to_backend: &FrameSink, message_id: u64, reply: Result<Frame, FrameError>) {
    match reply {
        Ok(frame) => to_backend.send(frame.into_raw()),
        Err(e) => tracing::warn!(message_id, "Dropping synthesized reply: {}", e),
    }
}
