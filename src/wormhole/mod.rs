//! Delegated signing.
//!
//! A signing request intercepted by the shim is sent to the agent that owns
//! the key over that agent's control channel, and the agent answers
//! out of band with [`Wormhole::respond`]. Every request has its own timer;
//! whichever of answer and timer comes first settles it, the other becomes
//! a no-op. Agents that let too many requests in a row time out are
//! disconnected.

pub mod signer;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::WormholeConfig;
use crate::error::SigningError;
use crate::shim::proxy::{SigningHandler, SigningOutcome};
use crate::shim::wire::{SignByPublicKeyRequest, Signature};

pub use signer::{SignerKey, decode_signature, encode_multibase, encode_signature};

/// Where signing requests for a given agent can be delivered.
pub trait SigningChannel: Send + Sync + 'static {
    /// Whether the agent has a live control channel.
    fn is_reachable(&self, signer: &SignerKey) -> bool;

    /// Whether the agent is connected anonymously.
    fn is_anonymous(&self, signer: &SignerKey) -> bool;

    /// Deliver `[request_id, message]` to the agent.
    fn dispatch(&self, signer: &SignerKey, request_id: u64, message: &[u8]) -> Result<(), String>;
}

/// Invoked when an agent reaches the consecutive timeout threshold.
pub trait DisconnectHook: Send + Sync + 'static {
    fn disconnect(&self, signer: &SignerKey);
}

/// How a signing request will be answered.
#[derive(Debug)]
pub enum SigningRoute {
    /// The agent was asked; await the result.
    Pending(PendingSignature),
    /// The agent is not connected; the local keystore should sign.
    Keystore,
}

/// Result of a dispatched signing request. Resolves exactly once.
#[derive(Debug)]
pub struct PendingSignature {
    request_id: u64,
    rx: oneshot::Receiver<Result<Signature, SigningError>>,
}

impl PendingSignature {
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    pub async fn wait(self) -> Result<Signature, SigningError> {
        let request_id = self.request_id;
        self.rx
            .await
            .unwrap_or(Err(SigningError::Abandoned { request_id }))
    }
}

struct PendingSigningRequest {
    signer: SignerKey,
    message: Bytes,
    created_at: Instant,
    reply: oneshot::Sender<Result<Signature, SigningError>>,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct State {
    pending: HashMap<u64, PendingSigningRequest>,
    timeouts: HashMap<SignerKey, u32>,
}

/// State shared with the per-request timer tasks.
struct Shared {
    state: Mutex<State>,
    disconnect: Arc<dyn DisconnectHook>,
    max_consecutive_timeouts: u32,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn expire(&self, request_id: u64, timeout: Duration) {
        let (signer, disconnect) = {
            let mut state = self.lock();
            let Some(request) = state.pending.remove(&request_id) else {
                return;
            };
            tracing::error!(
                request_id,
                signer = %request.signer,
                bytes = request.message.len(),
                "Failed during signing request with timeout ({:?})",
                timeout
            );
            let _ = request.reply.send(Err(SigningError::Timeout {
                request_id,
                timeout,
            }));

            let count = state.timeouts.entry(request.signer).or_insert(0);
            *count += 1;
            let disconnect = *count >= self.max_consecutive_timeouts;
            if disconnect {
                state.timeouts.remove(&request.signer);
            }
            (request.signer, disconnect)
        };

        if disconnect {
            tracing::warn!(
                signer = %signer,
                threshold = self.max_consecutive_timeouts,
                "Agent missed too many signing requests, forcing disconnect"
            );
            self.disconnect.disconnect(&signer);
        }
    }
}

/// Correlates signing requests with answers from remote agents.
pub struct Wormhole {
    shared: Arc<Shared>,
    next_request_id: AtomicU64,
    channel: Arc<dyn SigningChannel>,
    default_timeout: Duration,
}

impl Wormhole {
    pub fn new(
        config: &WormholeConfig,
        channel: Arc<dyn SigningChannel>,
        disconnect: Arc<dyn DisconnectHook>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                disconnect,
                max_consecutive_timeouts: config.max_consecutive_timeouts.max(1),
            }),
            next_request_id: AtomicU64::new(0),
            channel,
            default_timeout: config.timeout,
        }
    }

    /// Ask `signer` to sign `message`.
    ///
    /// Agents without a control channel are routed to the keystore unless
    /// they are anonymous, in which case nobody can sign for them.
    pub fn request_signature(
        &self,
        signer: &SignerKey,
        message: Bytes,
        timeout: Duration,
    ) -> Result<SigningRoute, SigningError> {
        if !self.channel.is_reachable(signer) {
            if self.channel.is_anonymous(signer) {
                tracing::warn!(signer = %signer, "Signing requested for anonymous agent");
                return Err(SigningError::AnonymousSigner {
                    agent: signer.to_string(),
                });
            }
            tracing::debug!(signer = %signer, "Agent has no wormhole, using keystore");
            return Ok(SigningRoute::Keystore);
        }

        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = oneshot::channel();
        {
            let mut state = self.shared.lock();
            let shared = Arc::clone(&self.shared);
            let timer = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                shared.expire(request_id, timeout);
            });
            state.pending.insert(
                request_id,
                PendingSigningRequest {
                    signer: *signer,
                    message: message.clone(),
                    created_at: Instant::now(),
                    reply,
                    timer,
                },
            );
        }

        if let Err(reason) = self.channel.dispatch(signer, request_id, &message) {
            tracing::warn!(request_id, signer = %signer, "Failed to send signing request: {}", reason);
            if let Some(request) = self.shared.lock().pending.remove(&request_id) {
                request.timer.abort();
                let _ = request
                    .reply
                    .send(Err(SigningError::Dispatch { request_id, reason }));
            }
        } else {
            tracing::info!(request_id, signer = %signer, "Sent signing request");
        }

        Ok(SigningRoute::Pending(PendingSignature { request_id, rx }))
    }

    /// Settle a request with the agent's signature.
    ///
    /// Returns `false` if the request is unknown or already settled.
    pub fn respond(&self, request_id: u64, signature: Signature) -> bool {
        let mut state = self.shared.lock();
        let Some(request) = state.pending.remove(&request_id) else {
            tracing::debug!(request_id, "Ignoring answer for settled signing request");
            return false;
        };
        request.timer.abort();
        state.timeouts.remove(&request.signer);
        tracing::info!(
            request_id,
            signer = %request.signer,
            elapsed_ms = request.created_at.elapsed().as_millis() as u64,
            "Received signature"
        );
        let _ = request.reply.send(Ok(signature));
        true
    }

    /// Consecutive timeouts currently counted against `signer`.
    pub fn timeout_count(&self, signer: &SignerKey) -> u32 {
        self.shared.lock().timeouts.get(signer).copied().unwrap_or(0)
    }

    pub fn pending_count(&self) -> usize {
        self.shared.lock().pending.len()
    }
}

#[async_trait]
impl SigningHandler for Wormhole {
    async fn sign(&self, request: SignByPublicKeyRequest) -> SigningOutcome {
        let signer = SignerKey::from(request.public_key);
        match self.request_signature(&signer, request.message, self.default_timeout) {
            Ok(SigningRoute::Keystore) => SigningOutcome::Keystore,
            Ok(SigningRoute::Pending(pending)) => match pending.wait().await {
                Ok(signature) => SigningOutcome::Signed(signature),
                Err(e) => SigningOutcome::Failed(e.to_string()),
            },
            Err(e) => SigningOutcome::Failed(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shim::wire::{PUBLIC_KEY_LEN, PublicKey};
    use pretty_assertions::assert_eq;
    use std::collections::HashSet;

    #[derive(Default)]
    struct FakeChannel {
        reachable: Mutex<HashSet<SignerKey>>,
        anonymous: Mutex<HashSet<SignerKey>>,
        dispatched: Mutex<Vec<(SignerKey, u64, Vec<u8>)>>,
        fail_dispatch: Mutex<bool>,
    }

    impl SigningChannel for FakeChannel {
        fn is_reachable(&self, signer: &SignerKey) -> bool {
            self.reachable.lock().unwrap().contains(signer)
        }

        fn is_anonymous(&self, signer: &SignerKey) -> bool {
            self.anonymous.lock().unwrap().contains(signer)
        }

        fn dispatch(&self, signer: &SignerKey, request_id: u64, message: &[u8]) -> Result<(), String> {
            if *self.fail_dispatch.lock().unwrap() {
                return Err("socket gone".into());
            }
            self.dispatched
                .lock()
                .unwrap()
                .push((*signer, request_id, message.to_vec()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingDisconnect {
        calls: Mutex<Vec<SignerKey>>,
    }

    impl DisconnectHook for RecordingDisconnect {
        fn disconnect(&self, signer: &SignerKey) {
            self.calls.lock().unwrap().push(*signer);
        }
    }

    fn signer(byte: u8) -> SignerKey {
        SignerKey::new(PublicKey([byte; PUBLIC_KEY_LEN]))
    }

    fn setup() -> (Wormhole, Arc<FakeChannel>, Arc<RecordingDisconnect>) {
        let channel = Arc::new(FakeChannel::default());
        let disconnect = Arc::new(RecordingDisconnect::default());
        let config = WormholeConfig {
            timeout: Duration::from_millis(100),
            max_consecutive_timeouts: 3,
        };
        let wormhole = Wormhole::new(&config, channel.clone(), disconnect.clone());
        (wormhole, channel, disconnect)
    }

    fn pending(route: SigningRoute) -> PendingSignature {
        match route {
            SigningRoute::Pending(p) => p,
            SigningRoute::Keystore => panic!("expected a pending request"),
        }
    }

    async fn time_out_once(wormhole: &Wormhole, key: &SignerKey) {
        let p = pending(
            wormhole
                .request_signature(key, Bytes::from_static(b"m"), Duration::from_millis(100))
                .unwrap(),
        );
        assert!(matches!(p.wait().await, Err(SigningError::Timeout { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_agent_falls_back_to_keystore_without_timer() {
        let (wormhole, channel, _) = setup();
        let route = wormhole
            .request_signature(&signer(1), Bytes::from_static(b"m"), Duration::from_millis(100))
            .unwrap();
        assert!(matches!(route, SigningRoute::Keystore));
        assert_eq!(wormhole.pending_count(), 0);
        assert!(channel.dispatched.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn anonymous_agent_cannot_sign() {
        let (wormhole, channel, _) = setup();
        channel.anonymous.lock().unwrap().insert(signer(2));
        let err = wormhole
            .request_signature(&signer(2), Bytes::from_static(b"m"), Duration::from_millis(100))
            .unwrap_err();
        assert!(matches!(err, SigningError::AnonymousSigner { .. }));
        assert_eq!(wormhole.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn answer_settles_request_and_resets_counter() {
        let (wormhole, channel, _) = setup();
        let key = signer(3);
        channel.reachable.lock().unwrap().insert(key);

        time_out_once(&wormhole, &key).await;
        assert_eq!(wormhole.timeout_count(&key), 1);

        let p = pending(
            wormhole
                .request_signature(&key, Bytes::from_static(b"hello"), Duration::from_millis(100))
                .unwrap(),
        );
        let (_, id, message) = channel.dispatched.lock().unwrap().last().cloned().unwrap();
        assert_eq!(id, p.request_id());
        assert_eq!(message, b"hello".to_vec());

        assert!(wormhole.respond(id, Signature([4u8; 64])));
        assert_eq!(p.wait().await.unwrap(), Signature([4u8; 64]));
        assert_eq!(wormhole.timeout_count(&key), 0);
        assert_eq!(wormhole.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fires_at_deadline() {
        let (wormhole, channel, _) = setup();
        let key = signer(4);
        channel.reachable.lock().unwrap().insert(key);

        let start = Instant::now();
        time_out_once(&wormhole, &key).await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(100), "fired early: {elapsed:?}");
        assert!(elapsed <= Duration::from_millis(101), "fired late: {elapsed:?}");
        assert_eq!(wormhole.timeout_count(&key), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn late_answer_is_ignored() {
        let (wormhole, channel, _) = setup();
        let key = signer(5);
        channel.reachable.lock().unwrap().insert(key);

        time_out_once(&wormhole, &key).await;
        let (_, id, _) = channel.dispatched.lock().unwrap()[0].clone();
        assert!(!wormhole.respond(id, Signature([0u8; 64])));
        assert_eq!(wormhole.timeout_count(&key), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn third_consecutive_timeout_disconnects_once() {
        let (wormhole, channel, disconnect) = setup();
        let key = signer(6);
        channel.reachable.lock().unwrap().insert(key);

        time_out_once(&wormhole, &key).await;
        time_out_once(&wormhole, &key).await;
        assert!(disconnect.calls.lock().unwrap().is_empty());

        time_out_once(&wormhole, &key).await;
        assert_eq!(*disconnect.calls.lock().unwrap(), vec![key]);
        assert_eq!(wormhole.timeout_count(&key), 0);

        // The counter starts over after a disconnect.
        time_out_once(&wormhole, &key).await;
        assert_eq!(disconnect.calls.lock().unwrap().len(), 1);
        assert_eq!(wormhole.timeout_count(&key), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn counters_are_per_signer() {
        let (wormhole, channel, disconnect) = setup();
        let (a, b) = (signer(7), signer(8));
        channel.reachable.lock().unwrap().extend([a, b]);

        time_out_once(&wormhole, &a).await;
        time_out_once(&wormhole, &b).await;
        time_out_once(&wormhole, &a).await;
        time_out_once(&wormhole, &b).await;
        assert!(disconnect.calls.lock().unwrap().is_empty());
        assert_eq!(wormhole.timeout_count(&a), 2);
        assert_eq!(wormhole.timeout_count(&b), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn request_ids_increase() {
        let (wormhole, channel, _) = setup();
        let key = signer(9);
        channel.reachable.lock().unwrap().insert(key);

        let first = pending(
            wormhole
                .request_signature(&key, Bytes::new(), Duration::from_secs(1))
                .unwrap(),
        );
        let second = pending(
            wormhole
                .request_signature(&key, Bytes::new(), Duration::from_secs(1))
                .unwrap(),
        );
        assert!(second.request_id() > first.request_id());
        assert_eq!(wormhole.pending_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch_failure_settles_immediately() {
        let (wormhole, channel, _) = setup();
        let key = signer(10);
        channel.reachable.lock().unwrap().insert(key);
        *channel.fail_dispatch.lock().unwrap() = true;

        let p = pending(
            wormhole
                .request_signature(&key, Bytes::new(), Duration::from_secs(1))
                .unwrap(),
        );
        assert!(matches!(p.wait().await, Err(SigningError::Dispatch { .. })));
        assert_eq!(wormhole.timeout_count(&key), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn signing_handler_maps_outcomes() {
        let (wormhole, channel, _) = setup();
        let wormhole = Arc::new(wormhole);

        let request = SignByPublicKeyRequest {
            public_key: PublicKey([11u8; PUBLIC_KEY_LEN]),
            message: Bytes::from_static(b"x"),
        };
        assert_eq!(wormhole.sign(request.clone()).await, SigningOutcome::Keystore);

        channel.reachable.lock().unwrap().insert(signer(11));
        let outcome = wormhole.sign(request).await;
        match outcome {
            SigningOutcome::Failed(message) => {
                assert!(message.starts_with("Failed to get signature for request #0"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }
}
