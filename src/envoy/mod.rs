//! The hosting envoy: RPC methods for hosted agents on top of the
//! conductor, the wormhole and the service logger.

pub mod control;
pub mod gateway;
mod handlers;
pub mod package;

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use serde_json::Value;
use tokio::task::JoinHandle;

use crate::activation::ActivationGate;
use crate::backend::Backend;
use crate::config::Config;
use crate::error::RpcError;
use crate::rpc::{ConnectionContext, RpcDispatcher, RpcMethod};
use crate::service_log::{PendingCall, PendingConfirmations, ServiceLogWriter, WriteQueue};
use crate::wormhole::Wormhole;

pub use control::{ControlChannels, wormhole_event};
pub use gateway::Gateway;
pub use package::Package;

pub const WORMHOLE_EVENT: &str = "holo/wormhole/event";
pub const WORMHOLE_RESPONSE: &str = "holo/wormhole/response";
pub const AGENT_SIGNUP: &str = "holo/agent/signup";
pub const APP_INFO: &str = "holo/app_info";
pub const CALL: &str = "holo/call";
pub const SERVICE_CONFIRM: &str = "holo/service/confirm";

/// Installed app id of the hosting registry app.
pub const HHA_INSTALLED_APP_ID: &str = "holo-hosting-app";

pub struct Envoy {
    config: Config,
    backend: Arc<dyn Backend>,
    rpc: Arc<dyn RpcDispatcher>,
    control: Arc<ControlChannels>,
    wormhole: Arc<Wormhole>,
    activation: ActivationGate,
    confirmations: PendingConfirmations<PendingCall>,
    service_log: WriteQueue<ServiceLogWriter>,
    log_writer: Mutex<Option<JoinHandle<()>>>,
    request_counter: AtomicU64,
}

impl Envoy {
    /// Build the envoy and start its service log writer. Methods are not
    /// registered until [`Envoy::register_methods`].
    pub fn new(config: Config, backend: Arc<dyn Backend>, rpc: Arc<dyn RpcDispatcher>) -> Arc<Self> {
        let control = Arc::new(ControlChannels::new(Arc::clone(&rpc)));
        let wormhole = Arc::new(Wormhole::new(
            &config.wormhole,
            control.clone(),
            control.clone(),
        ));
        let (service_log, log_writer) = WriteQueue::start(ServiceLogWriter::new(
            Arc::clone(&backend),
            config.conductor.call_timeout,
        ));
        Arc::new(Self {
            activation: ActivationGate::new(config.envoy.activation_poll_interval),
            config,
            backend,
            rpc,
            control,
            wormhole,
            confirmations: PendingConfirmations::new(),
            service_log,
            log_writer: Mutex::new(Some(log_writer)),
            request_counter: AtomicU64::new(0),
        })
    }

    /// Take the service log writer task. It finishes once the envoy is
    /// dropped and the writes already queued are done.
    pub fn take_log_writer(&self) -> Option<JoinHandle<()>> {
        self.log_writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn control(&self) -> Arc<ControlChannels> {
        Arc::clone(&self.control)
    }

    pub fn wormhole(&self) -> Arc<Wormhole> {
        Arc::clone(&self.wormhole)
    }

    /// Calls still waiting for a client confirmation.
    pub fn pending_confirmations(&self) -> usize {
        self.confirmations.len()
    }

    fn next_response_id(&self) -> u64 {
        self.request_counter.fetch_add(1, Ordering::Relaxed)
    }

    /// Register every envoy method on the dispatcher.
    pub fn register_methods(self: &Arc<Self>) {
        self.register(WORMHOLE_EVENT, |envoy, params, _| async move {
            envoy.wormhole_event(&params)
        });
        self.register(WORMHOLE_RESPONSE, |envoy, params, _| async move {
            envoy.wormhole_response(&params)
        });
        self.register(AGENT_SIGNUP, |envoy, params, _| async move {
            envoy.agent_signup(&params).await
        });
        self.register(APP_INFO, |envoy, params, _| async move {
            envoy.app_info(&params).await
        });
        self.register(CALL, |envoy, params, _| async move { envoy.call(params).await });
        self.register(SERVICE_CONFIRM, |envoy, params, _| async move {
            envoy.service_confirm(&params).await
        });
    }

    fn register<F, Fut>(self: &Arc<Self>, name: &str, handler: F)
    where
        F: Fn(Arc<Self>, Value, ConnectionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        // Weak, as the dispatcher holding the method is owned by the envoy.
        let envoy: Weak<Self> = Arc::downgrade(self);
        let method: Arc<dyn RpcMethod> = Arc::new(move |params: Value, ctx: ConnectionContext| {
            let call = envoy.upgrade().map(|envoy| handler(envoy, params, ctx));
            async move {
                match call {
                    Some(call) => call.await,
                    None => Err(RpcError::Internal("envoy is shut down".to_string())),
                }
            }
        });
        self.rpc.register_method(name, method);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::backend::BackendTarget;
    use crate::error::BackendError;
    use crate::rpc::RpcServer;
    use crate::settings::Settings;

    struct OfflineConductor;

    #[async_trait]
    impl Backend for OfflineConductor {
        async fn call(
            &self,
            target: BackendTarget,
            _method: &str,
            _args: Value,
            _timeout: Duration,
        ) -> Result<Value, BackendError> {
            Err(BackendError::NotConnected {
                target: target.to_string(),
                reason: "offline".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn log_writer_ends_with_the_envoy() {
        let config = Config::build(&Settings::default()).unwrap();
        let server = RpcServer::new("/hosting/");
        let envoy = Envoy::new(config, Arc::new(OfflineConductor), Arc::new(server));
        envoy.register_methods();

        let writer = envoy.take_log_writer().expect("writer handle");
        assert!(envoy.take_log_writer().is_none());
        assert!(!writer.is_finished());

        drop(envoy);
        tokio::time::timeout(Duration::from_secs(5), writer)
            .await
            .expect("log writer outlived the envoy")
            .unwrap();
    }
}
