//! Process wiring: conductor client, RPC server, envoy methods and the
//! keystore shim, started and stopped together.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::ConductorClient;
use crate::config::Config;
use crate::envoy::Envoy;
use crate::error::{ConfigError, Error};
use crate::rpc::{RpcServer, RpcServerHandle};
use crate::shim::Shim;

/// How long shutdown waits for queued service log writes.
const LOG_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Gateway {
    envoy: Arc<Envoy>,
    conductor: Arc<ConductorClient>,
    rpc: RpcServerHandle,
    shim: Shim,
}

impl Gateway {
    /// Connect to the conductor, then start the RPC server and the shim.
    ///
    /// Conductor interfaces that cannot be reached yet are logged and
    /// retried on first use.
    pub async fn start(config: Config) -> Result<Self, Error> {
        let conductor = Arc::new(ConductorClient::new(&config.conductor));
        conductor.connect_all(config.conductor.call_timeout).await;

        let server = RpcServer::new(config.envoy.namespace.clone());
        let addr = resolve_addr(&config.envoy.host, config.envoy.port).await?;
        let shim_config = config.shim.clone();
        let envoy = Envoy::new(config, conductor.clone(), Arc::new(server.clone()));
        server.set_observer(envoy.control());
        envoy.register_methods();

        let rpc = server.start(addr).await?;
        let shim = match Shim::start(&shim_config, envoy.wormhole()).await {
            Ok(shim) => shim,
            Err(e) => {
                rpc.shutdown().await;
                return Err(e.into());
            }
        };

        tracing::info!(rpc = %rpc.local_addr(), shim = %shim.socket_path().display(), "Envoy started");
        Ok(Self {
            envoy,
            conductor,
            rpc,
            shim,
        })
    }

    pub fn rpc_addr(&self) -> SocketAddr {
        self.rpc.local_addr()
    }

    pub fn envoy(&self) -> &Arc<Envoy> {
        &self.envoy
    }

    /// Stop the shim and the RPC server, let queued service log writes
    /// finish, then close conductor sockets.
    pub async fn stop(self) {
        let Self {
            envoy,
            conductor,
            rpc,
            shim,
        } = self;
        tracing::info!("Initiating shutdown");
        shim.stop().await;
        rpc.shutdown().await;

        let log_writer = envoy.take_log_writer();
        drop(envoy);
        if let Some(log_writer) = log_writer {
            match tokio::time::timeout(LOG_DRAIN_TIMEOUT, log_writer).await {
                Ok(Ok(())) => tracing::debug!("Service log drained"),
                Ok(Err(e)) => tracing::warn!("Service log writer failed: {}", e),
                Err(_) => tracing::warn!(
                    "Service log writes still pending after {:?}",
                    LOG_DRAIN_TIMEOUT
                ),
            }
        }

        conductor.close().await;
        tracing::info!("Envoy stopped");
    }
}

async fn resolve_addr(host: &str, port: u16) -> Result<SocketAddr, ConfigError> {
    let invalid = |message: String| ConfigError::InvalidValue {
        key: "ENVOY_HOST".to_string(),
        message,
    };
    tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| invalid(format!("cannot resolve {host}: {e}")))?
        .next()
        .ok_or_else(|| invalid(format!("{host} resolved to no address")))
}
