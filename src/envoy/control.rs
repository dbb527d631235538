//! Per-agent control channels: the wormhole events agents subscribe to,
//! and which connected agents are anonymous.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::json;

use crate::error::RpcError;
use crate::rpc::{ConnectionContext, ConnectionObserver, RpcDispatcher};
use crate::wormhole::{DisconnectHook, SignerKey, SigningChannel, encode_multibase};

/// Event an agent listens on for signing requests.
pub fn wormhole_event(agent_id: &str) -> String {
    format!("{agent_id}/wormhole/request")
}

#[derive(Debug)]
struct AnonymousAgent {
    hha_hash: Option<String>,
    signer: Option<SignerKey>,
}

#[derive(Default)]
struct Agents {
    /// Agent id each signer registered its wormhole under.
    wormholes: HashMap<SignerKey, String>,
    anonymous: HashMap<String, AnonymousAgent>,
}

pub struct ControlChannels {
    rpc: Arc<dyn RpcDispatcher>,
    agents: Mutex<Agents>,
}

impl ControlChannels {
    pub fn new(rpc: Arc<dyn RpcDispatcher>) -> Self {
        Self {
            rpc,
            agents: Mutex::new(Agents::default()),
        }
    }

    fn agents(&self) -> MutexGuard<'_, Agents> {
        self.agents.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register the wormhole event for `agent_id` and return its name.
    /// Registering an agent again is not an error.
    pub fn open_wormhole(&self, agent_id: &str) -> Result<String, RpcError> {
        let event = wormhole_event(agent_id);
        match self.rpc.register_event(&event) {
            Ok(()) => tracing::debug!(agent = agent_id, %event, "Registered wormhole event"),
            Err(RpcError::EventAlreadyRegistered(_)) => {
                tracing::warn!(agent = agent_id, %event, "Wormhole event is already registered")
            }
            Err(e) => return Err(e),
        }

        match SignerKey::parse(agent_id) {
            Ok(signer) => {
                self.agents().wormholes.insert(signer, agent_id.to_string());
            }
            Err(e) => tracing::warn!("Wormhole opened for an agent that cannot sign: {}", e),
        }
        Ok(event)
    }

    pub fn is_anonymous_agent(&self, agent_id: &str) -> bool {
        self.agents().anonymous.contains_key(agent_id)
    }

    /// hApp the anonymous agent connected for, if any.
    pub fn anonymous_hha(&self, agent_id: &str) -> Option<String> {
        self.agents()
            .anonymous
            .get(agent_id)
            .and_then(|a| a.hha_hash.clone())
    }

    fn agent_for(&self, signer: &SignerKey) -> Option<String> {
        self.agents().wormholes.get(signer).cloned()
    }
}

impl SigningChannel for ControlChannels {
    fn is_reachable(&self, signer: &SignerKey) -> bool {
        self.agent_for(signer)
            .is_some_and(|agent| self.rpc.has_event(&wormhole_event(&agent)))
    }

    fn is_anonymous(&self, signer: &SignerKey) -> bool {
        self.agents()
            .anonymous
            .values()
            .any(|a| a.signer.as_ref() == Some(signer))
    }

    fn dispatch(&self, signer: &SignerKey, request_id: u64, message: &[u8]) -> Result<(), String> {
        let agent = self
            .agent_for(signer)
            .ok_or_else(|| format!("no wormhole registered for {signer}"))?;
        let event = wormhole_event(&agent);
        let sent = self
            .rpc
            .emit(&event, json!([request_id, encode_multibase(message)]))
            .map_err(|e| e.to_string())?;
        if sent == 0 {
            tracing::warn!(request_id, %event, "No connection is subscribed to the wormhole");
        }
        Ok(())
    }
}

impl DisconnectHook for ControlChannels {
    fn disconnect(&self, signer: &SignerKey) {
        let Some(agent) = self.agents().wormholes.remove(signer) else {
            tracing::warn!(signer = %signer, "No wormhole to disconnect");
            return;
        };
        self.rpc.disconnect_agent(&agent);
    }
}

impl ConnectionObserver for ControlChannels {
    fn on_open(&self, ctx: &ConnectionContext) {
        let Some(agent_id) = ctx.agent_id.as_deref().filter(|_| ctx.anonymous) else {
            return;
        };
        tracing::debug!(agent = agent_id, hha_hash = ?ctx.hha_hash, "Tracking anonymous agent");
        self.agents().anonymous.insert(
            agent_id.to_string(),
            AnonymousAgent {
                hha_hash: ctx.hha_hash.clone(),
                signer: SignerKey::parse(agent_id).ok(),
            },
        );
    }

    fn on_close(&self, ctx: &ConnectionContext) {
        if let Some(agent_id) = ctx.agent_id.as_deref().filter(|_| ctx.anonymous)
            && self.agents().anonymous.remove(agent_id).is_some()
        {
            tracing::debug!(agent = agent_id, "Forgot anonymous agent");
        }
    }
}
