use serde::Deserialize;
use serde_json::{Value, json};

use crate::backend::{
    ACTIVATE_APP, APP_INFO, ATTACH_APP_INTERFACE, BackendTarget, CALL_ZOME, INSTALL_APP, ZomeCall,
    first_cell,
};
use crate::envoy::package::{Package, holo_error};
use crate::envoy::{Envoy, HHA_INSTALLED_APP_ID};
use crate::error::{BackendError, RpcError, ServiceLogError};
use crate::rpc::protocol::positional;
use crate::service_log::{
    ActivityLog, CallPayload, ClientRequest, HostResponse, LogActivity, PendingCall,
    ServiceRequest,
};
use crate::wormhole::decode_signature;

const SIGNUP_FAILED: &str = "Failed to create a new hosted agent";
const NOT_SIGNED_IN: &str = "Agent is not signed-in";
const SIGNING_UNAVAILABLE: &str =
    "We were unable to contact Chaperone for the Agent signing service.  Please check ...";

#[derive(Debug, Deserialize)]
struct CallParams {
    #[serde(default)]
    anonymous: bool,
    agent_id: String,
    payload: CallPayload,
    #[serde(default)]
    service_signature: Value,
}

#[derive(Debug, Deserialize)]
struct AppInfoParams {
    installed_app_id: String,
}

fn string_param(params: &Value, index: usize, name: &str) -> Result<String, RpcError> {
    positional(params, index)
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| RpcError::InvalidParams(format!("{name} must be a string")))
}

/// Whether a conductor error only says the step was already done.
fn already_done(err: &BackendError, marker: &str) -> bool {
    err.remote_message()
        .is_some_and(|m| m.to_lowercase().contains(marker))
}

/// Null and empty objects or arrays mean the zome function takes no input.
fn zome_payload(args: &Value) -> Value {
    match args {
        Value::Object(map) if map.is_empty() => Value::Null,
        Value::Array(items) if items.is_empty() => Value::Null,
        other => other.clone(),
    }
}

impl Envoy {
    pub(super) fn wormhole_event(&self, params: &Value) -> Result<Value, RpcError> {
        let agent_id = string_param(params, 0, "agent_id")?;
        tracing::info!(agent = %agent_id, "Initializing wormhole");
        Ok(Value::String(self.control.open_wormhole(&agent_id)?))
    }

    pub(super) fn wormhole_response(&self, params: &Value) -> Result<Value, RpcError> {
        let request_id = positional(params, 0)
            .as_u64()
            .ok_or_else(|| RpcError::InvalidParams("payload_id must be a number".to_string()))?;
        let signature = string_param(params, 1, "signature")?;
        let signature =
            decode_signature(&signature).map_err(|e| RpcError::InvalidParams(e.to_string()))?;
        tracing::info!(request_id, "Received signing response");
        Ok(Value::Bool(self.wormhole.respond(request_id, signature)))
    }

    pub(super) async fn agent_signup(&self, params: &Value) -> Result<Value, RpcError> {
        let hha_hash = string_param(params, 0, "hha_hash")?;
        let agent_id = string_param(params, 1, "agent_id")?;
        tracing::info!(agent = %agent_id, %hha_hash, "Received sign-up request");

        match self.sign_up(&hha_hash, &agent_id).await {
            Ok(()) => {
                tracing::info!(agent = %agent_id, %hha_hash, "Completed sign-up");
                Ok(Value::Bool(true))
            }
            Err(e) => {
                tracing::error!(agent = %agent_id, %hha_hash, "Sign-up failed: {}", e);
                Ok(holo_error(SIGNUP_FAILED))
            }
        }
    }

    async fn conductor(
        &self,
        target: BackendTarget,
        method: &str,
        args: Value,
    ) -> Result<Value, BackendError> {
        self.backend
            .call(target, method, args, self.config.conductor.call_timeout)
            .await
    }

    /// Null replies from the conductor mean the lookup found nothing.
    fn require(target: BackendTarget, value: Value, what: &str) -> Result<Value, BackendError> {
        if value.is_null() {
            return Err(BackendError::InvalidResponse {
                target: target.to_string(),
                reason: format!("{what} returned nothing"),
            });
        }
        Ok(value)
    }

    async fn sign_up(&self, hha_hash: &str, agent_id: &str) -> Result<(), BackendError> {
        let internal = BackendTarget::Internal;
        let hha_info = self
            .conductor(internal, APP_INFO, json!({ "installed_app_id": HHA_INSTALLED_APP_ID }))
            .await?;
        let hha_info = Self::require(internal, hha_info, "hosting app info")?;
        let (hha_cell, host_agent) = first_cell(internal, &hha_info)?;

        let lookup = ZomeCall {
            cell_id: hha_cell,
            zome_name: "hha".to_string(),
            fn_name: "get_happ".to_string(),
            payload: json!(hha_hash),
            cap: None,
            provenance: host_agent,
        };
        let happ = self.conductor(internal, CALL_ZOME, lookup.to_args()).await?;
        let happ = Self::require(internal, happ, "get_happ")?;

        let installed_app_id = format!("{hha_hash}:{agent_id}");
        let dnas = self.dnas_for(&happ);
        tracing::info!(app = %installed_app_id, dnas = dnas.len(), "Installing hosted app");

        let admin = BackendTarget::Admin;
        let install = json!({
            "installed_app_id": installed_app_id,
            "agent_key": agent_id,
            "dnas": dnas,
        });
        match self.conductor(admin, INSTALL_APP, install).await {
            Ok(_) => {}
            Err(e) if already_done(&e, "duplicate cell") => {
                tracing::warn!(app = %installed_app_id, "Cell already exists in conductor")
            }
            Err(e) => return Err(e),
        }

        self.activation
            .with_lock(&installed_app_id, || async {
                match self
                    .conductor(admin, ACTIVATE_APP, json!({ "installed_app_id": installed_app_id }))
                    .await
                {
                    Ok(_) => Ok(()),
                    Err(e) if already_done(&e, "already in interface") => {
                        tracing::warn!(app = %installed_app_id, "App is already activated");
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            })
            .await?;

        let port = match (self.config.envoy.is_develop(), self.config.envoy.hosted.port_number) {
            (true, Some(port)) => port,
            _ => self.config.conductor.hosted_port,
        };
        tracing::info!(app = %installed_app_id, port, "Attaching app interface");
        match self
            .conductor(admin, ATTACH_APP_INTERFACE, json!({ "port": port }))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if already_done(&e, "already active") => {
                tracing::warn!(app = %installed_app_id, "App interface is already attached");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// DNAs to install: the configured ones in develop mode, otherwise the
    /// bundle's, with nicks defaulting to the DNA file name.
    fn dnas_for(&self, happ: &Value) -> Vec<Value> {
        let hosted = &self.config.envoy.hosted;
        if self.config.envoy.is_develop() && !hosted.dnas.is_empty() {
            return hosted
                .dnas
                .iter()
                .map(|dna| {
                    let nick = dna.nick.clone().unwrap_or_else(|| file_name(&dna.path));
                    json!({ "nick": nick, "path": dna.path })
                })
                .collect();
        }
        happ.pointer("/happ_bundle/dnas")
            .and_then(Value::as_array)
            .map(|dnas| {
                dnas.iter()
                    .filter_map(|dna| {
                        let path = dna.get("path")?.as_str()?;
                        let nick = dna
                            .get("nick")
                            .and_then(Value::as_str)
                            .filter(|n| !n.is_empty())
                            .map(str::to_string)
                            .unwrap_or_else(|| file_name(path));
                        Some(json!({ "nick": nick, "path": path }))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub(super) async fn app_info(&self, params: &Value) -> Result<Value, RpcError> {
        let AppInfoParams { installed_app_id } = serde_json::from_value(params.clone())
            .map_err(|e| RpcError::InvalidParams(e.to_string()))?;
        let response_id = self.next_response_id();

        let target = BackendTarget::Hosted;
        let info = self
            .conductor(target, APP_INFO, json!({ "installed_app_id": installed_app_id }))
            .await
            .and_then(|info| Self::require(target, info, "app_info"));
        match info {
            Ok(info) => {
                tracing::info!(app = %installed_app_id, "Completed app info call");
                Ok(Package::success(info, Some(response_id)).into_value())
            }
            Err(e) => {
                tracing::error!(app = %installed_app_id, "App info call failed: {}", e);
                Ok(Package::error("Failed during Conductor AppInfo call").into_value())
            }
        }
    }

    pub(super) async fn call(&self, params: Value) -> Result<Value, RpcError> {
        let CallParams {
            anonymous,
            agent_id,
            payload,
            service_signature,
        } = serde_json::from_value(params).map_err(|e| RpcError::InvalidParams(e.to_string()))?;
        let response_id = self.next_response_id();
        let spec = &payload.call_spec;
        tracing::info!(
            agent = %agent_id,
            zome = %spec.zome,
            function = %spec.function,
            response_id,
            "Received zome call request"
        );

        let request = match ServiceRequest::from_payload(&payload) {
            Ok(request) => ClientRequest {
                agent_id: agent_id.clone(),
                request,
                request_signature: service_signature,
            },
            Err(e) => {
                tracing::warn!(agent = %agent_id, "Rejected service request: {}", e);
                return Ok(Package::error(e.to_string()).into_value());
            }
        };

        let zome_call = ZomeCall {
            cell_id: spec.cell_id.clone(),
            zome_name: spec.zome.clone(),
            fn_name: spec.function.clone(),
            payload: zome_payload(&spec.args),
            cap: None,
            provenance: json!(agent_id),
        };
        let (zome_response, failure) = match self
            .conductor(BackendTarget::Hosted, CALL_ZOME, zome_call.to_args())
            .await
        {
            Ok(value) => (value, None),
            Err(BackendError::SigningFailed) => {
                let message = if anonymous || self.control.is_anonymous_agent(&agent_id) {
                    NOT_SIGNED_IN
                } else {
                    SIGNING_UNAVAILABLE
                };
                tracing::warn!(agent = %agent_id, "Zome call needed a signature: {}", message);
                (json!({}), Some(message.to_string()))
            }
            Err(e) => {
                tracing::error!(agent = %agent_id, "Zome call failed: {}", e);
                let message = e.remote_message().map(str::to_string).unwrap_or_else(|| e.to_string());
                (json!({}), Some(message))
            }
        };

        let host_response = HostResponse::for_result(&zome_response);
        self.confirmations.add(
            response_id,
            PendingCall {
                agent_id,
                request,
                response: host_response.clone(),
            },
        );

        if let Some(message) = failure {
            self.confirmations.remove(response_id);
            return Ok(Package::error(message).into_value());
        }
        Ok(Package::success(
            json!({ "host_response": host_response, "zomeCall_response": zome_response }),
            Some(response_id),
        )
        .into_value())
    }

    pub(super) async fn service_confirm(&self, params: &Value) -> Result<Value, RpcError> {
        let Some(response_id) = positional(params, 0).as_u64() else {
            tracing::error!("Response id for confirmation is not a number");
            return Ok(Value::Bool(false));
        };
        let response_signature = positional(params, 1).clone();
        let confirmation = positional(params, 2).clone();
        tracing::info!(response_id, "Received confirmation");

        // Claimed before the write so a repeated confirm cannot log twice.
        let Some(pending) = self.confirmations.remove(response_id) else {
            let e = ServiceLogError::UnknownConfirmation(response_id);
            tracing::error!(response_id, "{}", e);
            return Ok(Package::error(e.to_string()).into_value());
        };

        let PendingCall {
            agent_id,
            request,
            mut response,
        } = pending;
        response.signed_response_hash = Some(response_signature);
        let servicelogger_app_id = self.servicelogger_app_id(&request.request.call_spec.hha_hash);
        tracing::debug!(response_id, agent = %agent_id, app = %servicelogger_app_id, "Logging service activity");

        let write = self.service_log.enqueue(LogActivity {
            servicelogger_app_id,
            activity: ActivityLog {
                request,
                response,
                confirmation,
            },
        });
        match write.await {
            Ok(_) => {
                tracing::info!(response_id, "Confirmation complete");
                Ok(Package::success(Value::Bool(true), Some(response_id)).into_value())
            }
            Err(e) => {
                tracing::error!(response_id, "Service log write failed: {}", e);
                Ok(Package::error(format!("servicelogger.log_activity threw: {e}")).into_value())
            }
        }
    }

    fn servicelogger_app_id(&self, hha_hash: &str) -> String {
        match &self.config.envoy.hosted.servicelogger_id {
            Some(id) if self.config.envoy.is_develop() => id.clone(),
            _ => format!("{hha_hash}:servicelogger"),
        }
    }
}

fn file_name(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_args_become_null() {
        assert_eq!(zome_payload(&json!({})), Value::Null);
        assert_eq!(zome_payload(&json!([])), Value::Null);
        assert_eq!(zome_payload(&json!({ "a": 1 })), json!({ "a": 1 }));
        assert_eq!(zome_payload(&json!("x")), json!("x"));
    }

    #[test]
    fn nick_defaults_to_file_name() {
        assert_eq!(file_name("/var/dnas/chat.dna"), "chat.dna");
        assert_eq!(file_name("chat.dna"), "chat.dna");
    }

    #[test]
    fn tolerated_errors_match_case_insensitively() {
        let err = BackendError::Remote {
            target: "admin".into(),
            method: INSTALL_APP.into(),
            message: "Conductor error: Duplicate Cell".into(),
        };
        assert!(already_done(&err, "duplicate cell"));
        assert!(!already_done(&err, "already active"));
    }
}
