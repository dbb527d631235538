//! Conductor backend calls.

pub mod client;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::error::BackendError;

pub use client::ConductorClient;

/// Admin API: install an app for an agent.
pub const INSTALL_APP: &str = "install_app";
/// Admin API: enable an installed app.
pub const ACTIVATE_APP: &str = "activate_app";
/// Admin API: open an app interface on a port.
pub const ATTACH_APP_INTERFACE: &str = "attach_app_interface";
/// App API: look up an installed app.
pub const APP_INFO: &str = "app_info";
/// App API: call a zome function.
pub const CALL_ZOME: &str = "call_zome";

/// Conductor remote error raised when a delegated signature could not be
/// obtained.
const SIGNING_FAILURE_MARKER: &str = "response from service is not success";

/// Conductor interface a call is made on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendTarget {
    /// Admin interface.
    Admin,
    /// Service logger apps.
    Service,
    /// Self-hosted apps, including the hosting registry.
    Internal,
    /// Apps hosted for remote agents.
    Hosted,
}

impl BackendTarget {
    pub const ALL: [Self; 4] = [Self::Admin, Self::Service, Self::Internal, Self::Hosted];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Service => "service",
            Self::Internal => "internal",
            Self::Hosted => "hosted",
        }
    }
}

impl fmt::Display for BackendTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something that can run conductor calls.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Run `method` on `target`. The whole call, including waiting for a
    /// connection, is bounded by `timeout`.
    async fn call(
        &self,
        target: BackendTarget,
        method: &str,
        args: Value,
        timeout: Duration,
    ) -> Result<Value, BackendError>;
}

/// Arguments of a zome function call.
#[derive(Debug, Clone, Serialize)]
pub struct ZomeCall {
    pub cell_id: Value,
    pub zome_name: String,
    pub fn_name: String,
    pub payload: Value,
    pub cap: Option<Value>,
    pub provenance: Value,
}

impl ZomeCall {
    pub fn to_args(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Turn an error reported by the conductor into a [`BackendError`].
pub fn classify_remote(target: BackendTarget, method: &str, message: String) -> BackendError {
    if message.contains(SIGNING_FAILURE_MARKER) {
        tracing::error!(%target, method, "Conductor call failed on a signing request: {}", message);
        return BackendError::SigningFailed;
    }
    BackendError::Remote {
        target: target.to_string(),
        method: method.to_string(),
        message,
    }
}

/// Cell id and agent of the first cell listed in an `app_info` reply.
pub fn first_cell(
    target: BackendTarget,
    app_info: &Value,
) -> Result<(Value, Value), BackendError> {
    let cell_id = app_info
        .pointer("/cell_data/0/0")
        .filter(|v| !v.is_null())
        .cloned()
        .ok_or_else(|| BackendError::InvalidResponse {
            target: target.to_string(),
            reason: "app info has no cell data".to_string(),
        })?;
    let agent = cell_id
        .get(1)
        .cloned()
        .ok_or_else(|| BackendError::InvalidResponse {
            target: target.to_string(),
            reason: "cell id has no agent".to_string(),
        })?;
    Ok((cell_id, agent))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn signing_failures_are_recognised() {
        let err = classify_remote(
            BackendTarget::Hosted,
            CALL_ZOME,
            "Wasm error: response from service is not success: 400".into(),
        );
        assert!(matches!(err, BackendError::SigningFailed));
        assert_eq!(err.to_string(), "Failed to get signatures from Client");

        let err = classify_remote(BackendTarget::Hosted, CALL_ZOME, "other".into());
        assert_eq!(err.remote_message(), Some("other"));
    }

    #[test]
    fn first_cell_reads_cell_data() {
        let info = json!({ "cell_data": [[["dna", "agent"], "nick"]] });
        let (cell_id, agent) = first_cell(BackendTarget::Internal, &info).unwrap();
        assert_eq!(cell_id, json!(["dna", "agent"]));
        assert_eq!(agent, json!("agent"));

        assert!(first_cell(BackendTarget::Internal, &json!({ "cell_data": [] })).is_err());
    }
}
