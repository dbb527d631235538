//! Service logger records and the writer that commits them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use crate::backend::{APP_INFO, Backend, BackendTarget, CALL_ZOME, ZomeCall, first_cell};
use crate::error::{ServiceLogError, WriteError};
use crate::service_log::queue::LogWriter;
use crate::wormhole::signer::encode_multibase;

/// Zome the service logger exposes its functions under.
pub const SERVICE_ZOME: &str = "service";
/// Service logger function recording a confirmed call.
pub const LOG_ACTIVITY: &str = "log_activity";

/// What the client asked the host to run, as sent with `holo/call`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSpec {
    pub hha_hash: String,
    #[serde(default)]
    pub dna_alias: String,
    pub cell_id: Value,
    pub zome: String,
    pub function: String,
    #[serde(default)]
    pub args: Value,
}

/// `payload` of a `holo/call` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallPayload {
    pub timestamp: String,
    pub host_id: String,
    pub call_spec: CallSpec,
}

/// Call spec as logged: the arguments are replaced by their digest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggedCallSpec {
    pub hha_hash: String,
    pub dna_alias: String,
    pub zome: String,
    pub function: String,
    pub args_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRequest {
    /// `[milliseconds since epoch, nanoseconds]`.
    pub timestamp: (i64, u32),
    pub host_id: String,
    pub call_spec: LoggedCallSpec,
}

impl ServiceRequest {
    pub fn from_payload(payload: &CallPayload) -> Result<Self, ServiceLogError> {
        let spec = &payload.call_spec;
        let args_hash = digest(&spec.args);
        tracing::debug!(%args_hash, "Using argument digest");
        Ok(Self {
            timestamp: (parse_timestamp_millis(&payload.timestamp)?, 0),
            host_id: payload.host_id.clone(),
            call_spec: LoggedCallSpec {
                hha_hash: spec.hha_hash.clone(),
                dna_alias: spec.dna_alias.clone(),
                zome: spec.zome.clone(),
                function: spec.function.clone(),
                args_hash,
            },
        })
    }
}

/// A signed service request from a client agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientRequest {
    pub agent_id: String,
    pub request: ServiceRequest,
    pub request_signature: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostMetrics {
    pub cpu: u64,
}

impl Default for HostMetrics {
    fn default() -> Self {
        Self { cpu: 7 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeblogCompat {
    pub source_ip: String,
    pub status_code: u16,
}

impl Default for WeblogCompat {
    fn default() -> Self {
        Self {
            source_ip: "100:0:0:0".to_string(),
            status_code: 200,
        }
    }
}

/// The host's account of a call it served.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostResponse {
    pub response_hash: String,
    pub host_metrics: HostMetrics,
    pub weblog_compat: WeblogCompat,
    /// Set once the client confirms the response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signed_response_hash: Option<Value>,
}

impl HostResponse {
    pub fn for_result(zome_call_response: &Value) -> Self {
        let response_hash = digest(zome_call_response);
        tracing::debug!(%response_hash, "Processing service response");
        Self {
            response_hash,
            host_metrics: HostMetrics::default(),
            weblog_compat: WeblogCompat::default(),
            signed_response_hash: None,
        }
    }
}

/// Everything the service logger records for one confirmed call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityLog {
    pub request: ClientRequest,
    pub response: HostResponse,
    pub confirmation: Value,
}

/// A call waiting for its client confirmation.
#[derive(Debug, Clone)]
pub struct PendingCall {
    pub agent_id: String,
    pub request: ClientRequest,
    pub response: HostResponse,
}

/// Parse a client timestamp into milliseconds since the epoch.
///
/// Accepts RFC 3339, a naive `YYYY-MM-DDTHH:MM:SS[.fff]` (read as UTC) or a
/// bare millisecond count.
pub fn parse_timestamp_millis(text: &str) -> Result<i64, ServiceLogError> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Ok(dt.timestamp_millis());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f") {
        return Ok(dt.and_utc().timestamp_millis());
    }
    text.parse::<i64>()
        .map_err(|_| ServiceLogError::InvalidPayload(format!("invalid timestamp '{text}'")))
}

/// Multibase SHA-256 digest. Strings are hashed as their raw bytes, anything
/// else as compact JSON. `serde_json` keeps object keys sorted, so equal
/// values hash the same whatever order their keys arrived in.
pub fn digest(value: &Value) -> String {
    let hash = match value {
        Value::String(s) => Sha256::digest(s.as_bytes()),
        other => Sha256::digest(other.to_string().as_bytes()),
    };
    encode_multibase(&hash)
}

/// One `log_activity` write.
#[derive(Debug, Clone)]
pub struct LogActivity {
    /// Installed app id of the service logger to write to.
    pub servicelogger_app_id: String,
    pub activity: ActivityLog,
}

/// Commits activity logs to a service logger app.
pub struct ServiceLogWriter {
    backend: Arc<dyn Backend>,
    timeout: Duration,
}

impl ServiceLogWriter {
    pub fn new(backend: Arc<dyn Backend>, timeout: Duration) -> Self {
        Self { backend, timeout }
    }
}

#[async_trait]
impl LogWriter for ServiceLogWriter {
    type Args = LogActivity;
    type Output = Value;

    async fn write(&self, args: &LogActivity) -> Result<Value, WriteError> {
        let target = BackendTarget::Service;
        let app_info = self
            .backend
            .call(
                target,
                APP_INFO,
                json!({ "installed_app_id": args.servicelogger_app_id }),
                self.timeout,
            )
            .await?;
        if app_info.is_null() {
            return Err(WriteError::Failure(format!(
                "Failed to fetch AppInfo for Servicelogger {}",
                args.servicelogger_app_id
            )));
        }
        let (cell_id, provenance) = first_cell(target, &app_info)?;

        let payload = serde_json::to_value(&args.activity)
            .map_err(|e| WriteError::Failure(format!("Failed to encode activity log: {e}")))?;
        let call = ZomeCall {
            cell_id,
            zome_name: SERVICE_ZOME.to_string(),
            fn_name: LOG_ACTIVITY.to_string(),
            payload,
            cap: None,
            provenance,
        };
        let logged = self
            .backend
            .call(target, CALL_ZOME, call.to_args(), self.timeout)
            .await?;
        if logged.is_null() {
            return Err(WriteError::Failure(
                "Unknown 'service->log_activity' response format: null".to_string(),
            ));
        }
        tracing::info!(app = %args.servicelogger_app_id, "Recorded service activity");
        Ok(logged)
    }
}
