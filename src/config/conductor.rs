use std::time::Duration;

use crate::backend::BackendTarget;
use crate::config::helpers::{optional_env, resolve_millis, resolve_or};
use crate::error::ConfigError;
use crate::settings::Settings;

/// Conductor websocket interfaces.
#[derive(Debug, Clone)]
pub struct ConductorConfig {
    pub host: String,
    pub admin_port: u16,
    pub service_port: u16,
    pub internal_port: u16,
    pub hosted_port: u16,
    /// Default bound for one conductor call, connection wait included.
    pub call_timeout: Duration,
    pub reconnect_interval: Duration,
    pub max_reconnects: u32,
}

impl ConductorConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let c = &settings.conductor;
        Ok(Self {
            host: optional_env("CONDUCTOR_HOST")?
                .or_else(|| c.host.clone())
                .unwrap_or_else(|| "localhost".to_string()),
            admin_port: resolve_or("CONDUCTOR_ADMIN_PORT", c.admin_port, 1234)?,
            service_port: resolve_or("CONDUCTOR_SERVICE_PORT", c.service_port, 42222)?,
            internal_port: resolve_or("CONDUCTOR_INTERNAL_PORT", c.internal_port, 42233)?,
            hosted_port: resolve_or("CONDUCTOR_HOSTED_PORT", c.hosted_port, 42244)?,
            call_timeout: resolve_millis("CONDUCTOR_CALL_TIMEOUT_MS", c.call_timeout_ms, 30_000)?,
            reconnect_interval: resolve_millis(
                "CONDUCTOR_RECONNECT_INTERVAL_MS",
                c.reconnect_interval_ms,
                1_000,
            )?,
            max_reconnects: resolve_or("CONDUCTOR_MAX_RECONNECTS", c.max_reconnects, 300)?,
        })
    }

    pub fn port(&self, target: BackendTarget) -> u16 {
        match target {
            BackendTarget::Admin => self.admin_port,
            BackendTarget::Service => self.service_port,
            BackendTarget::Internal => self.internal_port,
            BackendTarget::Hosted => self.hosted_port,
        }
    }

    pub fn url(&self, target: BackendTarget) -> String {
        format!("ws://{}:{}", self.host, self.port(target))
    }
}
