use std::time::Duration;

use crate::config::helpers::{normalize_variant, optional_env, resolve_millis, resolve_or};
use crate::error::ConfigError;
use crate::settings::Settings;

pub const DEFAULT_PORT: u16 = 4656;
pub const DEFAULT_NAMESPACE: &str = "/hosting/";

/// Production installs apps from the hosting registry; develop mode lets
/// the hosted app overrides take effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvoyMode {
    Production,
    Develop,
}

impl EnvoyMode {
    fn parse(value: &str, key: &str) -> Result<Self, ConfigError> {
        match normalize_variant(value).as_str() {
            "production" | "product" | "prod" => Ok(Self::Production),
            "develop" | "development" | "dev" => Ok(Self::Develop),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected 'production' or 'develop', got '{value}'"),
            }),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Production => "production",
            Self::Develop => "develop",
        }
    }
}

/// DNA installed for hosted agents in develop mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostedDna {
    pub path: String,
    pub nick: Option<String>,
}

/// Develop-mode overrides for the hosted app.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostedAppConfig {
    /// Installed app id of the service logger to use instead of
    /// `{hha_hash}:servicelogger`.
    pub servicelogger_id: Option<String>,
    /// App interface port to attach hosted apps to.
    pub port_number: Option<u16>,
    pub dnas: Vec<HostedDna>,
}

/// RPC gateway configuration.
#[derive(Debug, Clone)]
pub struct EnvoyConfig {
    pub mode: EnvoyMode,
    pub host: String,
    pub port: u16,
    /// Path the RPC websocket is served on.
    pub namespace: String,
    /// Poll interval while another sign-up holds the activation lock.
    pub activation_poll_interval: Duration,
    pub hosted: HostedAppConfig,
}

impl EnvoyConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let envoy = &settings.envoy;
        let mode = match optional_env("ENVOY_MODE")?.or_else(|| envoy.mode.clone()) {
            Some(value) => EnvoyMode::parse(&value, "ENVOY_MODE")?,
            None => EnvoyMode::Production,
        };

        let namespace = optional_env("ENVOY_NAMESPACE")?
            .or_else(|| envoy.namespace.clone())
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());

        Ok(Self {
            mode,
            host: optional_env("ENVOY_HOST")?
                .or_else(|| envoy.host.clone())
                .unwrap_or_else(|| "0.0.0.0".to_string()),
            port: resolve_or("ENVOY_PORT", envoy.port, DEFAULT_PORT)?,
            namespace: normalize_namespace(&namespace),
            activation_poll_interval: resolve_millis(
                "ACTIVATION_POLL_INTERVAL_MS",
                envoy.activation_poll_interval_ms,
                5_000,
            )?,
            hosted: HostedAppConfig {
                servicelogger_id: optional_env("HOSTED_SERVICELOGGER_ID")?
                    .or_else(|| settings.hosted.servicelogger_id.clone()),
                port_number: crate::config::helpers::parse_optional_env("HOSTED_PORT_NUMBER")?
                    .or(settings.hosted.port_number),
                dnas: settings
                    .hosted
                    .dnas
                    .iter()
                    .map(|dna| HostedDna {
                        path: dna.path.clone(),
                        nick: dna.nick.clone(),
                    })
                    .collect(),
            },
        })
    }

    pub fn is_develop(&self) -> bool {
        self.mode == EnvoyMode::Develop
    }
}

/// Ensure the namespace has a leading and trailing slash.
fn normalize_namespace(value: &str) -> String {
    let trimmed = value.trim().trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{trimmed}/")
    }
}
