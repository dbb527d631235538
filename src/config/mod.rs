//! Configuration for the hosting envoy.
//!
//! Settings are loaded with priority: env var > TOML config file > default.
//! `.env` in the working directory and `~/.hosting-envoy/.env` are loaded
//! via dotenvy early in startup and never override variables that are
//! already set.

mod conductor;
mod envoy;
pub(crate) mod helpers;
mod shim;
mod wormhole;

use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::settings::Settings;

pub use self::conductor::ConductorConfig;
pub use self::envoy::{
    DEFAULT_NAMESPACE, DEFAULT_PORT, EnvoyConfig, EnvoyMode, HostedAppConfig, HostedDna,
};
pub use self::shim::ShimConfig;
pub use self::wormhole::WormholeConfig;

/// Main configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub envoy: EnvoyConfig,
    pub conductor: ConductorConfig,
    pub shim: ShimConfig,
    pub wormhole: WormholeConfig,
}

impl Config {
    /// Load configuration from environment variables and the default
    /// config file, if one exists.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_with_toml(None)
    }

    /// Load from env with an optional TOML config file overlay.
    pub fn from_env_with_toml(toml_path: Option<&Path>) -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        crate::bootstrap::load_envoy_env();
        let settings = Self::load_settings(toml_path)?;
        Self::build(&settings)
    }

    /// Load the TOML config file.
    ///
    /// If `explicit_path` is `Some`, loads from that path (errors are fatal).
    /// If `None`, tries the default path `~/.hosting-envoy/config.toml`
    /// (missing file is silently ignored).
    pub fn load_settings(explicit_path: Option<&Path>) -> Result<Settings, ConfigError> {
        let path = explicit_path
            .map(PathBuf::from)
            .unwrap_or_else(Settings::default_toml_path);

        match Settings::load_toml(&path) {
            Ok(Some(settings)) => {
                tracing::debug!("Loaded TOML config from {}", path.display());
                Ok(settings)
            }
            Ok(None) => {
                if explicit_path.is_some() {
                    return Err(ConfigError::ParseError(format!(
                        "Config file not found: {}",
                        path.display()
                    )));
                }
                Ok(Settings::default())
            }
            Err(e) => {
                if explicit_path.is_some() {
                    return Err(ConfigError::ParseError(format!(
                        "Failed to load config file {}: {}",
                        path.display(),
                        e
                    )));
                }
                tracing::warn!("Failed to load default config file: {}", e);
                Ok(Settings::default())
            }
        }
    }

    /// Build config from settings, applying env overrides.
    pub fn build(settings: &Settings) -> Result<Self, ConfigError> {
        Ok(Self {
            envoy: EnvoyConfig::resolve(settings)?,
            conductor: ConductorConfig::resolve(settings)?,
            shim: ShimConfig::resolve(settings)?,
            wormhole: WormholeConfig::resolve(settings)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::helpers::test_env::EnvGuard;
    use std::time::Duration;

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load_settings(Some(&dir.path().join("missing.toml"))).unwrap_err();
        assert!(err.to_string().contains("Config file not found"));
    }

    #[test]
    fn toml_values_apply_when_env_is_unset() {
        let mut env = EnvGuard::new();
        env.clear(&["WORMHOLE_TIMEOUT_MS", "WORMHOLE_MAX_CONSECUTIVE_TIMEOUTS"]);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[wormhole]\ntimeout_ms = 750\nmax_consecutive_timeouts = 5\n")
            .unwrap();

        let settings = Config::load_settings(Some(&path)).unwrap();
        let config = Config::build(&settings).unwrap();
        assert_eq!(config.wormhole.timeout, Duration::from_millis(750));
        assert_eq!(config.wormhole.max_consecutive_timeouts, 5);

        env.set("WORMHOLE_TIMEOUT_MS", "1200");
        let config = Config::build(&settings).unwrap();
        assert_eq!(config.wormhole.timeout, Duration::from_millis(1200));
    }

    #[test]
    fn zero_timeout_threshold_is_rejected() {
        let mut env = EnvGuard::new();
        env.set("WORMHOLE_MAX_CONSECUTIVE_TIMEOUTS", "0");
        let err = Config::build(&Settings::default()).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { ref key, .. } if key == "WORMHOLE_MAX_CONSECUTIVE_TIMEOUTS"
        ));
    }
}
