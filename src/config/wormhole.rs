use std::time::Duration;

use crate::config::helpers::{resolve_millis, resolve_or};
use crate::error::ConfigError;
use crate::settings::Settings;

/// Delegated signing limits.
#[derive(Debug, Clone)]
pub struct WormholeConfig {
    /// How long an agent has to answer a signing request.
    pub timeout: Duration,
    /// Consecutive timeouts after which the agent is disconnected.
    pub max_consecutive_timeouts: u32,
}

impl Default for WormholeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(5_000),
            max_consecutive_timeouts: 3,
        }
    }
}

impl WormholeConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let w = &settings.wormhole;
        let max_consecutive_timeouts = resolve_or(
            "WORMHOLE_MAX_CONSECUTIVE_TIMEOUTS",
            w.max_consecutive_timeouts,
            3,
        )?;
        if max_consecutive_timeouts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "WORMHOLE_MAX_CONSECUTIVE_TIMEOUTS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(Self {
            timeout: resolve_millis("WORMHOLE_TIMEOUT_MS", w.timeout_ms, 5_000)?,
            max_consecutive_timeouts,
        })
    }
}
