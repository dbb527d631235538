use std::path::PathBuf;

use crate::config::helpers::{optional_env, resolve_or};
use crate::error::ConfigError;
use crate::settings::Settings;
use crate::shim::codec::{DEFAULT_MAX_FRAME_LEN, HEADER_LEN};

/// Keystore shim sockets.
#[derive(Debug, Clone)]
pub struct ShimConfig {
    /// Keystore socket every relayed connection is paired with.
    pub keystore_socket: PathBuf,
    /// Socket the conductor connects to instead of the keystore.
    pub shim_socket: PathBuf,
    pub max_frame_len: usize,
}

impl ShimConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let s = &settings.shim;
        let base = Settings::base_dir();
        let max_frame_len = resolve_or("SHIM_MAX_FRAME_BYTES", s.max_frame_bytes, DEFAULT_MAX_FRAME_LEN)?;
        if max_frame_len < HEADER_LEN {
            return Err(ConfigError::InvalidValue {
                key: "SHIM_MAX_FRAME_BYTES".to_string(),
                message: format!("must be at least {HEADER_LEN}"),
            });
        }

        Ok(Self {
            keystore_socket: optional_env("LAIR_SOCKET")?
                .map(PathBuf::from)
                .or_else(|| s.keystore_socket.clone())
                .unwrap_or_else(|| base.join("lair").join("socket")),
            shim_socket: optional_env("SHIM_SOCKET")?
                .map(PathBuf::from)
                .or_else(|| s.shim_socket.clone())
                .unwrap_or_else(|| base.join("lair-shim").join("socket")),
            max_frame_len,
        })
    }
}
