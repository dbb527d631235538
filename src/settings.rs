//! Settings file.
//!
//! Optional TOML file at `~/.hosting-envoy/config.toml`. Every field is
//! optional; environment variables win over anything set here.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Settings persisted to disk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub envoy: EnvoySettings,

    #[serde(default)]
    pub conductor: ConductorSettings,

    #[serde(default)]
    pub shim: ShimSettings,

    #[serde(default)]
    pub wormhole: WormholeSettings,

    /// Hosted app overrides, honoured in develop mode only.
    #[serde(default)]
    pub hosted: HostedSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvoySettings {
    /// "production" or "develop".
    #[serde(default)]
    pub mode: Option<String>,

    #[serde(default)]
    pub host: Option<String>,

    #[serde(default)]
    pub port: Option<u16>,

    /// RPC namespace path, e.g. "/hosting/".
    #[serde(default)]
    pub namespace: Option<String>,

    #[serde(default)]
    pub activation_poll_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConductorSettings {
    #[serde(default)]
    pub host: Option<String>,

    #[serde(default)]
    pub admin_port: Option<u16>,

    #[serde(default)]
    pub service_port: Option<u16>,

    #[serde(default)]
    pub internal_port: Option<u16>,

    #[serde(default)]
    pub hosted_port: Option<u16>,

    #[serde(default)]
    pub call_timeout_ms: Option<u64>,

    #[serde(default)]
    pub reconnect_interval_ms: Option<u64>,

    #[serde(default)]
    pub max_reconnects: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShimSettings {
    /// Keystore (lair) socket the shim connects to.
    #[serde(default)]
    pub keystore_socket: Option<PathBuf>,

    /// Socket the shim listens on.
    #[serde(default)]
    pub shim_socket: Option<PathBuf>,

    #[serde(default)]
    pub max_frame_bytes: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WormholeSettings {
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    #[serde(default)]
    pub max_consecutive_timeouts: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostedSettings {
    #[serde(default)]
    pub servicelogger_id: Option<String>,

    #[serde(default)]
    pub port_number: Option<u16>,

    #[serde(default)]
    pub dnas: Vec<DnaSettings>,
}

/// DNA to install in place of the registry's bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnaSettings {
    pub path: String,

    #[serde(default)]
    pub nick: Option<String>,
}

impl Settings {
    /// Base directory for envoy state (~/.hosting-envoy).
    pub fn base_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".hosting-envoy")
    }

    /// Default TOML config file path (~/.hosting-envoy/config.toml).
    pub fn default_toml_path() -> PathBuf {
        Self::base_dir().join("config.toml")
    }

    /// Load settings from a TOML file.
    ///
    /// Returns `None` if the file doesn't exist. Returns an error only
    /// if the file exists but can't be parsed.
    pub fn load_toml(path: &Path) -> Result<Option<Self>, String> {
        let data = match std::fs::read_to_string(path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(format!("failed to read {}: {}", path.display(), e)),
        };

        toml::from_str(&data)
            .map(Some)
            .map_err(|e| format!("invalid TOML in {}: {}", path.display(), e))
    }

    /// Write the settings as a TOML file, creating parent directories.
    pub fn save_toml(&self, path: &Path) -> Result<(), String> {
        let raw = toml::to_string_pretty(self)
            .map_err(|e| format!("failed to serialize settings: {}", e))?;

        let content = format!(
            "# hosting-envoy configuration file.\n\
             #\n\
             # Priority: env var > this file > defaults.\n\
             # Run `hosting-envoy config init --force` to regenerate this file.\n\
             \n\
             {raw}"
        );

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("failed to create {}: {}", parent.display(), e))?;
        }

        std::fs::write(path, content)
            .map_err(|e| format!("failed to write {}: {}", path.display(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(Settings::load_toml(&dir.path().join("nope.toml")).unwrap(), None);
    }

    #[test]
    fn partial_file_leaves_other_sections_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[envoy]\nport = 9000\n\n[wormhole]\ntimeout_ms = 250\n\n[[hosted.dnas]]\npath = \"./app.dna\"\n",
        )
        .unwrap();

        let settings = Settings::load_toml(&path).unwrap().unwrap();
        assert_eq!(settings.envoy.port, Some(9000));
        assert_eq!(settings.wormhole.timeout_ms, Some(250));
        assert_eq!(settings.hosted.dnas[0].path, "./app.dna");
        assert_eq!(settings.conductor, ConductorSettings::default());
    }

    #[test]
    fn invalid_toml_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[envoy\nport = ").unwrap();
        let err = Settings::load_toml(&path).unwrap_err();
        assert!(err.contains("invalid TOML"));
    }

    #[test]
    fn save_creates_parent_dirs_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let settings = Settings {
            shim: ShimSettings {
                shim_socket: Some(PathBuf::from("/tmp/shim.sock")),
                ..Default::default()
            },
            ..Default::default()
        };

        settings.save_toml(&path).unwrap();
        assert_eq!(Settings::load_toml(&path).unwrap(), Some(settings));
    }

    #[test]
    fn default_toml_path_under_base_dir() {
        let path = Settings::default_toml_path();
        assert!(path.to_string_lossy().contains(".hosting-envoy"));
        assert!(path.to_string_lossy().ends_with("config.toml"));
    }
}
