//! `hosting-envoy config` subcommands.

use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use clap::Subcommand;

use crate::config::Config;
use crate::settings::{
    ConductorSettings, DnaSettings, EnvoySettings, HostedSettings, Settings, ShimSettings,
    WormholeSettings,
};

#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommand {
    /// Print the resolved configuration as TOML.
    Show,

    /// Write the resolved configuration to the config file.
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

pub fn run_config_command(command: ConfigCommand, path: Option<PathBuf>) -> anyhow::Result<()> {
    match command {
        ConfigCommand::Show => {
            let config =
                Config::from_env_with_toml(path.as_deref()).context("failed to load configuration")?;
            let raw = toml::to_string_pretty(&settings_from(&config))
                .context("failed to render configuration")?;
            print!("{raw}");
            Ok(())
        }
        ConfigCommand::Init { force } => {
            let target = path.unwrap_or_else(Settings::default_toml_path);
            init_config_file(&target, force)?;
            println!("Wrote {}", target.display());
            Ok(())
        }
    }
}

/// Write the configuration resolved from env and defaults to `path`.
fn init_config_file(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    // The file being replaced is not read, so a broken one can be regenerated.
    let config = Config::build(&Settings::default()).context("failed to resolve configuration")?;
    settings_from(&config)
        .save_toml(path)
        .map_err(anyhow::Error::msg)
}

/// Settings that reproduce `config` when loaded with no env overrides.
pub fn settings_from(config: &Config) -> Settings {
    let millis = |d: std::time::Duration| Some(d.as_millis() as u64);
    Settings {
        envoy: EnvoySettings {
            mode: Some(config.envoy.mode.as_str().to_string()),
            host: Some(config.envoy.host.clone()),
            port: Some(config.envoy.port),
            namespace: Some(config.envoy.namespace.clone()),
            activation_poll_interval_ms: millis(config.envoy.activation_poll_interval),
        },
        conductor: ConductorSettings {
            host: Some(config.conductor.host.clone()),
            admin_port: Some(config.conductor.admin_port),
            service_port: Some(config.conductor.service_port),
            internal_port: Some(config.conductor.internal_port),
            hosted_port: Some(config.conductor.hosted_port),
            call_timeout_ms: millis(config.conductor.call_timeout),
            reconnect_interval_ms: millis(config.conductor.reconnect_interval),
            max_reconnects: Some(config.conductor.max_reconnects),
        },
        shim: ShimSettings {
            keystore_socket: Some(config.shim.keystore_socket.clone()),
            shim_socket: Some(config.shim.shim_socket.clone()),
            max_frame_bytes: Some(config.shim.max_frame_len),
        },
        wormhole: WormholeSettings {
            timeout_ms: millis(config.wormhole.timeout),
            max_consecutive_timeouts: Some(config.wormhole.max_consecutive_timeouts),
        },
        hosted: HostedSettings {
            servicelogger_id: config.envoy.hosted.servicelogger_id.clone(),
            port_number: config.envoy.hosted.port_number,
            dnas: config
                .envoy
                .hosted
                .dnas
                .iter()
                .map(|dna| DnaSettings {
                    path: dna.path.clone(),
                    nick: dna.nick.clone(),
                })
                .collect(),
        },
    }
}
