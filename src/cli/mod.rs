//! Command-line interface.
//!
//! `hosting-envoy run` starts the full envoy. `shim` runs the keystore shim
//! on its own, with every signing request answered by the keystore, which
//! is useful when checking socket plumbing without a gateway. `config`
//! prints or writes the resolved configuration.

mod config;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

use crate::config::Config;
use crate::envoy::Gateway;
use crate::shim::{KeystoreFallback, Shim};

pub use self::config::{ConfigCommand, run_config_command, settings_from};

#[derive(Parser, Debug)]
#[command(
    name = "hosting-envoy",
    version,
    about = "RPC gateway and keystore shim for hosted agents"
)]
pub struct Cli {
    /// TOML config file (defaults to ~/.hosting-envoy/config.toml).
    #[arg(short, long, global = true, env = "ENVOY_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start the RPC gateway and the keystore shim (default).
    Run,

    /// Run only the keystore shim, forwarding every request to the keystore.
    Shim {
        /// Keystore socket to connect to.
        #[arg(long)]
        lair_socket: Option<PathBuf>,

        /// Socket to listen on.
        #[arg(long)]
        shim_socket: Option<PathBuf>,
    },

    /// Inspect or initialise the config file.
    #[command(subcommand)]
    Config(ConfigCommand),
}

impl Cli {
    pub async fn execute(self) -> anyhow::Result<()> {
        match self.command.unwrap_or(Command::Run) {
            Command::Run => run_envoy(self.config).await,
            Command::Shim {
                lair_socket,
                shim_socket,
            } => run_shim(self.config, lair_socket, shim_socket).await,
            Command::Config(command) => run_config_command(command, self.config),
        }
    }
}

async fn run_envoy(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let config = Config::from_env_with_toml(config_path.as_deref())
        .context("failed to load configuration")?;
    tracing::info!(
        mode = config.envoy.mode.as_str(),
        port = config.envoy.port,
        namespace = %config.envoy.namespace,
        "Starting hosting envoy"
    );

    let gateway = Gateway::start(config)
        .await
        .context("failed to start the envoy")?;

    wait_for_shutdown().await;
    gateway.stop().await;
    Ok(())
}

async fn run_shim(
    config_path: Option<PathBuf>,
    lair_socket: Option<PathBuf>,
    shim_socket: Option<PathBuf>,
) -> anyhow::Result<()> {
    let mut shim_config = Config::from_env_with_toml(config_path.as_deref())
        .context("failed to load configuration")?
        .shim;
    if let Some(path) = lair_socket {
        shim_config.keystore_socket = path;
    }
    if let Some(path) = shim_socket {
        shim_config.shim_socket = path;
    }

    let shim = Shim::start(&shim_config, std::sync::Arc::new(KeystoreFallback))
        .await
        .with_context(|| format!("failed to start shim at {}", shim_config.shim_socket.display()))?;

    wait_for_shutdown().await;
    shim.stop().await;
    Ok(())
}

async fn wait_for_shutdown() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Received shutdown signal"),
        Err(e) => tracing::error!("Failed to listen for shutdown signal: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_is_the_default() {
        let cli = Cli::try_parse_from(["hosting-envoy"]).unwrap();
        assert!(cli.command.is_none());
        assert!(cli.config.is_none());
    }

    #[test]
    fn shim_accepts_socket_overrides() {
        let cli = Cli::try_parse_from([
            "hosting-envoy",
            "shim",
            "--lair-socket",
            "/tmp/lair",
            "--shim-socket",
            "/tmp/shim",
        ])
        .unwrap();
        match cli.command {
            Some(Command::Shim {
                lair_socket,
                shim_socket,
            }) => {
                assert_eq!(lair_socket, Some(PathBuf::from("/tmp/lair")));
                assert_eq!(shim_socket, Some(PathBuf::from("/tmp/shim")));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn config_flag_is_global() {
        let cli =
            Cli::try_parse_from(["hosting-envoy", "config", "init", "--force", "-c", "x.toml"])
                .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("x.toml")));
        assert!(matches!(
            cli.command,
            Some(Command::Config(ConfigCommand::Init { force: true }))
        ));
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
