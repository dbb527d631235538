//! Hosting envoy entry point.

use clap::Parser;

use hosting_envoy::bootstrap::{DEFAULT_LOG_FILTER, LogFormat, init_tracing, load_envoy_env};
use hosting_envoy::cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    load_envoy_env();

    let cli = Cli::parse();
    init_tracing(LogFormat::from_env(), DEFAULT_LOG_FILTER);

    if let Err(e) = cli.execute().await {
        tracing::error!("{:#}", e);
        return Err(e);
    }
    Ok(())
}
