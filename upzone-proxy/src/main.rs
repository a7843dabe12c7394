//! Upzone Proxy Engine
//!
//! Loads the configuration, maps every upstream zone and serves the admin
//! binding until interrupted.

use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use upzone_admin::QueryBinding;
use upzone_core::domain::SystemResolver;
use upzone_proxy::server::{self, AdminState};
use upzone_proxy::{bootstrap, config::Config, logging};

/// Shared-memory upstream peer registry with a dynamic admin API.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Configuration file.
    #[arg(short, long, default_value = "upzone.toml")]
    config: PathBuf,

    /// Override the admin listen address from the configuration.
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_json)?;

    let config = Config::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let listen = cli.listen.unwrap_or(config.listen);

    let directory = bootstrap::build_directory(&config, &SystemResolver)?;
    let state = Arc::new(AdminState::new(directory, QueryBinding::new()));

    info!(%listen, "starting admin engine");
    tokio::select! {
        result = server::start_server(listen, state) => {
            if let Err(err) = result {
                error!("server failed: {err}");
                return Err(anyhow::anyhow!("server failed: {err}"));
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down gracefully");
        }
    }

    Ok(())
}
