use std::sync::Arc;

use anyhow::Result;
use burrow::{
    cli::{CliConfig, Mode}, client::{ConnectionManager, grab_host_key}, server::run_server, tunnel::Tunnel
};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = CliConfig::parse()?;
    init_tracing(cli.quiet);

    match cli.mode {
        Mode::Server(config) => run_server(config).await?,
        Mode::GrabKey(config) => grab_host_key(&config).await?,
        Mode::Client { config, tunnels } => run_client(config, tunnels).await?,
    }

    Ok(())
}

async fn run_client(config: burrow::client::ClientConfig, tunnels: Vec<burrow::tunnel::TunnelConfig>) -> Result<()> {
    let manager = Arc::new(ConnectionManager::new(config)?);
    manager.start();

    let mut tasks = Vec::new();
    for config in tunnels {
        let tunnel = Tunnel::new(config, manager.clone());
        tasks.push(tokio::spawn(async move {
            if let Err(err) = tunnel.run().await {
                error!(error = %err, "tunnel terminated");
            }
        }));
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    manager.stop().await;
    for task in tasks {
        task.abort();
    }
    Ok(())
}

fn init_tracing(quiet: bool) {
    let default_filter = if quiet { "error" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt().with_env_filter(env_filter).try_init();
}
