//! `jbodcsi`: CSI node plugin daemon for directly attached JBOD volumes.

mod cli;
mod tls;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use libjbodcsi::transport::{CsiClient, CsiServer};
use libjbodcsi::{HostMounter, JbodNode, VolumeRegistry};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::cli::{Cli, Command, InfoArgs, ServeArgs};

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Info(args) => node_info(args).await,
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let config = args.node_config()?;

    let registry = match &config.state_dir {
        Some(dir) => {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create state directory {}", dir.display()))?;
            let registry = VolumeRegistry::persistent(dir);
            registry
                .recover()
                .await
                .context("Failed to recover volume records")?;
            registry
        }
        None => VolumeRegistry::new(),
    };

    info!(
        node_id = %config.node_id,
        identity = %config.identity,
        volumes = registry.len(),
        "starting JBOD CSI node plugin",
    );

    let node = Arc::new(JbodNode::new(
        &config,
        Arc::new(registry),
        Arc::new(HostMounter::new()),
    ));
    let tls = tls::server_config(&args.tls_cert, &args.tls_key)?;
    let server = CsiServer::new(args.listen, tls, node, config.request_timeout())
        .context("Failed to start CSI server")?;

    tokio::select! {
        res = server.serve() => res.context("CSI server stopped")?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            server.endpoint().close(0u32.into(), b"shutdown");
        }
    }
    Ok(())
}

async fn node_info(args: InfoArgs) -> Result<()> {
    let tls = tls::client_config(&args.tls_ca)?;
    let client = CsiClient::connect(args.addr, &args.server_name, tls)
        .await
        .with_context(|| format!("Failed to connect to {}", args.addr))?;
    let info = client.node_info().await.context("NodeGetInfo failed")?;
    client.close();
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}
