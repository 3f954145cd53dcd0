mod buffer_pool;
mod config;
mod forward;
mod proxy;
mod spoof;
mod tunnel;

use std::sync::Arc;

use clap::Parser;
use color_eyre::eyre::Result;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::{Cli, ProxyConfig};
use crate::proxy::Proxy;

#[tokio::main]
async fn main() -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("spoofproxy=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    color_eyre::install()?;

    let args = Cli::parse();
    let config = Arc::new(ProxyConfig::from_cli(args)?);

    let listener = TcpListener::bind(&config.listen_addr).await?;
    info!("listening on http://{}", config.listen_addr);
    if !config.rules.is_empty() {
        info!("loaded {} host spoofing rule(s)", config.rules.len());
    }

    let proxy = Arc::new(Proxy::new(config));

    let shutdown = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C handler");
        info!("shutdown signal received");
    };

    tokio::select! {
        _ = proxy.serve(listener) => {}
        _ = shutdown => {}
    }

    Ok(())
}
