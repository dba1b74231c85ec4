use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use webserv::{Config, Server, ShutdownToken};

#[derive(Parser, Debug)]
#[command(version, about = "Event-driven HTTP/1.1 server with CGI support", long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    config: PathBuf,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = Config::load(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.as_str()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .init();

    let shutdown = ShutdownToken::new();
    shutdown
        .register_signals()
        .context("failed to install signal handlers")?;

    let server = Server::bind(config, shutdown).context("failed to start server")?;
    for addr in server.local_addrs() {
        tracing::info!("Server started on http://{}/", addr);
    }
    server.run()?;

    tracing::info!("Shutdown complete");
    Ok(())
}
