//! portroute-server: dynamically reconfigurable TCP reverse proxy.
//!
//! Listens on a set of configured entry ports and forwards every accepted
//! connection, byte for byte, to a fixed destination host:port. Rules are
//! seeded from a CSV store at startup and can be added or removed at runtime
//! through the HTTP control API without restarting already-running forwards.

mod api;
mod config;
mod listener;
mod registry;
mod relay;
mod repository;

use api::ApiState;
use clap::Parser;
use config::ServerConfig;
use registry::RouteRegistry;
use repository::CsvRuleRepository;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// portroute-server — dynamically reconfigurable TCP reverse proxy
#[derive(Parser, Debug)]
#[command(name = "portroute-server", version, about = "Dynamically reconfigurable TCP reverse proxy")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "~/.portroute/config.toml")]
    config: String,

    /// Rules CSV file path (overrides the config file)
    #[arg(long)]
    rules: Option<String>,

    /// Control API port (overrides the config file)
    #[arg(long)]
    api_port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting portroute-server"
    );

    let config_path = PathBuf::from(&cli.config);
    let server_config = match ServerConfig::load(
        Some(&config_path),
        cli.rules.as_deref(),
        cli.api_port,
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let repository = match CsvRuleRepository::open(&server_config.rules_path) {
        Ok(repo) => Arc::new(repo),
        Err(e) => {
            error!(path = %server_config.rules_path.display(), error = %e, "failed to open rules store");
            std::process::exit(1);
        }
    };

    let registry = Arc::new(RouteRegistry::new(server_config.connect_timeout));

    // Seed the registry from the store. One rule failing to activate (port
    // taken, invalid record) does not stop the others.
    for rule in repository.list_all() {
        if let Err(e) = rule.validate() {
            warn!(name = %rule.name, error = %e, "skipping stored rule");
            continue;
        }
        if let Err(e) = registry.add(rule.clone()).await {
            warn!(rule = %rule.key(), error = %e, "stored rule failed to activate");
        }
    }
    info!(routes = registry.count().await, "routes seeded");

    let state = ApiState {
        registry: registry.clone(),
        repository,
    };

    // Run until shutdown signal
    tokio::select! {
        result = api::serve(server_config.api_addr, state) => {
            if let Err(e) = result {
                error!(error = %e, "control API error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    registry.shutdown().await;
    info!("portroute-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
