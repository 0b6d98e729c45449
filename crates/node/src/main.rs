mod backend;
mod config;
mod import;
mod indexer;
mod txpool;

use chain::ChainReader;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use backend::Backend;
use config::{load_config_file, Cli, RuntimeConfig};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Load config file if specified.
    let config_file = match load_config_file(cli.config.as_ref()) {
        Ok(cf) => cf,
        Err(e) => {
            eprintln!("error loading config file: {}", e);
            std::process::exit(1);
        }
    };

    // Merge CLI and file config.
    let runtime_config = match RuntimeConfig::from_cli_and_file(&cli, config_file) {
        Ok(rc) => rc,
        Err(e) => {
            eprintln!("configuration error: {}", e);
            std::process::exit(1);
        }
    };

    // Initialize logging (after merge so config file log_level is respected).
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&runtime_config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let mut backend = match Backend::new(runtime_config) {
        Ok(backend) => backend,
        Err(e) => {
            eprintln!("node error: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = backend.start().await {
        eprintln!("node error: {}", e);
        backend.stop().await;
        std::process::exit(1);
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(err = %e, "failed to wait for shutdown signal");
    }
    info!(
        head = backend.chain().current_header().number,
        peers = backend.handler().peers().len(),
        pooled = backend.tx_pool().len(),
        bloom_sections = backend.bloom_sections(),
        "shutting down"
    );
    backend.stop().await;
}
