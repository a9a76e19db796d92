use std::process;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use nodepool::cli::{execute, load_cli_config, resolve_url, Cli, Commands, ServeArgs};
use nodepool::client::NodeManagerClient;
use nodepool::config::{PoolConfig, StoreBackend};
use nodepool::pool::NodePool;
use nodepool::server::{create_nodemanager_router, NodeManagerState, ROUTES};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    // Load .env file if specified
    if let Some(ref env_file) = cli.env_file {
        if let Err(e) = dotenvy::from_path(env_file) {
            error!("Failed to load env file {}: {}", env_file.display(), e);
            process::exit(1);
        }
    }

    let config = match load_cli_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load config: {}", e);
            process::exit(1);
        }
    };

    if let Commands::Serve(ref args) = cli.command {
        serve(config, args).await;
        return;
    }

    let client = NodeManagerClient::new(resolve_url(cli.url.as_deref(), &config));
    match execute(&cli.command, &client).await {
        Ok(output) => print!("{}", output),
        Err(e) => {
            error!("{}", e);
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}

async fn serve(mut config: PoolConfig, args: &ServeArgs) {
    if args.in_memory {
        config.store.backend = StoreBackend::Memory;
    }
    if let Some(seed) = args.seed {
        config.selection_seed = Some(seed);
    }

    let pool = match NodePool::from_config(&config) {
        Ok(pool) => pool,
        Err(e) => {
            error!("Failed to open node store: {}", e);
            process::exit(1);
        }
    };

    match pool.refresh_cache() {
        Ok(count) => info!("Loaded {} nodes", count),
        Err(e) => warn!("Initial cache load failed: {}", e),
    }

    let state = NodeManagerState::with_pool(Arc::new(pool));
    let app = create_nodemanager_router(state);

    let bind_addr = args.bind_addr.as_deref().unwrap_or(&config.server.bind_addr);
    let port = args.port.unwrap_or(config.server.port);
    let addr = format!("{}:{}", bind_addr, port);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            process::exit(1);
        }
    };

    info!("Nodemanager listening on {}", addr);
    info!("Endpoints:");
    for (method, path, description) in ROUTES {
        info!("  {:<5} {:<24} - {}", method, path, description);
    }

    if let Err(e) = axum::serve(listener, app).await {
        error!("Server error: {}", e);
        process::exit(1);
    }
}
