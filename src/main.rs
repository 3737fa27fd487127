//! Routecast - live driver tracking server

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use routecast::{
    AppState, Collaborators, Config, Hub, MemoryLocationStore, MemoryOrderDirectory,
    SignedTokenResolver, directory::OrderDirectory, server, store::LocationStore,
};

#[cfg(feature = "postgres")]
use routecast::PostgresLocationStore;

#[derive(Parser, Debug)]
#[command(name = "routecast")]
#[command(about = "Live driver tracking and dispatch over WebSockets")]
#[command(version)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Listen address, overrides ROUTECAST_BIND
    #[arg(short, long)]
    bind: Option<SocketAddr>,
}

async fn init_store(config: &Config) -> anyhow::Result<Arc<dyn LocationStore>> {
    #[cfg(feature = "postgres")]
    {
        if let Some(ref db_url) = config.database_url {
            let store = PostgresLocationStore::connect(db_url, None)
                .await
                .context("failed to connect PostgreSQL location store")?;
            info!("PostgreSQL location store connected");
            return Ok(Arc::new(store));
        }
    }

    #[cfg(not(feature = "postgres"))]
    {
        if config.database_url.is_some() {
            warn!("ROUTECAST_DATABASE_URL is set but the postgres feature is disabled");
        }
    }

    info!("Memory location store initialized (single-node only)");
    Ok(Arc::new(MemoryLocationStore::new()))
}

fn init_directory(config: &Config) -> anyhow::Result<Arc<dyn OrderDirectory>> {
    let directory = match config.seed_path {
        Some(ref path) => MemoryOrderDirectory::from_seed_file(path)
            .with_context(|| format!("failed to load order seed {}", path.display()))?,
        None => {
            warn!("No ROUTECAST_SEED given - order directory starts empty");
            MemoryOrderDirectory::new()
        }
    };
    Ok(Arc::new(directory))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(&args.log_level)
        .init();

    info!("Routecast v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load config: {}", e);
            error!("Required env vars: ROUTECAST_IDENTITY_SECRET");
            std::process::exit(1);
        }
    };
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }

    let collaborators = Collaborators {
        identity: Arc::new(SignedTokenResolver::new(&config.identity_secret)),
        directory: init_directory(&config)?,
        store: init_store(&config).await?,
    };

    let hub = Arc::new(Hub::new(collaborators, config.hub));
    let state = AppState {
        hub,
        ping_interval: config.ping_interval,
    };

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    info!(
        bind = %config.bind_addr,
        geofence = ?config.hub.signals.policy,
        "Starting Routecast"
    );

    server::serve(listener, state, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received");
    })
    .await
    .context("server error")?;

    info!("Routecast stopped");
    Ok(())
}
