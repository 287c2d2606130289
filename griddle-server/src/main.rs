use clap::Parser;
use griddle::{HttpPrimaryStore, HttpSearchIndex, SyncConfig, SyncOrchestrator};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "griddle")]
struct Cli {
    /// Directory holding sync.json (optional overrides).
    #[arg(long, env = "GRIDDLE_DATA_DIR", default_value = "./data")]
    data_dir: String,

    #[arg(long, env = "GRIDDLE_STORE_URL")]
    store_url: Option<String>,

    #[arg(long, env = "GRIDDLE_SEARCH_URL")]
    search_url: Option<String>,

    /// How often to re-run discovery so new tenant databases are picked up.
    #[arg(long, env = "GRIDDLE_DISCOVERY_INTERVAL_SECS", default_value = "60")]
    discovery_interval_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = SyncConfig::load_or_default(std::path::Path::new(&cli.data_dir));
    if let Some(url) = cli.store_url {
        config.store_url = url;
    }
    if let Some(url) = cli.search_url {
        config.search_url = url;
    }

    tracing::info!(
        "griddle starting: store={} search={} prefix={}",
        config.store_url,
        config.search_url,
        config.database_prefix
    );

    let store = Arc::new(HttpPrimaryStore::new(config.store_url.clone()));
    let search = Arc::new(HttpSearchIndex::new(config.search_url.clone()));
    let orchestrator = SyncOrchestrator::new(store, search, config);
    griddle::set_global_orchestrator(Arc::clone(&orchestrator));

    let mut discovery_interval =
        tokio::time::interval(Duration::from_secs(cli.discovery_interval_secs.max(1)));

    loop {
        tokio::select! {
            _ = discovery_interval.tick() => {
                if let Err(e) = orchestrator.discover_and_watch_all().await {
                    // The store being briefly unreachable is not fatal; the
                    // next pass retries.
                    tracing::warn!("discovery pass failed: {}", e);
                }
                let status = orchestrator.status();
                tracing::info!(
                    "watching {} databases, {} operations pending",
                    status.databases.len(),
                    status.pending_operations
                );
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
                break;
            }
        }
    }

    orchestrator.shutdown().await;
    Ok(())
}
