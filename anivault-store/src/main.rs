use std::path::PathBuf;
use std::time::Duration;

use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use anivault_store::config::StoreConfig;
use anivault_store::{bootstrap, Store};

const DEFAULT_CONFIG_PATH: &str = "anivault.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    let config_path = PathBuf::from(
        std::env::var("ANIVAULT_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string()),
    );
    let config = StoreConfig::load(&config_path)?;
    let store = bootstrap(&config)?;

    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("health") => run_health(&store).await,
        Some("backup") => run_manual_backup(&store, args.get(2).cloned()).await,
        _ => run_daemon(&store).await,
    }
}

async fn run_health(store: &Store) -> anyhow::Result<()> {
    // Force the lazy connection attempt so the snapshot is meaningful.
    let _ = store.conn.acquire().await;
    println!("{}", serde_json::to_string_pretty(&store.conn.health())?);
    Ok(())
}

async fn run_manual_backup(store: &Store, message: Option<String>) -> anyhow::Result<()> {
    store.backup.trigger(message);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(120);
    loop {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let status = store.scheduler.status();
        if status.runs > 0 || status.last_error.is_some() {
            println!("{}", serde_json::to_string_pretty(&status)?);
            if let Some(err) = status.last_error {
                anyhow::bail!("backup failed: {err}");
            }
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("backup did not complete within 120s");
        }
    }
}

async fn run_daemon(store: &Store) -> anyhow::Result<()> {
    info!("anivault-store starting");
    let _ = store.conn.acquire().await;
    let health = store.conn.health();
    info!(state = ?health.state, "Primary store health resolved");

    signal::ctrl_c().await?;
    info!("Shutting down");
    Ok(())
}
