//! PartSync relay server entry point.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use relay_store::SyncStore;
use relay_server::{app, dashboard, RelayState};
use sync_core::constants::DEFAULT_PORT;
use sync_core::now_ms;

#[derive(Parser)]
#[command(name = "partsync-relay")]
#[command(about = "Central relay for diff-based project synchronization")]
#[command(version)]
struct Args {
    /// Port to listen on
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// SQLite database path
    #[arg(long, default_value = ".partsync/sync.db")]
    db: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay_server=debug,sync_core=debug".into()),
        )
        .init();

    let args = Args::parse();

    // Only storage-init failure is allowed to kill the process.
    let store = SyncStore::open(&args.db)
        .with_context(|| format!("failed to open database at {}", args.db.display()))?;
    info!(db = %args.db.display(), "store opened");

    let state = Arc::new(RelayState::new(store, args.port));
    {
        let store = state.store.lock();
        state.locks.restore_from_store(&store, now_ms())?;
    }

    dashboard::spawn_dashboard_task(state.clone());
    dashboard::spawn_lock_sweeper(state.clone());

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("relay listening on http://{addr}");

    axum::serve(listener, app(state)).await?;
    Ok(())
}
