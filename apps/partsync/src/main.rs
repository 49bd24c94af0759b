//! PartSync client: watches a project directory and keeps it in sync with
//! the other endpoints through the relay.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

mod engine;
mod transport;
mod watcher;

use engine::SyncEngine;
use transport::{spawn_transport, ws_url};

#[derive(Parser)]
#[command(name = "partsync")]
#[command(about = "Diff-based project synchronization client")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch a directory and sync it through the relay
    Start {
        /// Relay base URL
        #[arg(long, default_value = "http://127.0.0.1:3777")]
        server: String,

        /// Project directory to sync
        #[arg(long, default_value = ".")]
        dir: PathBuf,

        /// Display name announced to peers
        #[arg(long)]
        name: Option<String>,

        /// Additional ignore patterns (glob)
        #[arg(long)]
        ignore: Vec<String>,
    },

    /// Query relay health
    Status {
        #[arg(long, default_value = "http://127.0.0.1:3777")]
        server: String,
    },

    /// Acquire a soft lock on a file
    Lock {
        file: String,

        #[arg(long, default_value = "http://127.0.0.1:3777")]
        server: String,

        #[arg(long)]
        name: Option<String>,
    },

    /// Release a soft lock on a file
    Unlock {
        file: String,

        #[arg(long, default_value = "http://127.0.0.1:3777")]
        server: String,

        #[arg(long)]
        name: Option<String>,
    },
}

fn default_name() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "anonymous".to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "partsync=debug,sync_core=debug".into()),
        )
        .init();

    match Cli::parse().command {
        Commands::Start {
            server,
            dir,
            name,
            ignore,
        } => {
            let name = name.unwrap_or_else(default_name);
            run_start(server, dir, name, ignore).await
        }
        Commands::Status { server } => run_status(server).await,
        Commands::Lock { file, server, name } => {
            transport::lock_command(&server, &name.unwrap_or_else(default_name), &file, true).await
        }
        Commands::Unlock { file, server, name } => {
            transport::lock_command(&server, &name.unwrap_or_else(default_name), &file, false).await
        }
    }
}

async fn run_start(
    server: String,
    dir: PathBuf,
    name: String,
    extra_ignore: Vec<String>,
) -> anyhow::Result<()> {
    let root = dir
        .canonicalize()
        .with_context(|| format!("project directory {} not found", dir.display()))?;
    info!(root = %root.display(), client = %name, "starting sync");

    let (watch_tx, watch_rx) = tokio::sync::mpsc::unbounded_channel();
    // Dropped on exit; keeps the notify watcher alive until then.
    let _debouncer = watcher::start_watcher(&root, watch_tx)?;

    let (net_out_tx, net_out_rx) = tokio::sync::mpsc::unbounded_channel();
    let (net_event_tx, net_event_rx) = tokio::sync::mpsc::unbounded_channel();
    spawn_transport(ws_url(&server, &name), net_out_rx, net_event_tx);

    let mut engine = SyncEngine::new(root, name, extra_ignore, net_out_tx)?;
    engine.initial_scan();
    engine.run(watch_rx, net_event_rx).await;
    Ok(())
}

async fn run_status(server: String) -> anyhow::Result<()> {
    let url = format!("{}/health", server.trim_end_matches('/'));
    let health: serde_json::Value = reqwest::get(&url)
        .await
        .with_context(|| format!("relay unreachable at {url}"))?
        .json()
        .await?;

    println!(
        "{} {} v{} (up {})",
        health["status"].as_str().unwrap_or("unknown"),
        health["name"].as_str().unwrap_or("?"),
        health["version"].as_str().unwrap_or("?"),
        health["uptimeHuman"].as_str().unwrap_or("?"),
    );
    Ok(())
}
