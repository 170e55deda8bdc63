//! Sync probe
//!
//! Signs in as a role, replicates one context for a while and prints what
//! landed locally. Useful for checking a server's sync endpoints, or with
//! `--offline` for exercising the replication path without a server.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde_json::json;
use tracing_subscriber::EnvFilter;

use hospital_sync_core::sync::RemoteConnector;
use hospital_sync_core::{Identity, InMemoryRemote, Role, SyncConfig, SyncContext, SyncSession};

#[derive(Parser)]
#[command(name = "sync-probe", about = "Replicate one role/context and report the local store")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "sync.toml")]
    config: PathBuf,

    /// Remote base URL override
    #[arg(long)]
    base_url: Option<String>,

    /// Store directory override
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Role to sign in as
    #[arg(short, long, default_value = "admin")]
    role: String,

    /// Bearer token
    #[arg(short, long, default_value = "")]
    token: String,

    /// Context to switch to after the initial sync
    #[arg(long)]
    context: Option<String>,

    /// Seconds to keep replicating before reporting
    #[arg(long, default_value_t = 5)]
    seconds: u64,

    /// Replicate against a seeded in-process remote; stores stay in memory
    /// unless --data-dir is given
    #[arg(long)]
    offline: bool,
}

fn seeded_remote() -> InMemoryRemote {
    let remote = InMemoryRemote::new();
    remote.upsert("patients", 1, json!({"first_name": "Grace", "last_name": "Hopper"}));
    remote.upsert("patients", 2, json!({"first_name": "Alan", "last_name": "Turing"}));
    remote.upsert("beds", "B-101", json!({"bed_number": "101", "ward": "North", "status": "available"}));
    remote.upsert("dashboard_stats", "today", json!({"admissions": 4, "discharges": 1}));
    remote
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();

    let mut cfg = if cli.config.exists() {
        SyncConfig::load(&cli.config)?
    } else {
        tracing::info!("No config file found, using defaults");
        SyncConfig::default()
    };
    if let Some(base_url) = cli.base_url {
        cfg.base_url = base_url;
    }
    match cli.data_dir {
        Some(data_dir) => {
            cfg.data_dir = Some(data_dir);
            cfg.in_memory = false;
        }
        None if cli.offline => cfg.in_memory = true,
        None => {}
    }
    cfg.validate()?;

    let role: Role = cli.role.parse()?;
    let context: Option<SyncContext> = cli.context.as_deref().map(str::parse).transpose()?;

    let session = if cli.offline {
        let connector: Arc<dyn RemoteConnector> = Arc::new(seeded_remote());
        SyncSession::new(cfg, connector)
    } else {
        tracing::info!("Replicating against {}", cfg.base_url);
        SyncSession::with_http(cfg)
    };

    session.bind(Identity::new(role, cli.token)).await?;
    session.settled().await;
    if let Some(context) = context {
        session.switch_context(context).await?;
    }

    tokio::time::sleep(Duration::from_secs(cli.seconds)).await;

    let status = session.status();
    println!("role:     {}", role);
    println!(
        "context:  {}",
        status.current_context.map(|c| c.to_string()).unwrap_or_else(|| "-".into())
    );
    if let Some(error) = &status.last_sync_error {
        println!("last err: {}", error);
    }

    let store = session.store().context("store closed during probe")?;
    let pending = session.pending_changes().await?;
    println!();
    println!("{:<20} {:>8} {:>8}", "collection", "docs", "pending");
    for (collection, pending) in pending {
        println!("{:<20} {:>8} {:>8}", collection, store.count(collection)?, pending);
    }

    session.sign_out(false).await?;
    Ok(())
}
