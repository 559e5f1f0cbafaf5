//! # Pending Queue Drain
//!
//! Replays every queued offline mutation against the backend once and
//! prints what happened.
//!
//! ## Usage
//! ```bash
//! # Drain everything using sync.toml and the environment
//! cargo run -p tally-sync --bin tally-drain
//!
//! # Use a specific config file and database
//! cargo run -p tally-sync --bin tally-drain -- --config ./sync.toml --store ./tally.db
//!
//! # Only one entity type
//! cargo run -p tally-sync --bin tally-drain -- --entity sales
//! ```
//!
//! Exits with status 1 if any queue could not be fully drained.

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use tally_sync::{
    init_tracing, ConnectivityFlag, EntityKind, SyncConfig, SyncServices, TracingObserver,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    let mut config_path: Option<PathBuf> = None;
    let mut store_path: Option<PathBuf> = None;
    let mut only: Option<EntityKind> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--store" | "-s" => {
                if i + 1 < args.len() {
                    store_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--entity" | "-e" => {
                if i + 1 < args.len() {
                    only = Some(args[i + 1].parse()?);
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("Tally Pending Queue Drain");
                println!();
                println!("Usage: tally-drain [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -c, --config <PATH>   Config file (default: platform config dir/sync.toml)");
                println!("  -s, --store <PATH>    Local database file (overrides config)");
                println!("  -e, --entity <NAME>   Drain only inventory, joints, sales or users");
                println!("  -h, --help            Show this help message");
                return Ok(());
            }
            other => {
                eprintln!("Ignoring unknown argument: {}", other);
            }
        }
        i += 1;
    }

    init_tracing();

    let mut config = SyncConfig::load(config_path)?;
    if let Some(path) = store_path {
        config.store.path = Some(path);
    }

    println!("Tally Pending Queue Drain");
    println!("=========================");
    println!("Backend: {}", config.remote.api_base);
    println!("Store:   {}", config.store_path()?.display());
    println!();

    let services = SyncServices::open(
        &config,
        Arc::new(ConnectivityFlag::new(true)),
        Arc::new(TracingObserver),
    )
    .await?;

    let kinds: Vec<EntityKind> = match only {
        Some(kind) => vec![kind],
        None => EntityKind::ALL.to_vec(),
    };

    for kind in &kinds {
        let pending = services.service(*kind).pending_count().await?;
        println!("  {:<10} {} pending", kind.to_string(), pending);
    }
    println!();

    let summary = services.drain_kinds(&kinds).await?;

    for report in &summary.reports {
        match &report.failure {
            None => println!(
                "✓ {:<10} confirmed {}, remaining {}",
                report.entity.to_string(),
                report.confirmed,
                report.remaining
            ),
            Some(failure) => println!(
                "✗ {:<10} confirmed {}, stopped at #{} ({}): {}",
                report.entity.to_string(),
                report.confirmed,
                failure.seq,
                failure.kind,
                failure.error
            ),
        }
    }
    for kind in &summary.busy {
        println!("… {:<10} already draining elsewhere", kind.to_string());
    }

    let skipped: Vec<String> = kinds
        .iter()
        .filter(|k| {
            !summary.reports.iter().any(|r| r.entity == **k) && !summary.busy.contains(*k)
        })
        .map(|k| k.to_string())
        .collect();
    if !skipped.is_empty() {
        println!("  deferred: {}", skipped.join(", "));
    }

    services.close().await;

    println!();
    if summary.is_complete() {
        println!("✓ Drain complete ({} confirmed)", summary.confirmed());
        Ok(())
    } else {
        println!("⚠ {} operation(s) still pending", summary.remaining());
        std::process::exit(1);
    }
}
