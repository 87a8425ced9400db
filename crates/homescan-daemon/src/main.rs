//! Homescan Daemon - Main entry point
//!
//! Registers one discovery scope per configured bridge and runs background
//! discovery until interrupted.

mod config;

use anyhow::Result;
use clap::Parser;
use homescan_core::{Inbox, ThingRegistry};
use homescan_discovery::{DiscoveryEngine, DiscoveryEvent, ScanOutcome};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "homescan")]
#[command(about = "Home device discovery daemon")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "homescan.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Run a single scan of every scope and exit
    #[arg(long)]
    scan_once: bool,

    /// Write a default configuration to the config path and exit
    #[arg(long)]
    init: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Homescan v{}", env!("CARGO_PKG_VERSION"));

    if args.init {
        config::save_default_config(&args.config)?;
        info!(path = %args.config.display(), "Wrote default configuration");
        return Ok(());
    }

    let config = config::load_config(&args.config)?;
    if config.scopes.is_empty() {
        warn!("No scopes configured, nothing to discover");
    }

    let registry = Arc::new(ThingRegistry::new());
    let inbox = Arc::new(Inbox::new(registry.clone()).with_auto_approve(config.daemon.auto_approve));
    let engine = DiscoveryEngine::new(registry.clone(), inbox.clone())
        .with_initial_delay(Duration::from_secs(config.daemon.initial_delay_secs));

    for scope in &config.scopes {
        engine
            .register_scope(scope.to_scan_scope(&config.daemon), scope.probe.build())
            .await?;
    }

    if args.scan_once {
        // Single scan mode
        info!("Running single discovery scan");
        let mut handles = Vec::new();
        for scope in &config.scopes {
            if let Some(handle) = engine.start_manual_scan(&scope.scope_id()).await? {
                handles.push(handle);
            }
        }
        for handle in handles {
            if let Some(report) = handle.finished().await {
                println!(
                    "{}: {} ({} candidates, {} new, {} dropped)",
                    report.scope, report.outcome, report.candidates, report.published, report.dropped
                );
            }
        }

        let entries = inbox.entries().await;
        println!("Discovered {} devices:", entries.len());
        for entry in entries {
            let result = entry.result;
            println!("  - {} ({}) under {}", result.label, result.thing_id, result.parent_id);
            let mut properties: Vec<_> = result.properties.iter().collect();
            properties.sort_by(|a, b| a.0.cmp(b.0));
            for (key, value) in properties {
                println!("    {}: {}", key, value);
            }
        }
    } else {
        // Daemon mode - background discovery until Ctrl-C
        let events = engine.subscribe();
        tokio::spawn(log_events(events));

        for scope in config.scopes.iter().filter(|s| s.background) {
            engine
                .enable_background_scanning(&scope.scope_id(), scope.interval(&config.daemon))
                .await?;
        }

        tokio::signal::ctrl_c().await?;
        info!("Shutting down");
        engine.shutdown().await;
        info!(registered = registry.len().await, pending = inbox.entries().await.len(), "Discovery stopped");
    }

    Ok(())
}

async fn log_events(mut events: tokio::sync::broadcast::Receiver<DiscoveryEvent>) {
    loop {
        match events.recv().await {
            Ok(DiscoveryEvent::ResultPublished(result)) => {
                debug!(scope = %result.parent_id, thing = %result.thing_id, "Result published");
            }
            Ok(DiscoveryEvent::ScanFinished(report)) if report.outcome == ScanOutcome::Completed && report.published > 0 => {
                info!(scope = %report.scope, published = report.published, "New devices discovered");
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => warn!(skipped = skipped, "Event listener lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}
