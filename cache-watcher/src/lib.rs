pub mod cli;
pub mod config;

use anyhow::{bail, Context, Result};
use cache_connector::{AddressListener, ListenerError, ListenerHandle, ListenerManager};
use clap::Parser;
use cli::{Cli, Commands};
use config::{load_config, WatcherConfig};
use std::io::Write;
use std::sync::Arc;
use tokio::{signal, sync::broadcast, task::JoinSet};

/// The main entry point for the watcher.
/// This function handles CLI parsing, configuration, and service startup.
pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    let config = match cli.command {
        Commands::Run(run_cmd) => load_config_from_cli(run_cmd)?,
        Commands::Watch(watch_cmd) => WatcherConfig::from_watch(watch_cmd),
    };
    cache_logger::init(&config.watcher.log)?;
    tracing::info!("Configuration loaded: {:#?}", &config);
    watch(config).await
}

fn load_config_from_cli(run_cmd: cli::RunCmd) -> Result<WatcherConfig> {
    if let Some(config_path) = run_cmd.config {
        println!("Loading configuration from '{}'", &config_path);
        load_config(&config_path)
    } else {
        println!("No config file provided, using default settings.");
        Ok(WatcherConfig::default())
    }
}

/// Subscribes every configured address and prints transfers until Ctrl+C
/// or until the node connection is lost for good.
async fn watch(config: WatcherConfig) -> Result<()> {
    if config.watcher.addresses.is_empty() {
        bail!("No addresses to watch");
    }

    let (manager, handle) = ListenerManager::with_websocket(Arc::new(config.connector));
    let pipeline = tokio::spawn(manager.run());
    let errors = handle.errors();

    let mut printers = JoinSet::new();
    for address in config.watcher.addresses {
        let listener = handle
            .listen(address.clone())
            .await
            .with_context(|| format!("Failed to watch {}", address))?;
        tracing::info!(address = %address, "Watching address");
        printers.spawn(print_transfers(listener));
    }

    let outcome = wait_for_exit(errors).await;
    shutdown(&handle).await;
    printers.shutdown().await;
    if let Err(e) = pipeline.await {
        tracing::error!(error = %e, "Pipeline task failed");
    }
    outcome
}

async fn wait_for_exit(mut errors: broadcast::Receiver<ListenerError>) -> Result<()> {
    loop {
        tokio::select! {
            signal = signal::ctrl_c() => {
                signal.context("Failed to listen for shutdown signal")?;
                tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
                return Ok(());
            }
            error = errors.recv() => match error {
                Ok(ListenerError::SessionLost { attempts, error }) => {
                    bail!("Lost the node connection after {} attempts: {}", attempts, error);
                }
                Ok(other) => tracing::warn!("{}", other),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Skipped {} listener errors", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            },
        }
    }
}

async fn shutdown(handle: &ListenerHandle) {
    handle.stop().await;
    let stats = handle.stats();
    tracing::info!(
        emitted = stats.emitted,
        duplicates = stats.duplicates_suppressed,
        expired = stats.expired,
        "Shutdown complete."
    );
}

async fn print_transfers(mut listener: AddressListener) {
    while let Some(transfer) = listener.next_transfer().await {
        match serde_json::to_string(&transfer) {
            Ok(line) => {
                let mut stdout = std::io::stdout().lock();
                if writeln!(stdout, "{}", line).is_err() {
                    return;
                }
            }
            Err(e) => tracing::error!(error = %e, "Failed to encode transfer"),
        }
    }
}
