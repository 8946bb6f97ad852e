//! Deferred deletion worker service
//!
//! Consumes deletion jobs and removes object data that is confirmed orphaned.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use common::cli::{CommonArgs, CommonCommands, utils};
use common::shutdown;
use common::storage::create_object_store;
use common::store::create_metadata_store;
use messaging::BackendConfig;
use worker::DeferredDeletionWorker;

#[derive(Parser, Debug)]
#[command(name = "sweeper-worker")]
#[command(about = "Delete orphaned object data announced on the deletion queue")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    /// Drain the queued jobs and exit, overriding `worker.daemon_mode`
    #[arg(long)]
    drain: bool,

    #[command(subcommand)]
    command: Option<CommonCommands>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    utils::init_logging(&cli.common);

    let mut config = utils::load_config(cli.common.config.as_ref())?;
    let command = cli.command.unwrap_or_default();
    if utils::handle_common_command(&command, &config).await? {
        return Ok(());
    }
    config.validate().context("Invalid configuration")?;
    if cli.drain {
        config.worker.daemon_mode = false;
    }

    log::info!("Starting deferred deletion worker");

    let store = create_metadata_store(&config.metadata_store)
        .context("Failed to create metadata store client")?;
    let object_store =
        create_object_store(&config.storage).context("Failed to create object store")?;
    let connector = Arc::new(BackendConfig::from_queue_config(
        &config.queue,
        config.worker.fetch_timeout,
    ));

    let (trigger, shutdown) = shutdown::channel();
    let signals = shutdown::spawn_signal_listener(trigger);

    let worker = DeferredDeletionWorker::from_config(&config, store, object_store, connector);
    let stats = worker.run(shutdown).await;

    signals.abort();
    log::info!(
        "Worker stopped: {} processed, {} deleted, {} retired, {} kept, {} undecodable",
        stats.processed,
        stats.deleted,
        stats.retired,
        stats.kept,
        stats.undecodable
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_flag() {
        let cli =
            Cli::try_parse_from(["sweeper-worker", "--drain", "--config", "sweeper.toml"]).unwrap();
        assert!(cli.drain);
        assert!(cli.command.is_none());
    }
}
