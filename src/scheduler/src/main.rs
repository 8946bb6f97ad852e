//! Deferred deletion scheduler service
//!
//! Republishes the probable-delete index to the deletion queue on a fixed schedule.

use anyhow::{Context, Result};
use clap::Parser;
use common::cli::{CommonArgs, CommonCommands, utils};
use common::shutdown;
use common::store::create_metadata_store;
use messaging::{BackendConfig, connect_with_retry};
use scheduler::DeferredDeletionScheduler;

#[derive(Parser, Debug)]
#[command(name = "sweeper-scheduler")]
#[command(about = "Publish probable-delete records to the deletion queue")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Option<CommonCommands>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    utils::init_logging(&cli.common);

    let config = utils::load_config(cli.common.config.as_ref())?;
    let command = cli.command.unwrap_or_default();
    if utils::handle_common_command(&command, &config).await? {
        return Ok(());
    }
    config.validate().context("Invalid configuration")?;

    log::info!("Starting deferred deletion scheduler");

    let store = create_metadata_store(&config.metadata_store)
        .context("Failed to create metadata store client")?;

    let (trigger, mut shutdown) = shutdown::channel();
    let signals = shutdown::spawn_signal_listener(trigger);

    let connector = BackendConfig::from_queue_config(&config.queue, config.worker.fetch_timeout);
    let Some(backend) =
        connect_with_retry(&connector, config.worker.reconnect_delay, &mut shutdown).await
    else {
        log::info!("Shutdown requested before the queue became reachable");
        return Ok(());
    };

    let scheduler = DeferredDeletionScheduler::from_config(&config, store, backend);
    scheduler.run(shutdown).await;

    signals.abort();
    log::info!("Scheduler stopped");
    Ok(())
}
