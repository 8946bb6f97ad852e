//! Single-process deployment running the scheduler and the worker together
//! over one queue connection.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use common::cli::{CommonArgs, CommonCommands, utils};
use common::shutdown;
use common::storage::create_object_store;
use common::store::create_metadata_store;
use messaging::{BackendConfig, Connector, MessagingBackend, connect_with_retry};
use scheduler::DeferredDeletionScheduler;
use worker::DeferredDeletionWorker;

#[derive(Parser, Debug)]
#[command(name = "sweeper")]
#[command(about = "Run the deferred deletion scheduler and worker in one process")]
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

    log::info!("Starting sweeper");

    let store = create_metadata_store(&config.metadata_store)
        .context("Failed to create metadata store client")?;
    let object_store =
        create_object_store(&config.storage).context("Failed to create object store")?;

    let (trigger, mut shutdown) = shutdown::channel();
    let signals = shutdown::spawn_signal_listener(trigger);

    let connector = BackendConfig::from_queue_config(&config.queue, config.worker.fetch_timeout);
    let Some(backend) =
        connect_with_retry(&connector, config.worker.reconnect_delay, &mut shutdown).await
    else {
        log::info!("Shutdown requested before the queue became reachable");
        return Ok(());
    };

    // The in-memory queue only exists inside this process, so both services
    // must share the one backend instead of each connecting on its own.
    let shared: Arc<dyn Connector> = Arc::new(Arc::clone(&backend) as Arc<dyn MessagingBackend>);

    let scheduler = DeferredDeletionScheduler::from_config(&config, Arc::clone(&store), backend);
    let worker = DeferredDeletionWorker::from_config(&config, store, object_store, shared);

    let scheduler_shutdown = shutdown.clone();
    let scheduler_handle = tokio::spawn(async move { scheduler.run(scheduler_shutdown).await });
    let worker_handle = tokio::spawn(async move { worker.run(shutdown).await });

    log::info!("All services started successfully");

    let stats = worker_handle.await.context("Worker task failed")?;
    log::info!(
        "Worker finished: {} processed, {} deleted",
        stats.processed,
        stats.deleted
    );
    scheduler_handle.await.context("Scheduler task failed")?;

    signals.abort();
    log::info!("Sweeper stopped");
    Ok(())
}
