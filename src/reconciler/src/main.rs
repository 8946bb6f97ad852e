use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgGroup, Parser};
use common::cli::{CommonArgs, utils};
use common::store::create_metadata_store;
use reconciler::{IndexReconciler, RecoverySummary, ReplicaPair, prompt};

#[derive(Parser)]
#[command(name = "sweeper-reconcile")]
#[command(about = "Compare and repair the primary and replica bucket indexes")]
#[command(version)]
#[command(group(ArgGroup::new("mode").required(true).args(["dry_run", "recover", "interactive"])))]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    /// Report divergence without writing anything
    #[arg(long, alias = "dry_run")]
    dry_run: bool,

    /// Restore both pairs and remove inconsistent entries
    #[arg(long)]
    recover: bool,

    /// Like --recover, confirming every write and delete
    #[arg(long)]
    interactive: bool,

    /// Answer used for an empty reply in interactive mode
    #[arg(long, requires = "interactive")]
    default_yes: bool,
}

fn exit_code(listing_failed: bool) -> ExitCode {
    if listing_failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn print_summary(summary: &RecoverySummary) {
    for report in &summary.reports {
        println!("{report}");
    }
    println!("{summary}");
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    utils::init_logging(&cli.common);

    let config = utils::load_config(cli.common.config.as_ref())?;
    config.validate().context("Invalid configuration")?;

    let store = create_metadata_store(&config.metadata_store)
        .context("Failed to create metadata store client")?;
    let reconciler = IndexReconciler::new(Arc::clone(&store), config.metadata_store.max_keys);

    if cli.dry_run {
        log::info!("Running dry run, no index will be modified");
        let pairs = [
            ReplicaPair::bucket_list(&config.indexes),
            ReplicaPair::bucket_metadata(&config.indexes),
        ];

        let mut listing_failed = false;
        for pair in &pairs {
            let report = reconciler.dry_run(pair).await;
            listing_failed |= report.failed_side().is_some();
            println!("{report}");
        }
        return Ok(exit_code(listing_failed));
    }

    let summary = if cli.interactive {
        let mut confirm = prompt::stdin_confirm(cli.default_yes);
        reconciler
            .interactive_recover(&config.indexes, &mut confirm)
            .await
    } else {
        reconciler.recover(&config.indexes).await
    };

    print_summary(&summary);
    if summary.listing_failed() {
        log::error!("Recovery incomplete: an index could not be listed");
    } else {
        log::info!("Recovery finished");
    }

    Ok(exit_code(summary.listing_failed()))
}
