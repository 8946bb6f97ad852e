use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Common CLI arguments shared across all binaries
#[derive(Parser, Debug, Clone, Default)]
pub struct CommonArgs {
    #[arg(long, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(short, long, help = "Enable quiet mode (minimal output)")]
    pub quiet: bool,
}

/// Common subcommands available for the long-running services
#[derive(Subcommand, Debug, Clone, Default)]
pub enum CommonCommands {
    /// Start the service (default behavior)
    #[default]
    Start,
    /// Show current configuration and exit
    Config {
        #[arg(long, help = "Show configuration in JSON format")]
        json: bool,
    },
    /// Validate configuration and exit
    Validate,
    /// Show version information and exit
    Version,
}

/// Utility functions for CLI operations
pub mod utils {
    use super::*;
    use crate::config::Configuration;
    use anyhow::{Context, Result};
    use tracing_subscriber::EnvFilter;

    /// Level used when `RUST_LOG` is unset
    pub fn default_level(args: &CommonArgs) -> &'static str {
        if args.quiet {
            "warn"
        } else if args.verbose {
            "debug"
        } else {
            "info"
        }
    }

    /// Initialize logging based on CLI arguments.
    ///
    /// `--quiet` and `--verbose` win over `RUST_LOG`.
    pub fn init_logging(args: &CommonArgs) {
        let filter = if args.quiet || args.verbose {
            EnvFilter::new(default_level(args))
        } else {
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_level(args)))
        };

        // A second init (tests, monolith) keeps the first subscriber
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    }

    /// Load configuration with optional override from CLI
    pub fn load_config(config_path: Option<&PathBuf>) -> Result<Configuration> {
        match config_path {
            Some(path) => {
                log::info!("Loading configuration from: {}", path.display());
                Configuration::load_from_path(path).context("Failed to load configuration")
            }
            None => Configuration::load().context("Failed to load configuration"),
        }
    }

    /// Display configuration in human-readable or JSON format
    pub fn display_config(config: &Configuration, json: bool) -> Result<()> {
        if json {
            let json = serde_json::to_string_pretty(&redacted(config))
                .context("Failed to serialize configuration to JSON")?;
            println!("{json}");
        } else {
            println!("Sweeper Configuration:");
            println!("======================");
            println!("Metadata store: {}", config.metadata_store.endpoint);
            println!("List page size: {}", config.metadata_store.max_keys);
            println!(
                "Bucket list index: {} / {}",
                config.indexes.global_bucket_index_id, config.indexes.global_bucket_index_id_replica
            );
            println!(
                "Bucket metadata index: {} / {}",
                config.indexes.bucket_metadata_index_id,
                config.indexes.bucket_metadata_index_id_replica
            );
            println!(
                "Probable delete index: {}",
                config.indexes.probable_delete_index_id
            );
            println!(
                "Object metadata index: {}",
                config.indexes.object_metadata_index_id
            );
            match &config.indexes.global_instance_index_id {
                Some(id) => println!("Instance index: {id}"),
                None => println!("Instance index: disabled"),
            }
            println!(
                "Queue: {:?} {} (topic {}, durable {})",
                config.queue.backend, config.queue.url, config.queue.topic, config.queue.durable
            );
            println!("Schedule interval: {:?}", config.scheduler.interval);
            println!("Reconnect delay: {:?}", config.worker.reconnect_delay);
            println!("Daemon mode: {}", config.worker.daemon_mode);
            println!("Storage DSN: {}", config.storage.dsn);
        }
        Ok(())
    }

    fn redacted(config: &Configuration) -> Configuration {
        let mut config = config.clone();
        if !config.metadata_store.secret_key.is_empty() {
            config.metadata_store.secret_key = "********".to_string();
        }
        if config.queue.password.is_some() {
            config.queue.password = Some("********".to_string());
        }
        config
    }

    /// Validate configuration and report any issues
    pub fn validate_config(config: &Configuration) -> Result<()> {
        log::info!("Validating configuration...");
        config.validate()?;
        log::info!("✅ Configuration validation passed");
        Ok(())
    }

    /// Handle common CLI commands that don't require starting services
    pub async fn handle_common_command(
        command: &CommonCommands,
        config: &Configuration,
    ) -> Result<bool> {
        match command {
            CommonCommands::Config { json } => {
                display_config(config, *json)?;
                Ok(true)
            }
            CommonCommands::Validate => {
                validate_config(config)?;
                Ok(true)
            }
            CommonCommands::Version => {
                println!("{}", version_info());
                Ok(true)
            }
            CommonCommands::Start => Ok(false),
        }
    }

    /// Standard version information
    pub fn version_info() -> String {
        format!(
            "{} {} ({})",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            env!("CARGO_PKG_RUST_VERSION")
        )
    }

}
