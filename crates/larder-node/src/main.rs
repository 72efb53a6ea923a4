//! Larder Node - Hybrid storage tier for restaurant operations data.
//!
//! Runs the storage tier and its background migration worker, or performs a
//! single operator action against the on-disk tiers.

use clap::{Parser, Subcommand};
use larder_types::Collection;
use std::path::PathBuf;

mod config;
mod node;
mod observability;

use config::LarderConfig;
use observability::{init_logging, LogFormat};

/// Larder Node - capacity-bounded primary store with archive spill
#[derive(Parser, Debug)]
#[command(name = "larder-node")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (YAML or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log format (pretty, json)
    #[arg(long)]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the tier and its migration worker until interrupted (default)
    Serve,
    /// Migrate one batch of the oldest records in a collection
    ArchiveNow {
        /// Collection to migrate (orders, menu_items, users)
        collection: Collection,
    },
    /// Print capacity and tier statistics
    Stats,
    /// Complete migrations interrupted by a crash
    Resume,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = LarderConfig::load(args.config.as_deref())?;
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if let Some(format) = args.log_format.as_deref() {
        config.logging.format = LogFormat::parse(format);
    }

    init_logging(&config.logging.level, config.logging.format);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Larder node");
    tracing::info!(
        archive_dir = %config.storage.archive_dir.display(),
        journal = %config.storage.journal_path.display(),
        max_capacity = config.storage.capacity.max_capacity,
        threshold = config.storage.capacity.threshold,
        "Node configuration"
    );

    let store = node::open(&config.storage).await?;

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => node::serve(store).await,
        Command::ArchiveNow { collection } => node::archive_now(store, collection).await,
        Command::Stats => node::stats(store).await,
        Command::Resume => node::resume(store).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Args::command().debug_assert();
    }

    #[test]
    fn archive_now_parses_collection() {
        let args = Args::try_parse_from(["larder-node", "archive-now", "menu-items"]).unwrap();
        assert!(matches!(
            args.command,
            Some(Command::ArchiveNow {
                collection: Collection::MenuItems
            })
        ));
    }

    #[test]
    fn unknown_collection_is_rejected() {
        assert!(Args::try_parse_from(["larder-node", "archive-now", "tables"]).is_err());
    }
}
