//! `media` command-line tool

use std::sync::Arc;

use clap::Parser;
use media_core::{init_tracing, MediaConfig};
use media_stores::{FileSystemStore, StoreRegistry};
use tracing::{info, warn};

mod cli;
mod commands;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();

    let mut config = match cli.config.as_deref() {
        Some(path) => MediaConfig::load(Some(path))?,
        None => MediaConfig::from_env().unwrap_or_else(|e| {
            eprintln!("Failed to load config from env: {}, using defaults", e);
            MediaConfig::default()
        }),
    };
    if cli.verbose {
        config.logging.filter = "debug".to_string();
    }
    init_tracing(&config.logging);

    let store = FileSystemStore::new(&config.storage.root_path, config.storage.base_url.clone());
    StoreRegistry::global().register_instance(config.storage.store_name.clone(), Arc::new(store), true);
    info!(
        store = %config.storage.store_name,
        root = %config.storage.root_path,
        "Filesystem store registered"
    );
    if !config.attachments.delete_orphan {
        warn!("delete_orphan is disabled; replaced attachments stay in storage");
    }

    commands::run_command(cli, &config).await
}
