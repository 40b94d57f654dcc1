//! uguu spider
//!
//! Scans every due share once, then exits. Meant to be started
//! periodically.
//!
//! Usage:
//!     uguu-spider --config ~/.uguu/spider.toml
//!     uguu-spider rehash

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use uguu_db::UguuDb;
use uguu_logging::{init_logging, LogConfig};
use uguu_spider::{rehash, Spider, SpiderConfig};

#[derive(Parser, Debug)]
#[command(name = "uguu-spider", about = "Scan network shares into the uguu catalog")]
struct Args {
    /// Configuration file (default: $UGUU_HOME/spider.toml if present)
    #[arg(long, env = "UGUU_SPIDER_CONFIG")]
    config: Option<PathBuf>,

    /// Catalog database, overrides the configuration
    #[arg(long)]
    database: Option<PathBuf>,

    /// Baseline directory, overrides the configuration
    #[arg(long)]
    save_dir: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Recompute tree digests from the saved baselines
    Rehash,
}

fn load_config(args: &Args) -> anyhow::Result<SpiderConfig> {
    let path = match &args.config {
        Some(path) => Some(path.clone()),
        None => {
            let default = uguu_logging::uguu_home().join("spider.toml");
            default.is_file().then_some(default)
        }
    };

    let mut config = match path {
        Some(path) => SpiderConfig::load(&path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => SpiderConfig::default(),
    };
    if let Some(database) = &args.database {
        config.database_path = database.clone();
    }
    if let Some(save_dir) = &args.save_dir {
        config.save_dir = save_dir.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(LogConfig {
        app_name: "uguu-spider",
        verbose: args.verbose,
        log_dir: None,
    })?;

    let config = load_config(&args)?;
    config.ensure_save_dir()?;

    tracing::info!("Starting uguu spider");
    tracing::info!("  Database: {}", config.database_path.display());
    tracing::info!("  Baselines: {}", config.save_dir.display());

    let db = UguuDb::open(&config.database_path)
        .await
        .with_context(|| format!("failed to open {}", config.database_path.display()))?;

    match args.command {
        Some(Command::Rehash) => {
            rehash(&db, &config.save_dir).await?;
        }
        None => {
            let spider = Spider::new(db.clone(), Arc::new(config)).await?;
            spider.run().await;
        }
    }

    db.close().await;
    Ok(())
}
