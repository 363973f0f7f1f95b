//! Roster Cache maintenance tool
//!
//! Inspects and purges the local snapshot cache used by roster-sync.
//!
//! ## Usage
//!
//! ```bash
//! # List cached scopes with age and staleness
//! roster-cache stats
//!
//! # Drop every cached attendance week
//! roster-cache purge --collection attendance
//!
//! # Drop everything
//! roster-cache purge
//!
//! # Print the effective configuration
//! roster-cache --config /path/to/roster.toml config
//! ```

use anyhow::{anyhow, Context};
use chrono::Utc;
use clap::{Parser, Subcommand};
use roster_sync::{Collection, Config, LocalCache};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "roster-cache")]
#[command(about = "Inspect and purge the roster-sync local cache")]
struct Args {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Cache directory (holds cache.sled)
    #[arg(long, env = "ROSTER_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List cached scopes
    Stats,
    /// Remove cached scopes
    Purge {
        /// Only purge this collection (attendance, cadets, trainingEvents, ptPlans)
        #[arg(long)]
        collection: Option<String>,
    },
    /// Print the effective configuration as TOML
    Config,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("roster_sync=info".parse()?))
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };
    config.apply_env();
    if let Some(dir) = args.cache_dir {
        config.cache.path = dir.join("cache.sled");
    }
    config.validate()?;

    match args.command {
        Command::Config => {
            print!("{}", config.to_toml()?);
        }
        Command::Stats => {
            let cache = LocalCache::open(&config.cache)?;
            let max_age = config.cache.max_age();
            let now = Utc::now();
            let entries = cache.entries();
            if entries.is_empty() {
                println!("cache is empty ({})", config.cache.path.display());
            }
            for entry in entries {
                let age = entry
                    .refreshed_at
                    .and_then(|ts| (now - ts).to_std().ok());
                let (age_label, stale) = match age {
                    Some(age) => (format!("{}s", age.as_secs()), age >= max_age),
                    None => ("-".to_string(), true),
                };
                println!(
                    "{:<16} {:<28} {:>6} docs  age {:>8}  {}",
                    entry.collection.as_str(),
                    entry.scope,
                    entry.documents,
                    age_label,
                    if stale { "stale" } else { "fresh" }
                );
            }
            cache.close();
        }
        Command::Purge { collection } => {
            let cache = LocalCache::open(&config.cache)?;
            let targets: Vec<Collection> = match collection.as_deref() {
                Some(name) => vec![Collection::parse(name)
                    .ok_or_else(|| anyhow!("unknown collection: {}", name))?],
                None => Collection::ALL.to_vec(),
            };
            let mut removed = 0;
            for collection in targets {
                removed += cache.invalidate_collection(collection);
            }
            cache.close();
            info!(removed, "Purged cache");
            println!("removed {} cached scopes", removed);
        }
    }

    Ok(())
}
