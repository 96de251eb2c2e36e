//! EmberKV CLI - command-line access to a local store

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use emberkv_core::{StorageConfig, StorageEngine};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "emberkv", version, about, long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(global = true, short, long)]
    config: Option<PathBuf>,

    /// Data directory (overrides the configuration file)
    #[arg(global = true, short, long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Insert or replace a value
    #[command(alias = "p")]
    Put { key: String, value: String },

    /// Get a value by key
    #[command(alias = "g")]
    Get { key: String },

    /// Delete a key
    #[command(alias = "rm")]
    Delete { key: String },

    /// List live pairs with FROM <= key < TO
    Scan {
        #[arg(default_value = "")]
        from: String,
        to: Option<String>,
        /// Stop after this many pairs
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Merge all on-disk tables into one
    Compact,

    /// Show engine statistics
    Stats,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let engine = StorageEngine::open(config.clone())
        .with_context(|| format!("could not open storage at {:?}", config.data_dir))?;

    match cli.command {
        Command::Put { key, value } => {
            engine
                .upsert(key.clone(), value)
                .with_context(|| format!("failed to put key={key}"))?;
            println!("OK");
        }
        Command::Get { key } => match engine
            .get(key.as_bytes())
            .with_context(|| format!("failed to get key={key}"))?
        {
            Some(value) => println!("{}", String::from_utf8_lossy(&value)),
            None => println!("(not found)"),
        },
        Command::Delete { key } => {
            engine
                .remove(key.clone())
                .with_context(|| format!("failed to delete key={key}"))?;
            println!("OK");
        }
        Command::Scan { from, to, limit } => {
            let pairs = engine
                .range(from.as_bytes(), to.as_deref().map(str::as_bytes))
                .context("failed to scan")?;
            for pair in pairs.take(limit.unwrap_or(usize::MAX)) {
                let (key, value) = pair.context("failed to read table")?;
                println!(
                    "{}\t{}",
                    String::from_utf8_lossy(&key),
                    String::from_utf8_lossy(&value)
                );
            }
        }
        Command::Compact => match engine.compact().context("compaction failed")? {
            Some(result) => println!(
                "Compacted {} tables into generation {} ({} rows)",
                result.inputs.len(),
                result.output.generation,
                result.output.rows
            ),
            None => println!("Nothing to compact"),
        },
        Command::Stats => {
            let stats = engine.stats();
            println!("version:           {}", emberkv_core::VERSION);
            println!("data dir:          {:?}", config.data_dir);
            println!("disk tables:       {}", stats.disk_tables);
            println!("disk rows:         {}", stats.disk_rows);
            println!("disk bytes:        {}", stats.disk_bytes);
            println!("pending tables:    {}", stats.pending_tables);
            println!("memory bytes:      {}", stats.memory_bytes);
            println!("active generation: {}", stats.active_generation);
        }
    }

    engine.close().context("failed to flush on close")?;
    info!("Closed storage at {:?}", config.data_dir);
    Ok(())
}

fn load_config(cli: &Cli) -> Result<StorageConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("could not read config {:?}", path))?;
            serde_json::from_str::<StorageConfig>(&text)
                .with_context(|| format!("invalid config {:?}", path))?
        }
        None => StorageConfig::default(),
    };
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    config.validate()?;
    Ok(config)
}
