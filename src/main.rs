use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use herald::dispatch::LogDispatcher;
use herald::scheduler::spawn_poller;
use herald::storage::{Database, DatabaseError};
use herald::{Config, Engine};

#[derive(Parser, Debug)]
#[command(
    name = "herald",
    about = "Polls RSS/Atom feeds and announces new entries to subscribed rooms"
)]
struct Args {
    /// Path to the TOML config file
    #[arg(long, default_value = "herald.toml")]
    config: PathBuf,

    /// Override the database path from the config file
    #[arg(long, value_name = "FILE")]
    database: Option<String>,

    /// Run a single poll cycle and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let mut config = Config::load(&args.config).context("Failed to load configuration")?;
    if let Some(database) = args.database {
        config.database_path = database;
    }

    let db = match Database::open(&config.database_path).await {
        Ok(db) => db,
        Err(DatabaseError::InstanceLocked) => {
            eprintln!(
                "Error: Another instance of herald appears to be running. Please close it and try again."
            );
            std::process::exit(1);
        }
        Err(e) => {
            return Err(anyhow::anyhow!("Failed to open database: {}", e));
        }
    };

    // No transport wired up here — deliveries go to the log. A chat client
    // embeds the engine as a library and brings its own Dispatcher.
    let interval = Duration::from_secs(config.poll_interval_secs);
    let engine = Arc::new(
        Engine::new(db, Arc::new(LogDispatcher), config).context("Failed to create engine")?,
    );

    if args.once {
        let summary = engine.poll_once().await;
        println!(
            "Polled {} feeds, delivered {} entries ({} failed)",
            summary.feeds, summary.delivered, summary.failed_feeds
        );
        return Ok(());
    }

    let poller = spawn_poller(engine, interval);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutting down");
    poller
        .stop()
        .await
        .context("Poller task did not stop cleanly")?;

    Ok(())
}
