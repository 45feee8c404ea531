use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use newsreel::config::Config;
use newsreel::pipeline::{http_client, CycleOutcome, Pipeline, PipelineSettings};
use newsreel::scheduler::{run_scheduler, spawn_worker, CycleHandle};
use newsreel::storage::{Database, DatabaseError};

/// Get the config directory path (~/.config/newsreel/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("newsreel"))
}

#[derive(Parser, Debug)]
#[command(name = "newsreel", about = "Mirror a news feed into a local SQLite snapshot")]
struct Args {
    /// Config file (default: ~/.config/newsreel/config.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Database file, overrides `database_path` from the config
    #[arg(long, value_name = "FILE")]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch on a schedule until interrupted (default). Send SIGUSR1 to fetch now.
    Run,
    /// Run one fetch cycle now and report the outcome
    Fetch,
    /// Print the current snapshot, newest first
    List {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let db_path = args
        .database
        .clone()
        .or_else(|| config.database_path.clone())
        .unwrap_or_else(|| config_dir.join("news.db"));
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create database directory {}", parent.display())
            })?;
        }
    }

    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    let db = match Database::open(db_path_str).await {
        Ok(db) => db,
        Err(DatabaseError::Locked) => {
            eprintln!("Error: The news database at {} is locked by another process.", db_path.display());
            std::process::exit(1);
        }
        Err(e) => return Err(anyhow::anyhow!("Failed to open database: {}", e)),
    };

    match args.command.unwrap_or(Command::Run) {
        Command::List { json } => list(&db, json).await,
        Command::Fetch => {
            let pipeline = build_pipeline(db, &config)?;
            match pipeline.run().await {
                CycleOutcome::Succeeded(report) => {
                    println!(
                        "News successfully updated: {} items stored, {} skipped",
                        report.stored, report.skipped
                    );
                    Ok(())
                }
                CycleOutcome::Failed { reason } => {
                    eprintln!("Failed to fetch news: {}", reason);
                    std::process::exit(1);
                }
            }
        }
        Command::Run => {
            let pipeline = build_pipeline(db, &config)?;
            let (handle, worker) = spawn_worker(pipeline);
            let scheduler = tokio::spawn(run_scheduler(handle.clone(), config.refresh_interval()));

            tracing::info!(
                feed = %config.feed_url,
                interval_minutes = config.refresh_interval_minutes,
                "Scheduler running"
            );
            println!(
                "Scheduler running: updates every {} minutes. Ctrl+C to stop.",
                config.refresh_interval_minutes
            );

            wait_for_shutdown(&handle).await?;

            scheduler.abort();
            drop(handle);
            let _ = worker.await;
            println!("Goodbye!");
            Ok(())
        }
    }
}

fn build_pipeline(db: Database, config: &Config) -> Result<Pipeline> {
    let client = http_client(&config.user_agent).context("Failed to build HTTP client")?;
    Ok(Pipeline::new(db, client, PipelineSettings::from_config(config)))
}

async fn list(db: &Database, json: bool) -> Result<()> {
    let items = db
        .list_all_ordered_by_published_desc()
        .await
        .context("Failed to read news snapshot")?;

    if json {
        let body = serde_json::json!({ "count": items.len(), "items": items });
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }

    println!("Total news items: {}", items.len());
    for item in &items {
        println!("---");
        println!("{}", item.title);
        println!("Published: {}", item.published_at.format("%Y-%m-%d %H:%M:%S UTC"));
        println!("Link: {}", item.link);
        if let Some(image) = &item.image {
            println!("Image: {}", image);
        }
    }
    Ok(())
}

/// Block until SIGINT/SIGTERM. On Unix, SIGUSR1 queues a manual cycle.
#[cfg(unix)]
async fn wait_for_shutdown(handle: &CycleHandle) -> Result<()> {
    use newsreel::scheduler::Trigger;
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigusr1 = signal(SignalKind::user_defined1())?;

    loop {
        tokio::select! {
            biased;

            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, shutting down");
                return Ok(());
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, shutting down");
                return Ok(());
            }
            _ = sigusr1.recv() => {
                tracing::info!("Received SIGUSR1, requesting manual fetch");
                let handle = handle.clone();
                tokio::spawn(async move {
                    match handle.request(Trigger::Manual).await {
                        Ok(CycleOutcome::Succeeded(report)) => {
                            println!("News successfully updated: {} items", report.stored);
                        }
                        Ok(CycleOutcome::Failed { reason }) => {
                            eprintln!("Failed to fetch news: {}", reason);
                        }
                        Err(e) => tracing::warn!(error = %e, "Manual fetch not run"),
                    }
                });
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_handle: &CycleHandle) -> Result<()> {
    tokio::signal::ctrl_c().await?;
    tracing::info!("Received Ctrl+C, shutting down");
    Ok(())
}
