use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use carlot_storage::CarStore;
use carlot_sync::{SyncConfig, SyncPipeline};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "carlot")]
#[command(about = "Car lot inventory: web UI and dealer inventory sync")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the web UI with the periodic inventory sync in the background.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run a single inventory sync and exit.
    Sync {
        /// Read listings from a JSON file instead of scraping.
        #[arg(long)]
        fixture: Option<PathBuf>,
        #[arg(long)]
        url: Option<String>,
    },
    /// Create or upgrade the database schema.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve { port: None }) {
        Commands::Serve { port } => serve(config, port).await?,
        Commands::Sync { fixture, url } => {
            let mut config = config;
            if fixture.is_some() {
                config.inventory_fixture = fixture;
            }
            if let Some(url) = url {
                config.inventory_url = url;
            }
            let store = open_store(&config).await?;
            let summary = SyncPipeline::new(config, store)?.run_once().await?;
            println!(
                "sync complete: run_id={} scraper={} scraped={} inserted={} skipped={}",
                summary.run_id, summary.scraper, summary.scraped, summary.inserted, summary.skipped
            );
        }
        Commands::Migrate => {
            open_store(&config).await?;
            println!("migrations applied to {}", config.database_url);
        }
    }

    Ok(())
}

async fn open_store(config: &SyncConfig) -> Result<CarStore> {
    let store = CarStore::connect(&config.database_url)
        .await
        .with_context(|| format!("opening {}", config.database_url))?;
    store.migrate().await.context("applying migrations")?;
    Ok(store)
}

async fn serve(config: SyncConfig, port: Option<u16>) -> Result<()> {
    let store = open_store(&config).await?;
    let pipeline = Arc::new(SyncPipeline::new(config, store.clone())?);

    let scheduler = pipeline.maybe_build_scheduler().await?;
    match &scheduler {
        Some(sched) => sched.start().await.context("starting scheduler")?,
        None => warn!("inventory sync scheduler disabled"),
    }

    let port = port.unwrap_or_else(carlot_web::web_port_from_env);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    carlot_web::serve(listener, carlot_web::AppState::new(store), async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown requested");
    })
    .await?;

    if let Some(mut sched) = scheduler {
        sched.shutdown().await.context("stopping scheduler")?;
    }
    Ok(())
}
