use anyhow::Result;
use clap::{Parser, Subcommand};
use ems_store::PgStore;
use ems_sync::{SyncConfig, SyncPipeline};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ems-cli")]
#[command(about = "Emergency morbidity sync command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a single synchronization pass and exit.
    Sync,
    /// Run an immediate pass, then keep syncing on the configured schedule.
    Run,
    /// Apply database migrations and exit.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let pipeline = SyncPipeline::connect(&config).await?;
            let summary = pipeline.run_once().await?;
            println!(
                "sync complete: run_id={} fetched={} validated={} new={} inserted={}",
                summary.run_id,
                summary.fetched,
                summary.validated,
                summary.new_records,
                summary.inserted
            );
        }
        Commands::Run => {
            ems_sync::run_scheduled(config).await?;
        }
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
    }

    Ok(())
}
