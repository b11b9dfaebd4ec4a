use std::sync::Arc;

use anyhow::{Context, Result};
use catsync_sync::{run_scheduler_until_shutdown, SyncConfig, SyncPipeline};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "catsync")]
#[command(about = "Sync service catalog files from GitHub into a Notion database")]
struct Cli {
    #[command(flatten)]
    overrides: Overrides,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync and print its summary.
    Sync {
        /// Print the summary as JSON instead of a single line.
        #[arg(long)]
        json: bool,
    },
    /// Run syncs on a cron schedule until interrupted.
    Schedule {
        /// Cron expression (seconds first); repeat for several schedules.
        #[arg(long = "cron")]
        crons: Vec<String>,
    },
}

/// Flags that take precedence over the environment.
#[derive(Debug, Default, Args)]
struct Overrides {
    /// GitHub organization to scan.
    #[arg(long, global = true)]
    owner: Option<String>,
    /// Target database id.
    #[arg(long, global = true)]
    database: Option<String>,
    #[arg(long, global = true)]
    owner_database: Option<String>,
    #[arg(long, global = true)]
    system_database: Option<String>,
    /// Regex repository names must match.
    #[arg(long, global = true)]
    filter: Option<String>,
    #[arg(long, global = true)]
    repository_type: Option<String>,
    #[arg(long, global = true)]
    batch_size: Option<usize>,
    #[arg(long, global = true)]
    catalog_file: Option<String>,
    /// Do not create placeholder rows for repositories without a catalog file.
    #[arg(long, global = true)]
    no_push_missing: bool,
}

impl Overrides {
    fn apply(self, config: &mut SyncConfig) {
        if let Some(owner) = self.owner {
            config.github_owner = Some(owner);
        }
        if let Some(database) = self.database {
            config.database_id = Some(database);
        }
        if let Some(database) = self.owner_database {
            config.owner_database = Some(database);
        }
        if let Some(database) = self.system_database {
            config.system_database = Some(database);
        }
        if let Some(filter) = self.filter {
            config.repository_filter = filter;
        }
        if let Some(repository_type) = self.repository_type {
            config.repository_type = repository_type;
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(catalog_file) = self.catalog_file {
            config.catalog_file = catalog_file;
        }
        if self.no_push_missing {
            config.push_missing = false;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();
    cli.overrides.apply(&mut config);

    match cli.command.unwrap_or(Commands::Sync { json: false }) {
        Commands::Sync { json } => {
            let pipeline = SyncPipeline::new(config)?;
            let summary = pipeline.run_once().await?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&summary).context("encoding summary")?
                );
            } else {
                println!("{summary}");
            }
        }
        Commands::Schedule { crons } => {
            config.scheduler_enabled = true;
            if !crons.is_empty() {
                config.sync_cron = crons;
            }
            let pipeline = Arc::new(SyncPipeline::new(config)?);
            let sched = pipeline
                .maybe_build_scheduler()
                .await?
                .context("scheduler is disabled")?;
            info!("scheduler configured");
            run_scheduler_until_shutdown(sched).await?;
        }
    }

    Ok(())
}
