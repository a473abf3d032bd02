use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use invsync_core::PageScope;
use invsync_storage::SqliteStore;
use invsync_sync::{read_only_service, service_from_config, MonitorConfigUpdate, SyncConfig};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "invsync")]
#[command(about = "Keep a local inventory mirror in sync with its remote listing")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one synchronization pass and print the finished run.
    Sync {
        /// Pages to fetch; 0 fetches until the listing ends.
        #[arg(long, default_value_t = 0)]
        pages: u32,
        /// Return as soon as the run has started.
        #[arg(long)]
        detach: bool,
    },
    /// Compare the remote listing against the store without applying anything.
    Compare {
        #[arg(long, default_value_t = 0)]
        pages: u32,
    },
    /// Run the drift monitor (and the cron sync, if configured) until ctrl-c.
    Monitor,
    /// Show a run by id, or the most recent one.
    Status {
        #[arg(long)]
        run_id: Option<Uuid>,
    },
    /// List finished runs, newest first.
    Runs {
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = 20)]
        per_page: u32,
    },
    /// Price and change history for one record.
    History { identifier: String },
    /// Show or update the persisted monitor settings.
    MonitorConfig {
        #[arg(long, conflicts_with = "disable")]
        enable: bool,
        #[arg(long)]
        disable: bool,
        #[arg(long)]
        interval_minutes: Option<u32>,
        #[arg(long)]
        pages: Option<u32>,
    },
    /// Create or upgrade the database schema.
    Migrate,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("encoding output")?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::load()?;

    match cli.command.unwrap_or(Commands::Sync {
        pages: 0,
        detach: false,
    }) {
        Commands::Migrate => {
            SqliteStore::connect(&config.database_url)
                .await
                .with_context(|| format!("migrating {}", config.database_url))?;
            println!("schema up to date: {}", config.database_url);
        }
        Commands::Sync { pages, detach } => {
            let service = service_from_config(&config).await?;
            let run_id = service.trigger_run(PageScope::first(pages)).await?;
            if detach {
                println!("{run_id}");
                return Ok(());
            }
            let run = tokio::select! {
                run = service.wait_for_run(run_id) => run?,
                _ = tokio::signal::ctrl_c() => {
                    warn!(%run_id, "interrupted; finishing with what was fetched");
                    service.cancel_run(run_id);
                    service.wait_for_run(run_id).await?
                }
            };
            print_json(&run)?;
        }
        Commands::Compare { pages } => {
            let service = service_from_config(&config).await?;
            print_json(&service.compare_now(PageScope::first(pages)).await?)?;
        }
        Commands::Monitor => {
            let service = service_from_config(&config).await?;
            let shutdown = CancellationToken::new();
            let monitor = service.spawn_monitor(shutdown.clone());
            let scheduler = service.maybe_build_scheduler(config.sync_cron.as_deref()).await?;
            if let Some(scheduler) = &scheduler {
                scheduler.start().await.context("starting cron scheduler")?;
                info!(cron = config.sync_cron.as_deref().unwrap_or_default(), "cron sync scheduled");
            }

            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            info!("shutting down");
            shutdown.cancel();
            if let Some(mut scheduler) = scheduler {
                scheduler.shutdown().await.context("stopping cron scheduler")?;
            }
            monitor.await.context("joining monitor task")?;
        }
        Commands::Status { run_id } => {
            let service = read_only_service(&config).await?;
            match service.run_status(run_id).await? {
                Some(view) => print_json(&view)?,
                None => println!("no runs yet"),
            }
        }
        Commands::Runs { page, per_page } => {
            let service = read_only_service(&config).await?;
            print_json(&service.run_history(page, per_page).await?)?;
        }
        Commands::History { identifier } => {
            let service = read_only_service(&config).await?;
            print_json(&service.record_history(&identifier).await?)?;
        }
        Commands::MonitorConfig {
            enable,
            disable,
            interval_minutes,
            pages,
        } => {
            let service = read_only_service(&config).await?;
            let update = MonitorConfigUpdate {
                enabled: (enable || disable).then_some(enable),
                interval_minutes,
                pages,
            };
            let current = if update == MonitorConfigUpdate::default() {
                service.monitor_config().await?
            } else {
                service.update_monitor_config(update).await?
            };
            print_json(&current)?;
        }
    }

    Ok(())
}
