mod telemetry;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use permit_core::{Checkpoint, CrawlWindow};
use permit_storage::CheckpointStore;
use permit_sync::{CrawlConfig, CrawlRunSummary};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "permit-cli")]
#[command(about = "Permit application crawler")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one crawl now.
    Crawl {
        /// Replay a recorded portal instead of driving a browser.
        #[arg(long)]
        fixture: Option<PathBuf>,
        /// Crawl as if today were this date (YYYY-MM-DD).
        #[arg(long)]
        today: Option<NaiveDate>,
    },
    /// Print the window the next crawl would cover.
    Plan {
        #[arg(long)]
        today: Option<NaiveDate>,
    },
    /// Inspect or overwrite the saved checkpoint.
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },
    /// Run crawls on the configured cron schedule until interrupted.
    Schedule,
    /// Summarize recent runs from the reports directory.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

#[derive(Debug, Subcommand)]
enum CheckpointAction {
    Show,
    Set { date: NaiveDate },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = CrawlConfig::from_env();
    telemetry::init("info", &config.scrape_log_file)?;

    let command = cli.command.unwrap_or(Commands::Crawl {
        fixture: None,
        today: None,
    });
    match command {
        Commands::Crawl { fixture, today } => {
            let today = today.unwrap_or_else(|| Local::now().date_naive());
            let summary = match fixture {
                Some(path) => {
                    permit_sync::fixture_pipeline(config, &path)
                        .await?
                        .run_once_at(today)
                        .await?
                }
                None => {
                    permit_sync::live_pipeline(config)
                        .await?
                        .run_once_at(today)
                        .await?
                }
            };
            print_summary(&summary);
        }
        Commands::Plan { today } => {
            let today = today.unwrap_or_else(|| Local::now().date_naive());
            let checkpoint = CheckpointStore::new(&config.checkpoint_file).load().await;
            match CrawlWindow::plan(checkpoint.as_ref(), today, config.lookback_days) {
                Ok(window) => println!("window {window} ({} days)", window.day_count()),
                Err(err) => println!("nothing to crawl: {err}"),
            }
        }
        Commands::Checkpoint { action } => {
            let store = CheckpointStore::new(&config.checkpoint_file);
            match action {
                CheckpointAction::Show => match store.load().await {
                    Some(checkpoint) => println!("{}", checkpoint.last_execution_date),
                    None => println!("no checkpoint at {}", store.path().display()),
                },
                CheckpointAction::Set { date } => {
                    store
                        .save(&Checkpoint::new(date))
                        .await
                        .context("saving checkpoint")?;
                    println!("checkpoint set to {date}");
                }
            }
        }
        Commands::Schedule => {
            let cron = config.scheduler_cron.clone();
            let pipeline = Arc::new(permit_sync::live_pipeline(config).await?);
            let sched = permit_sync::build_scheduler(pipeline).await?;
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler started; press ctrl-c to stop");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for ctrl-c")?;
            let mut sched = sched;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Report { runs } => {
            println!(
                "{}",
                permit_sync::report_recent_markdown(runs, &config.reports_dir)?
            );
        }
    }

    Ok(())
}

fn print_summary(summary: &CrawlRunSummary) {
    let window = summary
        .window
        .map(|w| w.to_string())
        .unwrap_or_else(|| "empty".to_string());
    println!(
        "crawl {}: run_id={} window={} items={} records={} not_found={} errors={} reports={}",
        summary.state,
        summary.run_id,
        window,
        summary.work_items,
        summary.records,
        summary.not_found,
        summary.transient_errors,
        summary.reports_dir.as_deref().unwrap_or("-")
    );
}
