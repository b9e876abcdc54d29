//! Bulk auto review driver.
//!
//! Claims and reviews batches of `added` images until interrupted. The first
//! Ctrl+C lets in-flight reviews finish; the second exits immediately.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::error;

use auto_review::config::Config;
use auto_review::logging;
use auto_review::review::{ReviewService, RunSummary};

#[derive(Debug, Parser)]
#[command(name = "bulk_review", about = "Auto review pending images in batches")]
struct Args {
    /// Rows claimed per batch [default: $LIMIT or 10]
    #[arg(long)]
    batch_size: Option<i64>,

    /// Images reviewed concurrently [default: $REVIEW_CONCURRENCY or 8]
    #[arg(long)]
    concurrency: Option<usize>,

    /// Run a single batch and exit
    #[arg(long)]
    once: bool,

    /// Seconds to wait before polling again when nothing is pending
    #[arg(long, default_value_t = 5)]
    idle_secs: u64,
}

fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        eprintln!("\nGraceful termination requested. Completing current batch before exiting...");
        cancel.cancel();

        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nForced exit. Terminating immediately.");
            std::process::exit(130);
        }
    });
}

fn progress_bar() -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner()
        .template("{spinner:.green} [{elapsed_precise}] Running bulk_auto_review: {pos} batches {msg}")
    {
        bar.set_style(style);
    }
    bar.enable_steady_tick(Duration::from_millis(120));
    bar
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();
    let args = Args::parse();

    let mut config = Config::from_env()?;
    if let Some(batch_size) = args.batch_size.filter(|v| *v > 0) {
        config.batch_size = batch_size;
    }
    if let Some(concurrency) = args.concurrency.filter(|v| *v > 0) {
        config.concurrency = concurrency;
    }

    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    let reviews = Arc::new(ReviewService::from_config(&config, pool)?);

    let cancel = CancellationToken::new();
    spawn_interrupt_handler(cancel.clone());

    println!("Starting bulk auto review process. Press Ctrl+C to gracefully terminate.");

    let bar = progress_bar();
    let idle = Duration::from_secs(args.idle_secs);
    let start = Instant::now();
    let mut summary = RunSummary::default();

    while !cancel.is_cancelled() {
        let report = match reviews.run_batch(config.batch_size, &cancel).await {
            Ok(report) => report,
            Err(e) => {
                error!("[bulk] Batch failed: {}", e);
                if args.once {
                    break;
                }
                wait_or_cancel(&cancel, idle).await;
                continue;
            }
        };

        if report.is_empty() {
            if args.once {
                break;
            }
            bar.set_message("(waiting for images)");
            wait_or_cancel(&cancel, idle).await;
            continue;
        }

        summary.record(&report);
        bar.inc(1);
        bar.set_message(format!(
            "({} ok, {} failed)",
            summary.succeeded, summary.failed
        ));

        if args.once {
            break;
        }
    }

    bar.finish_and_clear();
    println!("\n{}", summary.render(start.elapsed()));
    println!("Bulk auto review process completed.");
    Ok(())
}

async fn wait_or_cancel(cancel: &CancellationToken, idle: Duration) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(idle) => {}
    }
}
