//! CLI entry point for the chart downloader.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tracing::{debug, info};

use chartloader_core::{
    ChannelSink, Database, DownloadConfig, DownloadOrchestrator, HttpProbe, HttpTransport,
    NetworkQualityMonitor, Priority, PriorityRateLimiter, RetryPolicy, TaskStatus, TaskStore,
};

mod cli;

use cli::{Args, Command};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    debug!(?args, "CLI arguments parsed");

    match args.command {
        Command::Fetch {
            chart_ids,
            output,
            max_concurrent,
            priority,
            max_retries,
            base_url,
            no_quality_gate,
        } => {
            let priority: Priority = priority
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))
                .context("invalid --priority")?;
            fetch(
                chart_ids,
                output,
                usize::from(max_concurrent),
                priority,
                u32::from(max_retries),
                base_url,
                no_quality_gate,
            )
            .await
        }
        Command::Status { output } => status(output).await,
    }
}

#[allow(clippy::too_many_lines)]
async fn fetch(
    chart_ids: Vec<String>,
    output: std::path::PathBuf,
    max_concurrent: usize,
    priority: Priority,
    max_retries: u32,
    base_url: String,
    no_quality_gate: bool,
) -> Result<()> {
    let config = DownloadConfig::new()
        .with_charts_dir(&output)
        .with_max_concurrent(max_concurrent)
        .with_env_overrides();
    config.validate().map_err(|e| anyhow::anyhow!(e))?;

    tokio::fs::create_dir_all(&config.charts_dir)
        .await
        .with_context(|| format!("creating charts dir {}", config.charts_dir.display()))?;

    let db = Database::new(&config.db_path).await?;
    let store = TaskStore::new(db);

    let limiter = Arc::new(PriorityRateLimiter::new(
        config.rate_capacity,
        config.rate_window(),
    ));
    let monitor = Arc::new(NetworkQualityMonitor::new(
        Arc::new(HttpProbe::new(&config.probe_endpoint)),
        config.sample_interval(),
    ));
    let (sink, mut progress_rx) = ChannelSink::new();

    let orchestrator = DownloadOrchestrator::new(
        &config.charts_dir,
        limiter,
        Arc::clone(&monitor),
        Arc::new(HttpTransport::new()),
        store,
        RetryPolicy::chart_download().with_max_retries(max_retries),
        Arc::new(sink),
        config.max_concurrent,
        config.attempt_timeout(),
    )?;

    if !no_quality_gate {
        monitor.start();
    }
    orchestrator.start().await;

    // Progress bars driven by the snapshot channel.
    let bars = MultiProgress::new();
    let style = ProgressStyle::with_template(
        "{prefix:>10} [{bar:30.cyan/blue}] {bytes}/{total_bytes} {msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar());
    let mut chart_bars: HashMap<String, ProgressBar> = HashMap::new();
    for chart_id in &chart_ids {
        let bar = bars.add(ProgressBar::new(0));
        bar.set_style(style.clone());
        bar.set_prefix(chart_id.clone());
        chart_bars.insert(chart_id.clone(), bar);
    }

    let reporter = tokio::spawn(async move {
        while let Some(snapshot) = progress_rx.recv().await {
            if let Some(bar) = chart_bars.get(&snapshot.chart_id) {
                if let Some(total) = snapshot.total_bytes {
                    bar.set_length(total);
                }
                bar.set_position(snapshot.bytes_downloaded);
                match snapshot.status {
                    TaskStatus::Completed => bar.finish_with_message("done"),
                    TaskStatus::Failed => {
                        let category = snapshot
                            .error_category
                            .map_or("unknown", |c| c.as_str());
                        bar.abandon_with_message(format!("failed: {category}"));
                    }
                    TaskStatus::Cancelled => bar.abandon_with_message("cancelled"),
                    _ => bar.set_message(snapshot.status.to_string()),
                }
            }
        }
    });

    info!(count = chart_ids.len(), "enqueueing charts");
    for chart_id in &chart_ids {
        let url = format!("{}/{}.zip", base_url.trim_end_matches('/'), chart_id);
        orchestrator.enqueue(chart_id, &url, priority).await?;
    }

    // Wait for every chart to reach a terminal state.
    let failed: Vec<String> = loop {
        let snapshots = orchestrator.snapshots().await;
        if snapshots.iter().all(|s| s.status.is_terminal()) {
            break snapshots
                .iter()
                .filter(|s| s.status == TaskStatus::Failed)
                .map(|s| s.chart_id.clone())
                .collect();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    };

    orchestrator.shutdown().await;
    monitor.stop();
    reporter.abort();

    if !failed.is_empty() {
        for chart_id in &failed {
            if let Some(report) = orchestrator.failure_report(chart_id).await {
                eprintln!(
                    "{}: {} ({} retries, {:?}) - {}",
                    chart_id,
                    report.message,
                    report.retry_count,
                    report.elapsed,
                    report.recommended_action
                );
            }
        }
        bail!("{} of {} charts failed", failed.len(), chart_ids.len());
    }
    info!(count = chart_ids.len(), "all charts downloaded");
    Ok(())
}

async fn status(output: std::path::PathBuf) -> Result<()> {
    let db_path = output.join("downloads.db");
    if !db_path.exists() {
        println!("no download state at {}", db_path.display());
        return Ok(());
    }
    let db = Database::new(&db_path).await?;
    let store = TaskStore::new(db);

    let rows = store.all().await?;
    if rows.is_empty() {
        println!("download queue is empty");
        return Ok(());
    }
    for row in rows {
        let progress = match row.total_bytes {
            Some(total) if total > 0 => {
                format!("{:.0}%", row.bytes_downloaded as f64 / total as f64 * 100.0)
            }
            _ => format!("{} bytes", row.bytes_downloaded),
        };
        println!(
            "{:<10} {:<12} {:>10}  {}",
            row.chart_id,
            row.status_str,
            progress,
            row.last_error.as_deref().unwrap_or("")
        );
    }
    Ok(())
}
