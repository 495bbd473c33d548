//! CLI argument definitions using clap derive macros.

use clap::{Parser, Subcommand};

use chartloader_core::download::DEFAULT_MAX_RETRIES;

/// Resilient downloader for electronic navigational charts.
///
/// Fetches ENC cells from the chart distribution server with retry,
/// rate limiting, network-quality gating, and pause/resume support.
#[derive(Parser, Debug)]
#[command(name = "chartloader")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Download chart cells by id.
    Fetch {
        /// Chart cell ids, e.g. US5WA11M
        #[arg(required = true)]
        chart_ids: Vec<String>,

        /// Directory to save charts to
        #[arg(short, long, default_value = "./charts")]
        output: std::path::PathBuf,

        /// Maximum concurrent downloads (1-16)
        #[arg(short = 'c', long, default_value_t = 3, value_parser = clap::value_parser!(u8).range(1..=16))]
        max_concurrent: u8,

        /// Scheduling priority (low, normal, high, critical)
        #[arg(short, long, default_value = "normal")]
        priority: String,

        /// Maximum retry attempts for transient failures (0-10)
        #[arg(short = 'r', long, default_value_t = DEFAULT_MAX_RETRIES as u8, value_parser = clap::value_parser!(u8).range(0..=10))]
        max_retries: u8,

        /// Base URL of the chart distribution server
        #[arg(long, default_value = "https://charts.noaa.gov/ENCs")]
        base_url: String,

        /// Skip the network-quality admission gate
        #[arg(long)]
        no_quality_gate: bool,
    },

    /// Show the persisted download queue state.
    Status {
        /// Directory the charts were saved to
        #[arg(short, long, default_value = "./charts")]
        output: std::path::PathBuf,
    },
}
