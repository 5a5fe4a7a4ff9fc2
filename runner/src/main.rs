//! GridProbe runner
//!
//! Runs one probe against one target and publishes its result record.
//! This is the command the batch scheduler invokes for every scheduled job.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use gridprobe_core::ProbeExecutor;
use tracing::info;

mod config;

/// Run a single grid monitoring probe
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Metric to run
    #[arg(short, long)]
    metric: String,

    /// Target host, `host` or `host:port`
    #[arg(short, long)]
    uri: String,

    /// Verbosity: 0 quiet, 1 warnings, 2 info, 3 debug
    #[arg(short, long, default_value_t = 1, value_parser = clap::value_parser!(u8).range(0..=3))]
    verbose: u8,

    /// Install root; defaults to OSG_LOCATION, then VDT_LOCATION
    #[arg(long)]
    vdt_location: Option<PathBuf>,

    /// Print the result record as JSON instead of the wire text
    #[arg(long)]
    json: bool,
}

fn log_filter(verbose: u8) -> &'static str {
    match verbose {
        0 => "error",
        1 => "warn",
        2 => "info",
        _ => "debug",
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Parse CLI args
    let args = Args::parse();

    // Initialize tracing; stdout is reserved for the record summary
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_filter(args.verbose).into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let layout = config::install_layout(args.vdt_location.clone())?;
    let metric = config::load(&layout, &args.metric, &args.uri)
        .with_context(|| format!("invalid configuration for metric {}", args.metric))?;

    info!(metric = %metric.name, uri = %metric.target.uri, "Starting probe run");

    let executor = ProbeExecutor::for_install(&layout).with_verbosity(args.verbose);
    let report = executor.run(&metric).await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report.record)?);
    } else if args.verbose > 0 {
        print!("{}", report.publish.local_summary);
    }

    Ok(())
}
