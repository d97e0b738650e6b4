use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::error;

use contact_geocoder::{init_tracing, AppConfig, AppState};

#[derive(Parser)]
#[command(name = "contact-geocoder")]
#[command(about = "Clean a contact CSV and attach coordinates to both addresses")]
#[command(version)]
struct Cli {
    /// Contact file to clean (.csv or .xlsx)
    input: PathBuf,

    /// Where to write the cleaned file
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Addresses per geocoding batch
    #[arg(long)]
    batch_size: Option<usize>,

    /// Batches geocoded at the same time
    #[arg(long)]
    workers: Option<usize>,

    /// Directory for the diagnostics buffer
    #[arg(long, value_name = "DIR")]
    diagnostics_dir: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            eprintln!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = AppConfig::from_env();
    if let Some(batch_size) = cli.batch_size {
        config.batch_size = batch_size.max(1);
    }
    if let Some(workers) = cli.workers {
        config.worker_pool_size = workers.max(1);
    }
    if let Some(dir) = cli.diagnostics_dir {
        config.diagnostics_dir = dir.to_string_lossy().into_owned();
    }
    let output = cli
        .output
        .unwrap_or_else(|| PathBuf::from(&config.output_file));

    let state = AppState::initialize(config).context("failed to initialize geocoder")?;
    let report = state
        .run(&cli.input, &output)
        .await
        .with_context(|| format!("failed to process {}", cli.input.display()))?;

    if let Some(cleaning) = &report.cleaning {
        println!(
            "Read {} rows: {} valid, {} incomplete, {} invalid, {} duplicate",
            cleaning.read,
            cleaning.kept,
            cleaning.dropped_missing,
            cleaning.dropped_invalid,
            cleaning.dropped_duplicate
        );
    }
    println!(
        "Geocoded residential {}/{} and postal {}/{}",
        report.residential.tally.resolved,
        report.residential.tally.total,
        report.postal.tally.resolved,
        report.postal.tally.total
    );
    if report.service_unavailable {
        println!("Warning: every lookup failed; the geocoding service may be unreachable");
    } else if report.degraded {
        println!("Warning: no rows could be geocoded");
    }
    println!(
        "Cleaned data saved to {} ({} rows)",
        output.display(),
        report.survivors
    );
    Ok(())
}
