use std::path::PathBuf;
use std::process::ExitCode;

use chrono::{DateTime, Utc};
use clap::Parser;

use kayak_service::config::{Config, ConfigError};
use kayak_service::ingest::iem::IemAdapter;
use kayak_service::ingest::usgs::UsgsAdapter;
use kayak_service::ingest::{SourceAdapter, build_http_client};
use kayak_service::logging::{self, DataSource};
use kayak_service::pipeline::{self, PipelineError, RunOptions};
use kayak_service::report;
use kayak_service::store::CsvStore;

/// Fetches river and weather observations, scores kayakability, and writes
/// the ranked paddling windows.
#[derive(Parser)]
#[command(name = "kayak_service", version, about = "Kayakability scoring and window forecasting")]
struct Cli {
    /// Path to TOML configuration file (overrides KAYAK_CONFIG).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Only process this site id. Repeat for several sites.
    #[arg(short, long = "site")]
    sites: Vec<String>,

    /// Start of the fetch range (RFC 3339). Defaults to the last recorded timestamp.
    #[arg(long)]
    start: Option<DateTime<Utc>>,

    /// End of the fetch range (RFC 3339). Defaults to now.
    #[arg(long)]
    end: Option<DateTime<Utc>>,

    /// Override the output directory from config.
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Also write log events to this file.
    #[arg(long)]
    log_file: Option<String>,

    /// Number of recommendations to print.
    #[arg(long, default_value_t = report::DEFAULT_LIMIT)]
    top: usize,

    /// Increase verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn run(cli: &Cli) -> Result<(), PipelineError> {
    let mut config = Config::resolve(cli.config.as_deref())?;
    if let Some(dir) = &cli.output_dir {
        config.output_dir = dir.clone();
    }

    let client = build_http_client(&config.fetch)
        .map_err(|e| ConfigError::Invalid(format!("cannot build HTTP client: {}", e)))?;
    let retry = config.fetch.retry_policy();
    let adapters: Vec<Box<dyn SourceAdapter>> = vec![
        Box::new(UsgsAdapter::new(client.clone(), retry)),
        Box::new(IemAdapter::new(client, retry)),
    ];
    let store = CsvStore::new(&config.output_dir);

    let options = RunOptions {
        sites: cli.sites.clone(),
        start: cli.start,
        end: cli.end,
    };

    println!("🚣 Kayakability run for {} site(s)", config.sites.len());
    let summary = pipeline::run(&config, &adapters, &store, &options, Utc::now())?;

    println!("{}", report::render_summary(&summary));
    println!("{}", report::render_recommendations(&summary.windows, &config.sites, cli.top));
    println!("📁 Output written to {}", store.dir().display());
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init_logger(cli.verbose, cli.log_file.as_deref());

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            logging::error(DataSource::Pipeline, None, &e.to_string());
            eprintln!("✗ Run failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
