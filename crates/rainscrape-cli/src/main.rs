use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use rainscrape_sync::{ScrapeConfig, ScrapePipeline};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "rainscrape")]
#[command(about = "Scrape station rainfall tables into a deduplicated CSV dataset")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape every station and merge the rows into the dataset file.
    Sync(SyncArgs),
    /// Print the station directory.
    Stations(SourceArgs),
}

#[derive(Debug, Default, Args)]
struct SourceArgs {
    #[arg(long)]
    endpoint: Option<String>,
    #[arg(long)]
    user_agent: Option<String>,
    #[arg(long)]
    timeout_secs: Option<u64>,
    /// Accept invalid TLS certificates from the endpoint.
    #[arg(long)]
    insecure: bool,
    /// Attempts for the station directory request.
    #[arg(long)]
    max_attempts: Option<usize>,
    #[arg(long)]
    retry_delay_secs: Option<u64>,
}

impl SourceArgs {
    fn apply(&self, config: &mut ScrapeConfig) {
        if let Some(endpoint) = &self.endpoint {
            config.endpoint = endpoint.clone();
        }
        if let Some(user_agent) = &self.user_agent {
            config.user_agent = user_agent.clone();
        }
        if let Some(secs) = self.timeout_secs {
            config.http_timeout_secs = secs;
        }
        if self.insecure {
            config.accept_invalid_certs = true;
        }
        if let Some(attempts) = self.max_attempts {
            config.directory_retry.max_attempts = attempts;
        }
        if let Some(secs) = self.retry_delay_secs {
            config.directory_retry.delay = Duration::from_secs(secs);
            config.station_retry.delay = Duration::from_secs(secs);
        }
    }
}

#[derive(Debug, Default, Args)]
struct SyncArgs {
    #[command(flatten)]
    source: SourceArgs,
    /// Dataset CSV to merge into.
    #[arg(long)]
    output: Option<PathBuf>,
    /// Leave rows dated before this day (YYYY-MM-DD) out of the dataset.
    #[arg(long)]
    since: Option<NaiveDate>,
    /// Stations fetched at once; 1 runs them one by one.
    #[arg(long)]
    concurrency: Option<usize>,
    #[arg(long)]
    station_attempts: Option<usize>,
    #[arg(long)]
    request_delay_ms: Option<u64>,
    #[arg(long)]
    artifacts_dir: Option<PathBuf>,
    #[arg(long)]
    reports_dir: Option<PathBuf>,
}

impl SyncArgs {
    fn apply(&self, config: &mut ScrapeConfig) {
        self.source.apply(config);
        if let Some(output) = &self.output {
            config.output_path = output.clone();
        }
        if self.since.is_some() {
            config.since = self.since;
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        if let Some(attempts) = self.station_attempts {
            config.station_retry.max_attempts = attempts;
        }
        if let Some(ms) = self.request_delay_ms {
            config.request_delay = Duration::from_millis(ms);
        }
        if let Some(dir) = &self.artifacts_dir {
            config.artifacts_dir = Some(dir.clone());
        }
        if let Some(dir) = &self.reports_dir {
            config.reports_dir = Some(dir.clone());
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let mut config = ScrapeConfig::from_env();

    match cli.command.unwrap_or_else(|| Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => {
            args.apply(&mut config);
            let pipeline = ScrapePipeline::new(config)?;
            let summary = pipeline.run_once().await.context("scrape run failed")?;
            if summary.stations_failed > 0 {
                warn!(
                    failed = summary.stations_failed,
                    discovered = summary.stations_discovered,
                    "some stations could not be scraped"
                );
            }
            println!(
                "sync complete: run_id={} stations={} failed={} scraped={} written={} output={}",
                summary.run_id,
                summary.stations_discovered,
                summary.stations_failed,
                summary.scraped_rows,
                summary.rows_written,
                summary.output_path.display()
            );
        }
        Commands::Stations(args) => {
            args.apply(&mut config);
            let pipeline = ScrapePipeline::new(config)?;
            let stations = pipeline
                .load_stations()
                .await
                .context("loading station directory")?;
            info!(count = stations.len(), "stations listed");
            for station in stations {
                println!("{}\t{}", station.id, station.name);
            }
        }
    }

    Ok(())
}
