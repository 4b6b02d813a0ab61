//! Scrape pipeline orchestration: station discovery, per-station extraction, merge and persistence.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use rainscrape_adapters::{
    parse_station_directory, parse_station_page, FormEndpointSource, RainfallSource, SourceError,
    DEFAULT_ENDPOINT, DEFAULT_FILTER_MODE,
};
use rainscrape_core::{Observation, Station};
use rainscrape_storage::{
    ArtifactStore, DatasetStore, HttpClientConfig, HttpFetcher, LoadedDataset, RetryPolicy,
    StoreError,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

mod accumulate;
mod report;

pub use accumulate::{merge_observations, MergeOutcome};
pub use report::{render_run_brief, write_run_report};

#[derive(Debug, Clone)]
pub struct ScrapeConfig {
    pub endpoint: String,
    pub filter_mode: String,
    pub output_path: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub accept_invalid_certs: bool,
    /// 1 scrapes stations one after another; more fans out with that many in flight.
    pub concurrency: usize,
    /// Pause between consecutive station requests in sequential mode.
    pub request_delay: Duration,
    pub directory_retry: RetryPolicy,
    pub station_retry: RetryPolicy,
    /// Rows dated before this day are left out of the written dataset.
    pub since: Option<NaiveDate>,
    pub artifacts_dir: Option<PathBuf>,
    pub reports_dir: Option<PathBuf>,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            filter_mode: DEFAULT_FILTER_MODE.to_string(),
            output_path: PathBuf::from("pakistan_rainfall_data.csv"),
            user_agent: format!("rainscrape/{}", env!("CARGO_PKG_VERSION")),
            http_timeout_secs: 30,
            accept_invalid_certs: false,
            concurrency: 1,
            request_delay: Duration::from_millis(500),
            directory_retry: RetryPolicy::new(5, Duration::from_secs(5)),
            station_retry: RetryPolicy::new(2, Duration::from_secs(5)),
            since: None,
            artifacts_dir: None,
            reports_dir: None,
        }
    }
}

impl ScrapeConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from `lookup`, falling back to defaults for absent or unparseable values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        let retry_delay = parsed("RAINSCRAPE_RETRY_DELAY_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.directory_retry.delay);

        Self {
            endpoint: lookup("RAINSCRAPE_ENDPOINT").unwrap_or(defaults.endpoint),
            filter_mode: lookup("RAINSCRAPE_FILTER_MODE").unwrap_or(defaults.filter_mode),
            output_path: lookup("RAINSCRAPE_OUTPUT")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_path),
            user_agent: lookup("RAINSCRAPE_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: parsed("RAINSCRAPE_HTTP_TIMEOUT_SECS")
                .unwrap_or(defaults.http_timeout_secs),
            accept_invalid_certs: lookup("RAINSCRAPE_ACCEPT_INVALID_CERTS")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            concurrency: parsed("RAINSCRAPE_CONCURRENCY")
                .map(|v| v as usize)
                .unwrap_or(defaults.concurrency),
            request_delay: parsed("RAINSCRAPE_REQUEST_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.request_delay),
            directory_retry: RetryPolicy::new(
                parsed("RAINSCRAPE_MAX_ATTEMPTS")
                    .map(|v| v as usize)
                    .unwrap_or(defaults.directory_retry.max_attempts),
                retry_delay,
            ),
            station_retry: RetryPolicy::new(
                parsed("RAINSCRAPE_STATION_ATTEMPTS")
                    .map(|v| v as usize)
                    .unwrap_or(defaults.station_retry.max_attempts),
                retry_delay,
            ),
            since: lookup("RAINSCRAPE_SINCE").and_then(|v| match v.trim().parse::<NaiveDate>() {
                Ok(date) => Some(date),
                Err(err) => {
                    warn!(value = %v, error = %err, "ignoring RAINSCRAPE_SINCE, want YYYY-MM-DD");
                    None
                }
            }),
            artifacts_dir: lookup("ARTIFACTS_DIR").map(PathBuf::from),
            reports_dir: lookup("RAINSCRAPE_REPORTS_DIR").map(PathBuf::from),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            accept_invalid_certs: self.accept_invalid_certs,
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("station directory unavailable: {0}")]
    DirectoryUnavailable(#[source] SourceError),
    #[error("could not persist dataset: {0}")]
    Persist(#[source] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StationStatus {
    Fetched {
        rows: usize,
        empty_dates: usize,
        unparseable_dates: usize,
        malformed_rows: usize,
    },
    Failed {
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StationOutcome {
    pub station: Station,
    #[serde(flatten)]
    pub status: StationStatus,
}

impl StationOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self.status, StationStatus::Failed { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub source: String,
    pub stations_discovered: usize,
    pub stations_fetched: usize,
    pub stations_failed: usize,
    pub scraped_rows: usize,
    pub empty_dates: usize,
    pub unparseable_dates: usize,
    pub malformed_rows: usize,
    pub existing_rows: usize,
    pub existing_rows_dropped: usize,
    pub history_discarded: bool,
    pub retained: usize,
    pub replaced: usize,
    pub added: usize,
    pub duplicates_removed: usize,
    pub excluded_by_cutoff: usize,
    pub rows_written: usize,
    pub output_path: PathBuf,
    pub stations: Vec<StationOutcome>,
}

struct StationResult {
    outcome: StationOutcome,
    observations: Vec<Observation>,
}

impl StationResult {
    fn failed(station: Station, error: String) -> Self {
        Self {
            outcome: StationOutcome {
                station,
                status: StationStatus::Failed { error },
            },
            observations: Vec::new(),
        }
    }
}

pub struct ScrapePipeline {
    config: ScrapeConfig,
    source: Arc<dyn RainfallSource>,
    store: DatasetStore,
    artifacts: Option<ArtifactStore>,
}

impl ScrapePipeline {
    /// Pipeline against the configured form endpoint.
    pub fn new(config: ScrapeConfig) -> Result<Self> {
        let http = HttpFetcher::new(config.http_client_config())?;
        let source = FormEndpointSource::new(http, config.endpoint.clone())
            .with_filter_mode(config.filter_mode.clone())
            .with_retry(config.directory_retry, config.station_retry);
        Ok(Self::with_source(config, Arc::new(source)))
    }

    pub fn with_source(config: ScrapeConfig, source: Arc<dyn RainfallSource>) -> Self {
        let store = DatasetStore::new(config.output_path.clone());
        let artifacts = config.artifacts_dir.clone().map(ArtifactStore::new);
        Self {
            config,
            source,
            store,
            artifacts,
        }
    }

    /// Fetches and parses the station directory; an unreachable directory is fatal.
    pub async fn load_stations(&self) -> Result<Vec<Station>, PipelineError> {
        let body = self
            .source
            .fetch_directory()
            .await
            .map_err(PipelineError::DirectoryUnavailable)?;
        archive(self.artifacts.as_ref(), Utc::now(), "directory", &body).await;

        let stations = parse_station_directory(&body);
        if stations.is_empty() {
            warn!(source = self.source.source_id(), "station directory lists no stations");
        } else {
            info!(count = stations.len(), "station directory loaded");
        }
        Ok(stations)
    }

    pub async fn run_once(&self) -> Result<RunSummary, PipelineError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("scrape_run", %run_id);
        self.run_inner(run_id).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid) -> Result<RunSummary, PipelineError> {
        let started_at = Utc::now();
        let stations = self.load_stations().await?;
        let results = self.scrape_stations(started_at, &stations).await;

        let mut incoming = Vec::new();
        let mut outcomes = Vec::with_capacity(results.len());
        for result in results {
            incoming.extend(result.observations);
            outcomes.push(result.outcome);
        }
        let scraped_rows = incoming.len();

        let (existing, history_discarded) = match self.store.load().await {
            Ok(loaded) => (loaded, false),
            Err(err) => {
                warn!(
                    path = %self.store.path().display(),
                    error = %err,
                    "existing dataset unusable; continuing with this run's rows only"
                );
                (LoadedDataset::default(), true)
            }
        };
        let existing_rows = existing.dataset.len();

        let merged = merge_observations(existing.dataset, incoming);
        let mut dataset = merged.dataset;
        let excluded_by_cutoff = match self.config.since {
            Some(cutoff) => dataset.retain_since(cutoff),
            None => 0,
        };

        let saved = self
            .store
            .save(&dataset)
            .await
            .map_err(PipelineError::Persist)?;

        let mut summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            source: self.source.source_id().to_string(),
            stations_discovered: stations.len(),
            stations_fetched: outcomes.iter().filter(|o| !o.is_failed()).count(),
            stations_failed: outcomes.iter().filter(|o| o.is_failed()).count(),
            scraped_rows,
            empty_dates: 0,
            unparseable_dates: 0,
            malformed_rows: 0,
            existing_rows,
            existing_rows_dropped: existing.dropped_rows,
            history_discarded,
            retained: merged.retained,
            replaced: merged.replaced,
            added: merged.added,
            duplicates_removed: merged.duplicates_removed,
            excluded_by_cutoff,
            rows_written: saved.rows_written,
            output_path: saved.path,
            stations: outcomes,
        };
        for outcome in &summary.stations {
            if let StationStatus::Fetched {
                empty_dates,
                unparseable_dates,
                malformed_rows,
                ..
            } = outcome.status
            {
                summary.empty_dates += empty_dates;
                summary.unparseable_dates += unparseable_dates;
                summary.malformed_rows += malformed_rows;
            }
        }

        info!(
            stations = summary.stations_discovered,
            failed = summary.stations_failed,
            scraped = summary.scraped_rows,
            written = summary.rows_written,
            duplicates_removed = summary.duplicates_removed,
            "run complete"
        );

        if let Some(reports_dir) = &self.config.reports_dir {
            if let Err(err) = write_run_report(reports_dir, &summary).await {
                warn!(error = %err, "failed to write run report");
            }
        }

        Ok(summary)
    }

    async fn scrape_stations(
        &self,
        fetched_at: DateTime<Utc>,
        stations: &[Station],
    ) -> Vec<StationResult> {
        if self.config.concurrency <= 1 {
            let mut results = Vec::with_capacity(stations.len());
            for (index, station) in stations.iter().enumerate() {
                if index > 0 && !self.config.request_delay.is_zero() {
                    tokio::time::sleep(self.config.request_delay).await;
                }
                results.push(
                    scrape_station(
                        self.source.as_ref(),
                        self.artifacts.as_ref(),
                        fetched_at,
                        station.clone(),
                    )
                    .await,
                );
            }
            return results;
        }

        let width = self.config.concurrency.min(stations.len()).max(1);
        let limit = Arc::new(Semaphore::new(width));
        let (tx, mut rx) = mpsc::channel(width);
        for (index, station) in stations.iter().cloned().enumerate() {
            let limit = Arc::clone(&limit);
            let tx = tx.clone();
            let source = Arc::clone(&self.source);
            let artifacts = self.artifacts.clone();
            tokio::spawn(async move {
                let _permit = limit.acquire_owned().await.expect("semaphore not closed");
                let result =
                    scrape_station(source.as_ref(), artifacts.as_ref(), fetched_at, station).await;
                let _ = tx.send((index, result)).await;
            });
        }
        drop(tx);

        let mut slots: Vec<Option<StationResult>> = stations.iter().map(|_| None).collect();
        while let Some((index, result)) = rx.recv().await {
            slots[index] = Some(result);
        }

        slots
            .into_iter()
            .zip(stations)
            .map(|(slot, station)| {
                slot.unwrap_or_else(|| {
                    warn!(station_id = %station.id, "station task ended without a result");
                    StationResult::failed(station.clone(), "station task aborted".to_string())
                })
            })
            .collect()
    }
}

async fn scrape_station(
    source: &dyn RainfallSource,
    artifacts: Option<&ArtifactStore>,
    fetched_at: DateTime<Utc>,
    station: Station,
) -> StationResult {
    let body = match source.fetch_station(&station).await {
        Ok(body) => body,
        Err(err) => {
            warn!(
                station_id = %station.id,
                station_name = %station.name,
                error = %err,
                "station fetch failed"
            );
            return StationResult::failed(station, err.to_string());
        }
    };
    archive(artifacts, fetched_at, &station.id, &body).await;

    let extract = parse_station_page(&station, &body);
    info!(
        station_id = %station.id,
        station_name = %station.name,
        rows = extract.observations.len(),
        "station scraped"
    );
    StationResult {
        outcome: StationOutcome {
            station,
            status: StationStatus::Fetched {
                rows: extract.observations.len(),
                empty_dates: extract.empty_dates,
                unparseable_dates: extract.unparseable_dates,
                malformed_rows: extract.malformed_rows,
            },
        },
        observations: extract.observations,
    }
}

async fn archive(
    artifacts: Option<&ArtifactStore>,
    fetched_at: DateTime<Utc>,
    label: &str,
    body: &str,
) {
    let Some(store) = artifacts else {
        return;
    };
    if let Err(err) = store.store_html(fetched_at, label, body).await {
        warn!(label, error = %err, "failed to archive raw response");
    }
}
