//! Source contract for the rainfall form endpoint plus the station directory and table parsers.

use std::sync::LazyLock;

use async_trait::async_trait;
use rainscrape_core::{parse_observation_date, DateError, Observation, Station};
use rainscrape_storage::{FetchError, HttpFetcher, RetryPolicy};
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_ENDPOINT: &str = "https://nwfc.pmd.gov.pk/new/rainfall.php";
pub const DEFAULT_FILTER_MODE: &str = "station";

static STATION_OPTIONS: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("select[name='station'] option").expect("valid selector"));
static DATA_TABLE: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("table.table-bordered").expect("valid selector"));
static TABLE_ROWS: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("tr").expect("valid selector"));

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{0}")]
    Message(String),
}

/// Where station pages come from; the pipeline only ever sees raw bodies.
#[async_trait]
pub trait RainfallSource: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch_directory(&self) -> Result<String, SourceError>;

    async fn fetch_station(&self, station: &Station) -> Result<String, SourceError>;
}

/// The weather service's rainfall form: `GET` for the station list, `POST` per station.
#[derive(Debug, Clone)]
pub struct FormEndpointSource {
    http: HttpFetcher,
    endpoint: String,
    filter_mode: String,
    directory_retry: RetryPolicy,
    station_retry: RetryPolicy,
}

impl FormEndpointSource {
    pub fn new(http: HttpFetcher, endpoint: impl Into<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
            filter_mode: DEFAULT_FILTER_MODE.to_string(),
            directory_retry: RetryPolicy::default(),
            station_retry: RetryPolicy::default(),
        }
    }

    pub fn with_filter_mode(mut self, filter_mode: impl Into<String>) -> Self {
        self.filter_mode = filter_mode.into();
        self
    }

    pub fn with_retry(mut self, directory: RetryPolicy, station: RetryPolicy) -> Self {
        self.directory_retry = directory;
        self.station_retry = station;
        self
    }
}

#[async_trait]
impl RainfallSource for FormEndpointSource {
    fn source_id(&self) -> &str {
        &self.endpoint
    }

    async fn fetch_directory(&self) -> Result<String, SourceError> {
        let resp = self
            .http
            .get_text(&self.endpoint, &self.directory_retry)
            .await?;
        debug!(status = %resp.status, url = %resp.final_url, "station directory fetched");
        Ok(resp.body)
    }

    async fn fetch_station(&self, station: &Station) -> Result<String, SourceError> {
        let form = [
            ("station", station.id.as_str()),
            ("filter", self.filter_mode.as_str()),
        ];
        let resp = self
            .http
            .post_form_text(&self.endpoint, &form, &self.station_retry)
            .await?;
        debug!(
            station_id = %station.id,
            status = %resp.status,
            url = %resp.final_url,
            "station page fetched"
        );
        Ok(resp.body)
    }
}

/// Stations offered by the form's `station` selector, in page order.
///
/// Only options with an all-digit value count; anything else (placeholders, a missing
/// control) yields fewer or no stations rather than an error.
pub fn parse_station_directory(html: &str) -> Vec<Station> {
    let document = Html::parse_document(html);
    document
        .select(&STATION_OPTIONS)
        .filter_map(|option| {
            let value = option.value().attr("value")?.trim();
            if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            Some(Station::new(value, cell_text(option)))
        })
        .collect()
}

/// One data row of a station's result table, dates still raw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRow {
    pub province: String,
    pub reported_station: String,
    pub rainfall_mm: String,
    pub raw_date: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableExtract {
    pub rows: Vec<TableRow>,
    /// Rows after the header whose cell count was not four.
    pub malformed_rows: usize,
}

/// Rows of the first bordered data table, header row excluded.
pub fn extract_table_rows(html: &str) -> TableExtract {
    let document = Html::parse_document(html);
    let Some(table) = document.select(&DATA_TABLE).next() else {
        return TableExtract::default();
    };

    let mut extract = TableExtract::default();
    for row in table.select(&TABLE_ROWS).skip(1) {
        let cells: Vec<String> = row
            .children()
            .filter_map(ElementRef::wrap)
            .filter(|el| el.value().name() == "td")
            .map(cell_text)
            .collect();

        match <[String; 4]>::try_from(cells) {
            Ok([province, reported_station, rainfall_mm, raw_date]) => {
                extract.rows.push(TableRow {
                    province,
                    reported_station,
                    rainfall_mm,
                    raw_date,
                })
            }
            Err(cells) => {
                debug!(cells = cells.len(), "skipping table row without four cells");
                extract.malformed_rows += 1;
            }
        }
    }
    extract
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StationExtract {
    pub observations: Vec<Observation>,
    pub malformed_rows: usize,
    pub empty_dates: usize,
    pub unparseable_dates: usize,
}

/// Attaches the station and a parsed date to each row; rows without a usable date are dropped.
pub fn observations_from_rows(station: &Station, table: TableExtract) -> StationExtract {
    let mut extract = StationExtract {
        malformed_rows: table.malformed_rows,
        ..Default::default()
    };

    for row in table.rows {
        let date = match parse_observation_date(&row.raw_date) {
            Ok(date) => date,
            Err(DateError::Empty) => {
                extract.empty_dates += 1;
                continue;
            }
            Err(err @ DateError::Unparseable(_)) => {
                warn!(
                    station_id = %station.id,
                    reported_station = %row.reported_station,
                    error = %err,
                    "dropping row with unparseable date"
                );
                extract.unparseable_dates += 1;
                continue;
            }
        };

        extract.observations.push(Observation {
            station_id: station.id.clone(),
            station_name: station.name.clone(),
            province: row.province,
            reported_station: row.reported_station,
            rainfall_mm: row.rainfall_mm,
            date,
        });
    }

    if extract.empty_dates > 0 {
        debug!(
            station_id = %station.id,
            count = extract.empty_dates,
            "rows with blank dates dropped"
        );
    }
    extract
}

/// Table extraction and date normalisation for one station page.
pub fn parse_station_page(station: &Station, html: &str) -> StationExtract {
    observations_from_rows(station, extract_table_rows(html))
}

fn cell_text(el: ElementRef<'_>) -> String {
    el.text().collect::<String>().trim().to_string()
}
