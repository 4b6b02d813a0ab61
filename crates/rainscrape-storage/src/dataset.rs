use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use csv::StringRecord;
use rainscrape_core::{format_observation_date, parse_observation_date, Dataset, Observation};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::write_atomic;

pub const DATASET_HEADERS: [&str; 6] = [
    "Station ID",
    "Station Name",
    "Province",
    "Reported Station",
    "Rainfall (mm)",
    "Date",
];

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("{path} is missing required columns: {missing:?}")]
    MissingColumns { path: PathBuf, missing: Vec<String> },
}

#[derive(Debug, Clone, Default)]
pub struct LoadedDataset {
    pub dataset: Dataset,
    pub existed: bool,
    pub rows_read: usize,
    /// Rows skipped for an unreadable date, an empty station id or missing fields.
    pub dropped_rows: usize,
}

#[derive(Debug, Clone)]
pub struct SavedDataset {
    pub path: PathBuf,
    pub rows_written: usize,
    pub byte_size: usize,
}

/// Whole-file CSV persistence of the accumulated dataset.
#[derive(Debug, Clone)]
pub struct DatasetStore {
    path: PathBuf,
}

impl DatasetStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing file loads as an empty dataset.
    pub async fn load(&self) -> Result<LoadedDataset, StoreError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no existing dataset");
                return Ok(LoadedDataset::default());
            }
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let mut loaded = decode_dataset(&self.path, &bytes)?;
        loaded.existed = true;
        info!(
            path = %self.path.display(),
            rows = loaded.dataset.len(),
            dropped = loaded.dropped_rows,
            "loaded existing dataset"
        );
        Ok(loaded)
    }

    /// Sorts a copy of `dataset` for output and atomically replaces the file with it.
    pub async fn save(&self, dataset: &Dataset) -> Result<SavedDataset, StoreError> {
        let mut sorted = dataset.clone();
        sorted.sort_for_output();
        let bytes = encode_dataset(&sorted)?;

        write_atomic(&self.path, &bytes)
            .await
            .map_err(|source| StoreError::Io {
                path: self.path.clone(),
                source,
            })?;

        info!(path = %self.path.display(), rows = sorted.len(), "dataset written");
        Ok(SavedDataset {
            path: self.path.clone(),
            rows_written: sorted.len(),
            byte_size: bytes.len(),
        })
    }
}

pub fn encode_dataset(dataset: &Dataset) -> Result<Vec<u8>, csv::Error> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(DATASET_HEADERS)?;
    for obs in dataset.iter() {
        let date = format_observation_date(obs.date);
        writer.write_record([
            obs.station_id.as_str(),
            obs.station_name.as_str(),
            obs.province.as_str(),
            obs.reported_station.as_str(),
            obs.rainfall_mm.as_str(),
            date.as_str(),
        ])?;
    }
    writer
        .into_inner()
        .map_err(|err| csv::Error::from(err.into_error()))
}

/// Parses dataset CSV bytes; `path` only labels errors.
pub fn decode_dataset(path: &Path, bytes: &[u8]) -> Result<LoadedDataset, StoreError> {
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(LoadedDataset::default());
    }

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(bytes);
    let headers = reader.headers()?.clone();
    let columns = Columns::locate(&headers).map_err(|missing| StoreError::MissingColumns {
        path: path.to_path_buf(),
        missing,
    })?;

    let mut loaded = LoadedDataset::default();
    let mut observations = Vec::new();
    for record in reader.records() {
        loaded.rows_read += 1;
        let record = match record {
            Ok(record) => record,
            Err(err) => {
                warn!(error = %err, "skipping unreadable dataset row");
                loaded.dropped_rows += 1;
                continue;
            }
        };
        match columns.observation(&record) {
            Some(obs) => observations.push(obs),
            None => {
                debug!(
                    line = record.position().map(|p| p.line()),
                    "dropping dataset row without a usable station id or date"
                );
                loaded.dropped_rows += 1;
            }
        }
    }

    loaded.dataset = Dataset::from_observations(observations);
    Ok(loaded)
}

struct Columns {
    station_id: usize,
    station_name: usize,
    province: usize,
    reported_station: usize,
    rainfall_mm: usize,
    date: usize,
}

impl Columns {
    fn locate(headers: &StringRecord) -> Result<Self, Vec<String>> {
        let positions: Vec<Option<usize>> = DATASET_HEADERS
            .iter()
            .map(|name| headers.iter().position(|h| h == *name))
            .collect();

        let missing: Vec<String> = DATASET_HEADERS
            .iter()
            .zip(&positions)
            .filter(|(_, pos)| pos.is_none())
            .map(|(name, _)| name.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(missing);
        }

        let at = |i: usize| positions[i].unwrap_or_default();
        Ok(Self {
            station_id: at(0),
            station_name: at(1),
            province: at(2),
            reported_station: at(3),
            rainfall_mm: at(4),
            date: at(5),
        })
    }

    fn observation(&self, record: &StringRecord) -> Option<Observation> {
        let station_id = record.get(self.station_id)?;
        if station_id.is_empty() {
            return None;
        }
        let date = parse_observation_date(record.get(self.date)?).ok()?;
        Some(Observation {
            station_id: station_id.to_string(),
            station_name: record.get(self.station_name)?.to_string(),
            province: record.get(self.province)?.to_string(),
            reported_station: record.get(self.reported_station)?.to_string(),
            rainfall_mm: record.get(self.rainfall_mm)?.to_string(),
            date,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::tempdir;

    fn obs(
        station_id: &str,
        name: &str,
        site: &str,
        rainfall: &str,
        date: (i32, u32, u32),
    ) -> Observation {
        Observation {
            station_id: station_id.to_string(),
            station_name: name.to_string(),
            province: "Khyber Pakhtunkhwa".to_string(),
            reported_station: site.to_string(),
            rainfall_mm: rainfall.to_string(),
            date: NaiveDate::from_ymd_opt(date.0, date.1, date.2).unwrap(),
        }
    }

    #[test]
    fn encoded_file_has_fixed_header_and_date_rendering() {
        let dataset =
            Dataset::from_observations(vec![obs("10", "Lahore", "Airport", "12.5", (2025, 4, 1))]);
        let text = String::from_utf8(encode_dataset(&dataset).unwrap()).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next(),
            Some("Station ID,Station Name,Province,Reported Station,Rainfall (mm),Date")
        );
        assert_eq!(
            lines.next(),
            Some("10,Lahore,Khyber Pakhtunkhwa,Airport,12.5,\"1 Apr, 2025\"")
        );
        assert_eq!(lines.next(), None);
    }

    #[tokio::test]
    async fn save_then_load_preserves_non_ascii_and_output_order() {
        let dir = tempdir().expect("tempdir");
        let store = DatasetStore::new(dir.path().join("rainfall.csv"));
        let dataset = Dataset::from_observations(vec![
            obs("20", "Karachi", "Masroor", "0", (2025, 4, 1)),
            obs("10", "Lahore", "شاہدرہ", "Trace", (2025, 4, 2)),
            obs("30", "Bahawalpur", "Airport", "3", (2025, 4, 1)),
        ]);

        let saved = store.save(&dataset).await.expect("save");
        assert_eq!(saved.rows_written, 3);

        let loaded = store.load().await.expect("load");
        assert!(loaded.existed);
        assert_eq!(loaded.dropped_rows, 0);
        let sites: Vec<_> = loaded
            .dataset
            .iter()
            .map(|o| o.reported_station.as_str())
            .collect();
        assert_eq!(sites, vec!["شاہدرہ", "Airport", "Masroor"]);
    }

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let dir = tempdir().expect("tempdir");
        let store = DatasetStore::new(dir.path().join("absent.csv"));
        let loaded = store.load().await.expect("load");
        assert!(!loaded.existed);
        assert!(loaded.dataset.is_empty());
    }

    #[test]
    fn rows_with_bad_dates_are_dropped_not_fatal() {
        let csv = "\u{feff}Station ID,Station Name,Province,Reported Station,Rainfall (mm),Date\n\
                   10,Lahore,Punjab,Airport,5,\"1 Apr, 2025\"\n\
                   10,Lahore,Punjab,Airport,5,someday\n\
                   ,Lahore,Punjab,Airport,5,\"2 Apr, 2025\"\n\
                   10,Lahore,Punjab\n\
                   20,Karachi,Sindh,Faisal,7,2025-03-31\n";
        let loaded = decode_dataset(Path::new("test.csv"), csv.as_bytes()).unwrap();
        assert_eq!(loaded.rows_read, 5);
        assert_eq!(loaded.dropped_rows, 3);
        assert_eq!(loaded.dataset.len(), 2);
        assert_eq!(
            loaded.dataset.observations()[1].date,
            NaiveDate::from_ymd_opt(2025, 3, 31).unwrap()
        );
    }

    #[test]
    fn columns_are_located_by_name() {
        let csv = "Date,Rainfall (mm),Reported Station,Province,Station Name,Station ID\n\
                   \"5 Apr, 2025\",9,Airport,Punjab,Lahore,10\n";
        let loaded = decode_dataset(Path::new("test.csv"), csv.as_bytes()).unwrap();
        let first = &loaded.dataset.observations()[0];
        assert_eq!(first.station_id, "10");
        assert_eq!(first.rainfall_mm, "9");
    }

    #[test]
    fn missing_columns_are_reported() {
        let csv = "Station ID,Date\n10,\"1 Apr, 2025\"\n";
        let err = decode_dataset(Path::new("test.csv"), csv.as_bytes()).unwrap_err();
        match err {
            StoreError::MissingColumns { missing, .. } => {
                assert_eq!(
                    missing,
                    vec!["Station Name", "Province", "Reported Station", "Rainfall (mm)"]
                );
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn empty_file_is_an_empty_dataset() {
        let loaded = decode_dataset(Path::new("test.csv"), b"\n").unwrap();
        assert!(loaded.dataset.is_empty());
    }

    #[tokio::test]
    async fn failed_save_leaves_previous_file_untouched() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("rainfall.csv");
        std::fs::write(&path, "previous").unwrap();

        // A regular file in place of the parent directory makes the write fail.
        let blocked = DatasetStore::new(path.join("child.csv"));
        let err = blocked.save(&Dataset::new()).await.unwrap_err();
        assert!(matches!(err, StoreError::Io { .. }));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "previous");
    }

    #[tokio::test]
    async fn failed_rename_removes_the_temp_file() {
        let dir = tempdir().expect("tempdir");
        // A non-empty directory at the destination makes the final rename fail.
        let path = dir.path().join("rainfall.csv");
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("keep"), "x").unwrap();

        let err = DatasetStore::new(path.clone())
            .save(&Dataset::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Io { .. }));

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .filter(|name| name.ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "temp files left behind: {leftovers:?}");
        assert!(path.join("keep").exists());
    }
}
