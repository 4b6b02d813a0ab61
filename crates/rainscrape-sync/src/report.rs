use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;

use crate::{RunSummary, StationStatus};

/// Writes `run_summary.json` and `run_brief.md` under `<reports_dir>/<run_id>/`.
pub async fn write_run_report(reports_dir: &Path, summary: &RunSummary) -> Result<PathBuf> {
    let run_dir = reports_dir.join(summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(run_dir.join("run_summary.json"), json)
        .await
        .context("writing run_summary.json")?;

    fs::write(run_dir.join("run_brief.md"), render_run_brief(summary))
        .await
        .context("writing run_brief.md")?;

    Ok(run_dir)
}

pub fn render_run_brief(summary: &RunSummary) -> String {
    let mut lines = vec![
        "# Rainfall Scrape Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!("- Source: {}", summary.source),
        format!(
            "- Stations: {} discovered, {} fetched, {} failed",
            summary.stations_discovered, summary.stations_fetched, summary.stations_failed
        ),
        format!("- Scraped rows: {}", summary.scraped_rows),
        format!(
            "- Dropped during extraction: {} blank dates, {} unparseable dates, {} malformed rows",
            summary.empty_dates, summary.unparseable_dates, summary.malformed_rows
        ),
        format!(
            "- Merge: {} retained, {} replaced, {} added, {} duplicates removed",
            summary.retained, summary.replaced, summary.added, summary.duplicates_removed
        ),
        format!(
            "- Rows written: {} to `{}`",
            summary.rows_written,
            summary.output_path.display()
        ),
    ];
    if summary.history_discarded {
        lines.push("- Existing dataset was unreadable and was replaced".to_string());
    }
    if summary.excluded_by_cutoff > 0 {
        lines.push(format!("- Excluded by cutoff: {}", summary.excluded_by_cutoff));
    }

    let failures: Vec<String> = summary
        .stations
        .iter()
        .filter_map(|outcome| match &outcome.status {
            StationStatus::Failed { error } => Some(format!(
                "- {} ({}): {}",
                outcome.station.name, outcome.station.id, error
            )),
            StationStatus::Fetched { .. } => None,
        })
        .collect();
    if !failures.is_empty() {
        lines.push(String::new());
        lines.push("## Failed Stations".to_string());
        lines.extend(failures);
    }

    lines.push(String::new());
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StationOutcome;
    use chrono::Utc;
    use rainscrape_core::Station;
    use tempfile::tempdir;
    use uuid::Uuid;

    fn summary(stations: Vec<StationOutcome>) -> RunSummary {
        let now = Utc::now();
        RunSummary {
            run_id: Uuid::new_v4(),
            started_at: now,
            finished_at: now,
            source: "fake".to_string(),
            stations_discovered: stations.len(),
            stations_fetched: 1,
            stations_failed: 1,
            scraped_rows: 3,
            empty_dates: 1,
            unparseable_dates: 0,
            malformed_rows: 0,
            existing_rows: 0,
            existing_rows_dropped: 0,
            history_discarded: false,
            retained: 0,
            replaced: 0,
            added: 3,
            duplicates_removed: 0,
            excluded_by_cutoff: 0,
            rows_written: 3,
            output_path: PathBuf::from("rain.csv"),
            stations,
        }
    }

    #[tokio::test]
    async fn report_files_land_under_the_run_id() {
        let dir = tempdir().expect("tempdir");
        let summary = summary(vec![
            StationOutcome {
                station: Station::new("10", "Lahore"),
                status: StationStatus::Fetched {
                    rows: 3,
                    empty_dates: 1,
                    unparseable_dates: 0,
                    malformed_rows: 0,
                },
            },
            StationOutcome {
                station: Station::new("20", "Karachi"),
                status: StationStatus::Failed {
                    error: "connection reset".to_string(),
                },
            },
        ]);

        let run_dir = write_run_report(dir.path(), &summary).await.expect("report");
        assert_eq!(run_dir, dir.path().join(summary.run_id.to_string()));

        let json: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(run_dir.join("run_summary.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(json["rows_written"], 3);
        assert_eq!(json["stations"][1]["status"], "failed");

        let brief = std::fs::read_to_string(run_dir.join("run_brief.md")).unwrap();
        assert!(brief.contains("## Failed Stations"));
        assert!(brief.contains("- Karachi (20): connection reset"));
    }
}
