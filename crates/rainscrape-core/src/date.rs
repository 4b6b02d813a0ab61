use chrono::{NaiveDate, NaiveDateTime};
use thiserror::Error;

/// Rendering used in the dataset file, e.g. `1 Apr, 2025`.
const STORAGE_FORMAT: &str = "%-d %b, %Y";

// Order matters: ISO before day-first numeric so `2025-04-01` is never read as a day.
const DATE_FORMATS: &[&str] = &[
    "%d %b, %Y",
    "%d %B, %Y",
    "%d %b %Y",
    "%d %B %Y",
    "%b %d, %Y",
    "%B %d, %Y",
    "%d-%b-%Y",
    "%Y-%m-%d",
    "%d/%m/%Y",
    "%d-%m-%Y",
];

const DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DateError {
    #[error("date is empty")]
    Empty,
    #[error("unrecognised date {0:?}")]
    Unparseable(String),
}

/// Parses a date as rendered by the source page or by an earlier dataset file.
pub fn parse_observation_date(raw: &str) -> Result<NaiveDate, DateError> {
    let text = canonicalize(raw);
    if text.is_empty() {
        return Err(DateError::Empty);
    }

    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(&text, fmt).ok())
        .or_else(|| {
            DATETIME_FORMATS
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(&text, fmt).ok())
                .map(|dt| dt.date())
        })
        .ok_or_else(|| DateError::Unparseable(raw.trim().to_string()))
}

pub fn format_observation_date(date: NaiveDate) -> String {
    date.format(STORAGE_FORMAT).to_string()
}

/// Collapses whitespace, normalises comma spacing and the `Sept` abbreviation.
fn canonicalize(raw: &str) -> String {
    let spaced = raw.replace(',', " , ");
    spaced
        .split_whitespace()
        .map(|token| {
            if token.eq_ignore_ascii_case("sept") {
                "Sep"
            } else {
                token
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
        .replace(" ,", ",")
}
