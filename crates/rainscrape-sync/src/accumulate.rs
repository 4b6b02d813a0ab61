use std::collections::HashMap;

use rainscrape_core::{Dataset, Observation, ObservationKey};

/// Result of folding one run's observations into the persisted history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub dataset: Dataset,
    /// Existing rows kept as they were.
    pub retained: usize,
    /// Existing keys whose row was replaced by a newer scrape.
    pub replaced: usize,
    /// Keys seen for the first time.
    pub added: usize,
    /// Input rows that collapsed into another row with the same key.
    pub duplicates_removed: usize,
}

/// Merges `incoming` into `existing`, one row per key, later rows winning.
///
/// Survivors keep their relative order: existing rows first, then incoming rows in
/// arrival order. A replaced row moves to the position of its replacement.
pub fn merge_observations(existing: Dataset, incoming: Vec<Observation>) -> MergeOutcome {
    let total_in = existing.len() + incoming.len();
    let mut slots: Vec<Option<Observation>> = Vec::with_capacity(total_in);
    let mut positions: HashMap<ObservationKey, usize> = HashMap::with_capacity(total_in);

    for obs in existing {
        if let Some(prev) = positions.insert(obs.key(), slots.len()) {
            slots[prev] = None;
        }
        slots.push(Some(obs));
    }
    let boundary = slots.len();

    let mut replaced = 0;
    let mut added = 0;
    for obs in incoming {
        match positions.insert(obs.key(), slots.len()) {
            Some(prev) => {
                if prev < boundary && slots[prev].is_some() {
                    replaced += 1;
                }
                slots[prev] = None;
            }
            None => added += 1,
        }
        slots.push(Some(obs));
    }

    let retained = slots[..boundary].iter().filter(|s| s.is_some()).count();
    let dataset: Dataset = slots.into_iter().flatten().collect();
    debug_assert!(dataset.has_unique_keys());

    MergeOutcome {
        duplicates_removed: total_in - dataset.len(),
        dataset,
        retained,
        replaced,
        added,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn obs(station_id: &str, site: &str, rainfall: &str, date: (i32, u32, u32)) -> Observation {
        Observation {
            station_id: station_id.to_string(),
            station_name: format!("Station {station_id}"),
            province: "Sindh".to_string(),
            reported_station: site.to_string(),
            rainfall_mm: rainfall.to_string(),
            date: NaiveDate::from_ymd_opt(date.0, date.1, date.2).unwrap(),
        }
    }

    fn ten_rows() -> Dataset {
        (1..=10)
            .map(|day| obs("12", "X", &day.to_string(), (2025, 4, day)))
            .collect()
    }

    #[test]
    fn merging_a_dataset_with_itself_changes_nothing() {
        let existing = ten_rows();
        let outcome = merge_observations(existing.clone(), existing.clone().into_observations());
        assert_eq!(outcome.dataset, existing);
        assert_eq!(outcome.replaced, 10);
        assert_eq!(outcome.added, 0);
        assert_eq!(outcome.retained, 0);
        assert_eq!(outcome.duplicates_removed, 10);
    }

    #[test]
    fn latest_scrape_wins_for_the_same_key() {
        let existing = Dataset::from_observations(vec![obs("12", "X", "5", (2025, 4, 1))]);
        let outcome = merge_observations(existing, vec![obs("12", "X", "7", (2025, 4, 1))]);
        assert_eq!(outcome.dataset.len(), 1);
        assert_eq!(outcome.dataset.observations()[0].rainfall_mm, "7");
        assert_eq!(outcome.replaced, 1);
    }

    #[test]
    fn empty_scrape_keeps_history() {
        let existing = ten_rows();
        let outcome = merge_observations(existing.clone(), Vec::new());
        assert_eq!(outcome.dataset, existing);
        assert_eq!(outcome.retained, 10);
        assert_eq!(outcome.duplicates_removed, 0);
    }

    #[test]
    fn keys_stay_unique_across_mixed_inputs() {
        let existing = Dataset::from_observations(vec![
            obs("12", "X", "1", (2025, 4, 1)),
            obs("12", "Y", "2", (2025, 4, 1)),
            obs("12", "X", "3", (2025, 4, 1)),
            obs("13", "X", "4", (2025, 4, 1)),
        ]);
        let incoming = vec![
            obs("12", "Y", "9", (2025, 4, 1)),
            obs("12", "Z", "8", (2025, 4, 2)),
            obs("12", "Z", "6", (2025, 4, 2)),
        ];
        let outcome = merge_observations(existing, incoming);

        assert!(outcome.dataset.has_unique_keys());
        assert_eq!(outcome.dataset.len(), 4);
        assert_eq!(outcome.retained, 2);
        assert_eq!(outcome.replaced, 1);
        assert_eq!(outcome.added, 1);
        assert_eq!(outcome.duplicates_removed, 3);

        let rainfall: Vec<_> = outcome
            .dataset
            .iter()
            .map(|o| o.rainfall_mm.as_str())
            .collect();
        assert_eq!(rainfall, vec!["3", "4", "9", "6"]);
    }

    #[test]
    fn different_sites_on_the_same_day_are_distinct() {
        let existing = Dataset::from_observations(vec![obs("12", "X", "1", (2025, 4, 1))]);
        let outcome = merge_observations(existing, vec![obs("12", "Y", "1", (2025, 4, 1))]);
        assert_eq!(outcome.dataset.len(), 2);
        assert_eq!(outcome.added, 1);
        assert_eq!(outcome.retained, 1);
    }
}
