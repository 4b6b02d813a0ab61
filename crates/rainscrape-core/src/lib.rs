//! Core domain model for rainscrape: stations, observations and the accumulated dataset.

use std::cmp::Ordering;
use std::collections::HashSet;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

mod date;

pub use date::{format_observation_date, parse_observation_date, DateError};

/// A selectable station group exposed by the source form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Station {
    pub id: String,
    pub name: String,
}

impl Station {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// One rainfall reading for a station, reporting site and calendar date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub station_id: String,
    pub station_name: String,
    pub province: String,
    pub reported_station: String,
    /// Kept as rendered by the source; units and precision vary between stations.
    pub rainfall_mm: String,
    pub date: NaiveDate,
}

impl Observation {
    pub fn key(&self) -> ObservationKey {
        ObservationKey {
            station_id: self.station_id.clone(),
            date: self.date,
            reported_station: self.reported_station.clone(),
        }
    }
}

/// Identity of an observation inside a [`Dataset`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObservationKey {
    pub station_id: String,
    pub date: NaiveDate,
    pub reported_station: String,
}

/// Ordered collection of observations persisted between runs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Dataset {
    observations: Vec<Observation>,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_observations(observations: Vec<Observation>) -> Self {
        Self { observations }
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Observation> {
        self.observations.iter()
    }

    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    pub fn into_observations(self) -> Vec<Observation> {
        self.observations
    }

    /// Drops observations dated strictly before `cutoff`; returns how many were dropped.
    pub fn retain_since(&mut self, cutoff: NaiveDate) -> usize {
        let before = self.observations.len();
        self.observations.retain(|obs| obs.date >= cutoff);
        before - self.observations.len()
    }

    /// Newest first, then station name; id and site make the order total.
    pub fn sort_for_output(&mut self) {
        self.observations.sort_by(output_order);
    }

    pub fn has_unique_keys(&self) -> bool {
        let mut seen = HashSet::with_capacity(self.observations.len());
        self.observations.iter().all(|obs| seen.insert(obs.key()))
    }
}

impl IntoIterator for Dataset {
    type Item = Observation;
    type IntoIter = std::vec::IntoIter<Observation>;

    fn into_iter(self) -> Self::IntoIter {
        self.observations.into_iter()
    }
}

impl FromIterator<Observation> for Dataset {
    fn from_iter<I: IntoIterator<Item = Observation>>(iter: I) -> Self {
        Self {
            observations: iter.into_iter().collect(),
        }
    }
}

fn output_order(a: &Observation, b: &Observation) -> Ordering {
    b.date
        .cmp(&a.date)
        .then_with(|| a.station_name.cmp(&b.station_name))
        .then_with(|| a.station_id.cmp(&b.station_id))
        .then_with(|| a.reported_station.cmp(&b.reported_station))
}
