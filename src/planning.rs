#![forbid(unsafe_code)]

//! Remote planning signal and the decision to retire tracked series.
//!
//! The planning document is produced by a separate scraper; the daemon only
//! reads it and never touches the episode store because of it.

use crate::tracking::TrackedSeries;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanningEntry {
    pub series: String,
    pub season: String,
    #[serde(alias = "langage")]
    pub language: String,
    pub found_in_remote_schedule: bool,
    #[serde(default)]
    pub expected_day: String,
    #[serde(default)]
    pub actual_day: Option<String>,
    /// `None` when the scraper could not tell.
    #[serde(default)]
    pub episodes_complete: Option<bool>,
}

impl PlanningEntry {
    pub fn describes(&self, series: &TrackedSeries) -> bool {
        self.series.trim().eq_ignore_ascii_case(series.name.trim())
            && self.season.trim() == series.season.trim()
            && self.language.trim().eq_ignore_ascii_case(series.langage.trim())
    }
}

pub trait PlanningSource: Send + Sync {
    fn load(&self) -> Result<Vec<PlanningEntry>>;
}

/// Reads `database/planning_scan_data.json`, a JSON array of entries. A
/// missing file means no signal.
pub struct FilePlanningSource {
    path: PathBuf,
}

impl FilePlanningSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl PlanningSource for FilePlanningSource {
    fn load(&self) -> Result<Vec<PlanningEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("Reading {}", self.path.display()))?;
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&raw).with_context(|| format!("Parsing {}", self.path.display()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanningDecision {
    /// No planning entry for this series.
    Unknown,
    /// Still scheduled on the expected day.
    Scheduled,
    /// Still scheduled, but on another day than tracked.
    Moved { expected: String, actual: String },
    /// Gone from the schedule but not fully downloaded yet.
    HoldIncomplete,
    /// Gone from the schedule and fully downloaded.
    Retire,
}

/// `season_complete` is the store's view: `Some(true)` when the season has
/// episodes and all of them are downloaded.
pub fn decide(entry: Option<&PlanningEntry>, season_complete: Option<bool>) -> PlanningDecision {
    let Some(entry) = entry else {
        return PlanningDecision::Unknown;
    };
    if entry.found_in_remote_schedule {
        return match &entry.actual_day {
            Some(actual) if !actual.trim().eq_ignore_ascii_case(entry.expected_day.trim()) => {
                PlanningDecision::Moved {
                    expected: entry.expected_day.clone(),
                    actual: actual.clone(),
                }
            }
            _ => PlanningDecision::Scheduled,
        };
    }
    let downloaded = season_complete == Some(true);
    if downloaded && entry.episodes_complete != Some(false) {
        PlanningDecision::Retire
    } else {
        PlanningDecision::HoldIncomplete
    }
}
