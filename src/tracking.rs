#![forbid(unsafe_code)]

//! Tracked-series configuration (`config/anime.json`).
//!
//! The document is owned by the dashboard; the daemon reads it every cycle
//! and only ever removes retired day-scheduled entries from it.

use anyhow::{Context, Result, bail};
use chrono::Weekday;
use parking_lot::Mutex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

pub const NO_DAY_KEY: &str = "no_day";
pub const NO_FILE_NAME: &str = "none";
pub const DEFAULT_STREAMING: &str = "anime-sama";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedSeries {
    pub name: String,
    #[serde(deserialize_with = "string_or_number")]
    pub season: String,
    pub langage: String,
    #[serde(default = "default_streaming")]
    pub streaming: String,
    #[serde(default = "default_file_name")]
    pub file_name: String,
}

fn default_streaming() -> String {
    DEFAULT_STREAMING.to_string()
}

fn default_file_name() -> String {
    NO_FILE_NAME.to_string()
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(value) => Ok(value),
        Value::Number(value) => Ok(value.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected season as string or number, got {other}"
        ))),
    }
}

impl TrackedSeries {
    /// Folder and file prefix used on disk.
    pub fn series_folder(&self) -> &str {
        let file_name = self.file_name.trim();
        if file_name.is_empty() || file_name.eq_ignore_ascii_case(NO_FILE_NAME) {
            self.name.trim()
        } else {
            file_name
        }
    }

    pub fn season_spec(&self) -> Result<SeasonSpec> {
        SeasonSpec::parse(&self.season)
    }

    fn same_entry(&self, other: &TrackedSeries) -> bool {
        self.name == other.name && self.season == other.season && self.langage == other.langage
    }
}

/// `"3"` is season 3 in one part, `"3-2"` is season 3 spread over two remote
/// parts (the base part included).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeasonSpec {
    pub base: u32,
    pub parts: u32,
}

impl SeasonSpec {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let (base, parts) = match raw.split_once('-') {
            Some((base, parts)) => (base.trim(), Some(parts.trim())),
            None => (raw, None),
        };
        let base: u32 = base
            .parse()
            .with_context(|| format!("invalid season '{raw}'"))?;
        let parts: u32 = match parts {
            Some(parts) => parts
                .parse()
                .with_context(|| format!("invalid part count in season '{raw}'"))?,
            None => 1,
        };
        if parts == 0 {
            bail!("season '{raw}' has zero parts");
        }
        Ok(Self { base, parts })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackingDocument {
    #[serde(default)]
    pub auto_download: BTreeMap<String, Vec<TrackedSeries>>,
    #[serde(default)]
    pub single_download: Vec<TrackedSeries>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// How the document was stored, so a rewrite keeps the same shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentShape {
    Object,
    WrappedInArray,
}

/// Day keys accepted for a weekday, French first.
pub fn day_names(day: Weekday) -> [&'static str; 2] {
    match day {
        Weekday::Mon => ["lundi", "monday"],
        Weekday::Tue => ["mardi", "tuesday"],
        Weekday::Wed => ["mercredi", "wednesday"],
        Weekday::Thu => ["jeudi", "thursday"],
        Weekday::Fri => ["vendredi", "friday"],
        Weekday::Sat => ["samedi", "saturday"],
        Weekday::Sun => ["dimanche", "sunday"],
    }
}

fn is_day_key(key: &str, day: Weekday) -> bool {
    let key = key.trim().to_lowercase();
    day_names(day).iter().any(|name| *name == key)
}

impl TrackingDocument {
    /// Entries due on `day`: that day's list, then `no_day`, then one-shot
    /// entries.
    pub fn due_on(&self, day: Weekday) -> Vec<TrackedSeries> {
        let mut due = Vec::new();
        for (key, entries) in &self.auto_download {
            if is_day_key(key, day) {
                due.extend(entries.iter().cloned());
            }
        }
        if let Some(entries) = self.auto_download.get(NO_DAY_KEY) {
            due.extend(entries.iter().cloned());
        }
        due.extend(self.single_download.iter().cloned());
        due
    }

    /// Every entry filed under a weekday key, whatever the day.
    pub fn day_entries(&self) -> Vec<(String, TrackedSeries)> {
        self.auto_download
            .iter()
            .filter(|(key, _)| key.as_str() != NO_DAY_KEY)
            .flat_map(|(key, entries)| {
                entries
                    .iter()
                    .map(move |series| (key.clone(), series.clone()))
            })
            .collect()
    }

    fn remove(&mut self, day_key: &str, series: &TrackedSeries) -> bool {
        let Some(entries) = self.auto_download.get_mut(day_key) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|entry| !entry.same_entry(series));
        before != entries.len()
    }
}

/// Serialized access to `anime.json`.
pub struct TrackingFile {
    path: PathBuf,
    lock: Mutex<()>,
}

impl TrackingFile {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn load(&self) -> Result<TrackingDocument> {
        let _guard = self.lock.lock();
        Ok(self.read()?.0)
    }

    /// Removes one day-scheduled entry and persists the document. Removing
    /// an entry that is already gone is a no-op.
    pub fn remove(&self, day_key: &str, series: &TrackedSeries) -> Result<bool> {
        let _guard = self.lock.lock();
        let (mut document, shape) = self.read()?;
        if !document.remove(day_key, series) {
            return Ok(false);
        }
        self.write(&document, shape)?;
        Ok(true)
    }

    fn read(&self) -> Result<(TrackingDocument, DocumentShape)> {
        if !self.path.exists() {
            return Ok((TrackingDocument::default(), DocumentShape::Object));
        }
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("Reading {}", self.path.display()))?;
        if raw.trim().is_empty() {
            return Ok((TrackingDocument::default(), DocumentShape::Object));
        }
        let value: Value = serde_json::from_str(&raw)
            .with_context(|| format!("Parsing {}", self.path.display()))?;
        let (value, shape) = match value {
            Value::Array(mut items) => {
                if items.len() > 1 {
                    log::warn!(
                        "{} holds {} documents, only the first is used",
                        self.path.display(),
                        items.len()
                    );
                }
                if items.is_empty() {
                    return Ok((TrackingDocument::default(), DocumentShape::WrappedInArray));
                }
                (items.swap_remove(0), DocumentShape::WrappedInArray)
            }
            other => (other, DocumentShape::Object),
        };
        let document = serde_json::from_value(value)
            .with_context(|| format!("Decoding {}", self.path.display()))?;
        Ok((document, shape))
    }

    fn write(&self, document: &TrackingDocument, shape: DocumentShape) -> Result<()> {
        let payload = match shape {
            DocumentShape::Object => serde_json::to_vec_pretty(document),
            DocumentShape::WrappedInArray => serde_json::to_vec_pretty(&[document]),
        }
        .context("serializing tracked series")?;
        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, payload)
            .with_context(|| format!("writing {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("replacing {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SAMPLE: &str = r#"{
        "auto_download": {
            "lundi": [{
                "name": "demo", "season": "1", "langage": "vostfr",
                "streaming": "anime-sama", "file_name": "none"
            }],
            "Friday": [{
                "name": "other", "season": 2, "langage": "vf",
                "streaming": "anime-sama", "file_name": "Other Show"
            }],
            "no_day": [{"name": "always", "season": "3-2", "langage": "vostfr"}]
        },
        "single_download": [{
            "name": "once", "season": "1", "langage": "vostfr",
            "streaming": "anime-sama", "file_name": "none"
        }],
        "theme": "dark"
    }"#;

    #[test]
    fn season_spec_parsing() {
        assert_eq!(SeasonSpec::parse("3").unwrap(), SeasonSpec { base: 3, parts: 1 });
        assert_eq!(SeasonSpec::parse(" 3-2 ").unwrap(), SeasonSpec { base: 3, parts: 2 });
        assert!(SeasonSpec::parse("3-0").is_err());
        assert!(SeasonSpec::parse("three").is_err());
    }

    #[test]
    fn due_entries_follow_day_then_no_day_then_single() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("anime.json");
        fs::write(&path, SAMPLE)?;
        let document = TrackingFile::open(&path).load()?;

        let monday: Vec<_> = document
            .due_on(Weekday::Mon)
            .into_iter()
            .map(|series| series.name)
            .collect();
        assert_eq!(monday, vec!["demo", "always", "once"]);

        let friday = document.due_on(Weekday::Fri);
        assert_eq!(friday.len(), 3);
        assert_eq!(friday[0].name, "other");
        assert_eq!(friday[0].season, "2");
        assert_eq!(friday[0].series_folder(), "Other Show");
        assert_eq!(document.due_on(Weekday::Sun).len(), 2);
        assert_eq!(document.day_entries().len(), 2);
        Ok(())
    }

    #[test]
    fn series_folder_falls_back_to_name() {
        let series = TrackedSeries {
            name: "demo".into(),
            season: "1".into(),
            langage: "vostfr".into(),
            streaming: DEFAULT_STREAMING.into(),
            file_name: "none".into(),
        };
        assert_eq!(series.series_folder(), "demo");
    }

    #[test]
    fn remove_preserves_array_shape_and_unknown_keys() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("anime.json");
        fs::write(&path, format!("[{SAMPLE}]"))?;
        let tracking = TrackingFile::open(&path);
        let document = tracking.load()?;
        let (day, series) = document
            .day_entries()
            .into_iter()
            .find(|(_, series)| series.name == "demo")
            .unwrap();

        assert!(tracking.remove(&day, &series)?);
        assert!(!tracking.remove(&day, &series)?);

        let raw: Value = serde_json::from_str(&fs::read_to_string(&path)?)?;
        assert!(raw.is_array());
        assert_eq!(raw[0]["theme"], "dark");
        assert_eq!(raw[0]["auto_download"]["lundi"].as_array().unwrap().len(), 0);
        assert_eq!(raw[0]["auto_download"]["no_day"].as_array().unwrap().len(), 1);
        Ok(())
    }

    #[test]
    fn missing_file_is_empty_document() -> Result<()> {
        let dir = tempdir()?;
        let document = TrackingFile::open(dir.path().join("anime.json")).load()?;
        assert!(document.due_on(Weekday::Mon).is_empty());
        Ok(())
    }
}
