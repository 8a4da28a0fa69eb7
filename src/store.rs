#![forbid(unsafe_code)]

//! JSON-backed episode database.
//!
//! The document is a four level tree `library -> series -> season -> episode`
//! and is rewritten wholesale on every mutation. Each public call re-reads the
//! file and holds the store lock across its whole read-modify-write unit, so
//! concurrent callers (workers marking episodes downloaded, the extractor
//! merging new slots) never lose each other's updates.

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

/// Placeholder for a host slot that has no URL.
pub const NO_URL: &str = "none";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeStatus {
    NotDownloaded,
    Downloaded,
}

/// One episode as persisted. `source_urls` holds one entry per whitelisted
/// host, in host priority order, with [`NO_URL`] for absent hosts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpisodeRecord {
    pub status: EpisodeStatus,
    #[serde(rename = "url", default)]
    pub source_urls: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpisodeEntry {
    pub name: String,
    pub record: EpisodeRecord,
}

/// Address of one season: `(library_path, series, season)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeasonKey {
    pub library: String,
    pub series: String,
    pub season: String,
}

impl SeasonKey {
    pub fn new(
        library: impl Into<String>,
        series: impl Into<String>,
        season: impl Into<String>,
    ) -> Self {
        Self {
            library: library.into(),
            series: series.into(),
            season: season.into(),
        }
    }
}

impl std::fmt::Display for SeasonKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.library, self.series, self.season)
    }
}

/// What a [`EpisodeStore::merge_season`] call changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
}

type Season = BTreeMap<String, EpisodeRecord>;
type Document = BTreeMap<String, BTreeMap<String, BTreeMap<String, Season>>>;

pub struct EpisodeStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl EpisodeStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every episode of a season, ordered by name. Unknown libraries, series
    /// or seasons yield an empty list.
    pub fn get(&self, key: &SeasonKey) -> Vec<EpisodeEntry> {
        let _guard = self.lock.lock();
        let document = self.load();
        season_of(&document, key)
            .map(|season| {
                season
                    .iter()
                    .map(|(name, record)| EpisodeEntry {
                        name: name.clone(),
                        record: record.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn not_downloaded(&self, key: &SeasonKey) -> Vec<EpisodeEntry> {
        self.get(key)
            .into_iter()
            .filter(|entry| entry.record.status == EpisodeStatus::NotDownloaded)
            .collect()
    }

    /// `Some(true)` when the season has episodes and all are downloaded,
    /// `None` when the season is unknown or empty.
    pub fn season_complete(&self, key: &SeasonKey) -> Option<bool> {
        let episodes = self.get(key);
        if episodes.is_empty() {
            return None;
        }
        Some(
            episodes
                .iter()
                .all(|entry| entry.record.status == EpisodeStatus::Downloaded),
        )
    }

    /// Inserts or replaces one episode, creating intermediate levels.
    pub fn upsert(
        &self,
        key: &SeasonKey,
        episode: &str,
        status: EpisodeStatus,
        source_urls: Vec<String>,
    ) -> Result<()> {
        let _guard = self.lock.lock();
        let mut document = self.load();
        season_mut(&mut document, key).insert(
            episode.to_string(),
            EpisodeRecord {
                status,
                source_urls,
            },
        );
        self.save(&document)?;
        log::debug!("episode {episode} in {key} set to {status:?}");
        Ok(())
    }

    /// Applies a full extraction result for one season in a single write.
    ///
    /// Existing episodes keep their status and get the new URLs, new ones
    /// start as `NotDownloaded`. Episodes missing from `slots` are dropped
    /// unless already downloaded.
    pub fn merge_season(
        &self,
        key: &SeasonKey,
        slots: Vec<(String, Vec<String>)>,
    ) -> Result<MergeSummary> {
        let _guard = self.lock.lock();
        let mut document = self.load();
        let season = season_mut(&mut document, key);
        let mut summary = MergeSummary::default();

        let produced: BTreeSet<String> = slots.iter().map(|(name, _)| name.clone()).collect();
        season.retain(|name, record| {
            let keep = produced.contains(name) || record.status == EpisodeStatus::Downloaded;
            if !keep {
                summary.removed += 1;
            }
            keep
        });

        for (name, source_urls) in slots {
            match season.get_mut(&name) {
                Some(record) => {
                    if record.source_urls != source_urls {
                        record.source_urls = source_urls;
                        summary.updated += 1;
                    }
                }
                None => {
                    season.insert(
                        name,
                        EpisodeRecord {
                            status: EpisodeStatus::NotDownloaded,
                            source_urls,
                        },
                    );
                    summary.added += 1;
                }
            }
        }

        self.save(&document)?;
        Ok(summary)
    }

    /// Removes a library path and everything below it.
    pub fn delete_path(&self, library: &str) -> Result<bool> {
        let _guard = self.lock.lock();
        let mut document = self.load();
        let removed = document.remove(library).is_some();
        if removed {
            self.save(&document)?;
            log::info!("library path '{library}' removed from episode database");
        }
        Ok(removed)
    }

    pub fn libraries(&self) -> Vec<String> {
        let _guard = self.lock.lock();
        self.load().into_keys().collect()
    }

    /// Reads the document. A missing file is an empty document; an unreadable
    /// one is moved aside before an empty document is assumed, so the next
    /// save never clobbers it.
    fn load(&self) -> Document {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Document::new(),
            Err(err) => {
                log::error!("could not read {}: {err}", self.path.display());
                self.preserve_unreadable();
                return Document::new();
            }
        };
        if raw.trim().is_empty() {
            return Document::new();
        }
        match serde_json::from_str(&raw) {
            Ok(document) => document,
            Err(err) => {
                log::error!("episode database {} is corrupt: {err}", self.path.display());
                self.preserve_unreadable();
                Document::new()
            }
        }
    }

    fn preserve_unreadable(&self) {
        let stamp = Utc::now().format("%Y%m%d%H%M%S");
        let mut backup = self.path.clone().into_os_string();
        backup.push(format!(".corrupt-{stamp}"));
        let backup = PathBuf::from(backup);
        match fs::rename(&self.path, &backup) {
            Ok(()) => log::warn!("unreadable database preserved as {}", backup.display()),
            Err(err) => log::error!(
                "could not preserve unreadable database {}: {err}",
                self.path.display()
            ),
        }
    }

    fn save(&self, document: &Document) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let payload =
            serde_json::to_vec_pretty(document).context("serializing episode database")?;
        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, payload)
            .with_context(|| format!("writing {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("replacing {}", self.path.display()))?;
        Ok(())
    }
}

fn season_of<'a>(document: &'a Document, key: &SeasonKey) -> Option<&'a Season> {
    document
        .get(&key.library)?
        .get(&key.series)?
        .get(&key.season)
}

fn season_mut<'a>(document: &'a mut Document, key: &SeasonKey) -> &'a mut Season {
    document
        .entry(key.library.clone())
        .or_default()
        .entry(key.series.clone())
        .or_default()
        .entry(key.season.clone())
        .or_default()
}
