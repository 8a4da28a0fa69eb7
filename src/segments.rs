#![forbid(unsafe_code)]

//! Parallel download and verification of the segments of one HLS rendition.

use crate::fetch::{FetchError, fetch_to_file, remove_if_exists};
use anyhow::{Context, Result, bail};
use parking_lot::Mutex;
use regex::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use ureq::Agent;
use walkdir::WalkDir;

pub const MAX_PARALLEL: usize = 4;
pub const MAX_RETRIES: u32 = 3;
const SEGMENT_PREFIX: &str = "segment_";
const SEGMENT_EXTENSION: &str = "ts";

static SEGMENT_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^segment_(\d+)\.ts$").expect("segment pattern")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub url: String,
    pub file_name: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VerifyError {
    #[error("no segment files found")]
    NoSegments,
    #[error("missing segments {0:?}")]
    MissingSegments(Vec<u32>),
    #[error("segment {0} is empty")]
    EmptySegment(String),
}

pub fn segment_file_name(sequence: usize) -> String {
    format!("{SEGMENT_PREFIX}{sequence:05}.{SEGMENT_EXTENSION}")
}

/// Pairs each URL with its 1-based sequence file name.
pub fn plan_segments(urls: Vec<String>) -> Vec<Segment> {
    urls.into_iter()
        .enumerate()
        .map(|(index, url)| Segment {
            url,
            file_name: segment_file_name(index + 1),
        })
        .collect()
}

pub struct SegmentDownloader {
    agent: Agent,
    max_parallel: usize,
    retries: u32,
    backoff_unit: Duration,
}

impl SegmentDownloader {
    pub fn new(agent: Agent) -> Self {
        Self {
            agent,
            max_parallel: MAX_PARALLEL,
            retries: MAX_RETRIES,
            backoff_unit: Duration::from_secs(1),
        }
    }

    /// Base of the `2^attempt` backoff between retries.
    pub fn with_backoff_unit(mut self, unit: Duration) -> Self {
        self.backoff_unit = unit;
        self
    }

    /// Fetches every segment into `dir`. Failed segments get one more
    /// sequential attempt once the parallel pass is over; anything still
    /// missing after that fails the whole download.
    pub fn download(
        &self,
        segments: &[Segment],
        headers: &[(String, String)],
        dir: &Path,
    ) -> Result<()> {
        if segments.is_empty() {
            bail!("playlist has no segments");
        }
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;

        let workers = self.max_parallel.min(segments.len()).max(1);
        let next = AtomicUsize::new(0);
        let failed = Mutex::new(Vec::new());
        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    loop {
                        let index = next.fetch_add(1, Ordering::Relaxed);
                        let Some(segment) = segments.get(index) else {
                            break;
                        };
                        if let Err(err) = self.fetch_with_retry(segment, headers, dir) {
                            log::warn!("segment {} failed: {err}", segment.file_name);
                            failed.lock().push(index);
                        }
                    }
                });
            }
        });

        let mut failed = failed.into_inner();
        failed.sort_unstable();
        if !failed.is_empty() {
            log::info!("retrying {} failed segments sequentially", failed.len());
        }
        let mut still_failed = Vec::new();
        for index in failed {
            let segment = &segments[index];
            if let Err(err) = self.fetch_once(segment, headers, dir) {
                log::warn!("segment {} failed again: {err}", segment.file_name);
                still_failed.push(segment.file_name.clone());
            }
        }
        if !still_failed.is_empty() {
            bail!(
                "{} of {} segments could not be fetched: {}",
                still_failed.len(),
                segments.len(),
                still_failed.join(", ")
            );
        }
        Ok(())
    }

    fn fetch_with_retry(
        &self,
        segment: &Segment,
        headers: &[(String, String)],
        dir: &Path,
    ) -> Result<(), FetchError> {
        let mut attempt = 0;
        loop {
            match self.fetch_once(segment, headers, dir) {
                Ok(()) => return Ok(()),
                Err(err) if attempt < self.retries => {
                    attempt += 1;
                    let delay = self.backoff_unit * 2u32.pow(attempt);
                    log::debug!(
                        "segment {} attempt {attempt} failed ({err}), retrying in {delay:?}",
                        segment.file_name
                    );
                    thread::sleep(delay);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Leftovers from an earlier run are discarded, never resumed.
    fn fetch_once(
        &self,
        segment: &Segment,
        headers: &[(String, String)],
        dir: &Path,
    ) -> Result<(), FetchError> {
        let path = dir.join(&segment.file_name);
        remove_if_exists(&path)?;
        match fetch_to_file(&self.agent, &segment.url, headers, &path) {
            Ok(_) => Ok(()),
            Err(err) => {
                let _ = remove_if_exists(&path);
                Err(err)
            }
        }
    }
}

/// Checks the segment files in `dir` before merging: at least one present,
/// sequence numbers contiguous from 1 up to `expected` (or the highest one
/// found) and no empty file. Returns the files in sequence order.
pub fn verify_segments(dir: &Path, expected: usize) -> Result<Vec<PathBuf>, VerifyError> {
    let mut found: BTreeMap<u32, (PathBuf, u64)> = BTreeMap::new();
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
    {
        let name = entry.file_name().to_string_lossy();
        let Some(captures) = SEGMENT_NAME_RE.captures(&name) else {
            continue;
        };
        let Ok(sequence) = captures[1].parse::<u32>() else {
            continue;
        };
        let size = entry.metadata().map(|metadata| metadata.len()).unwrap_or(0);
        found.insert(sequence, (entry.path().to_path_buf(), size));
    }

    let Some(&highest) = found.keys().next_back() else {
        return Err(VerifyError::NoSegments);
    };
    let last = highest.max(u32::try_from(expected).unwrap_or(u32::MAX));
    let missing: Vec<u32> = (1..=last)
        .filter(|sequence| !found.contains_key(sequence))
        .collect();
    if !missing.is_empty() {
        return Err(VerifyError::MissingSegments(missing));
    }

    let mut files = Vec::with_capacity(found.len());
    for (path, size) in found.into_values() {
        if size == 0 {
            return Err(VerifyError::EmptySegment(
                path.file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            ));
        }
        files.push(path);
    }
    Ok(files)
}

/// Writes an ffmpeg concat list, quoting each path.
pub fn write_concat_list(files: &[PathBuf], list_path: &Path) -> Result<()> {
    let mut contents = String::new();
    for file in files {
        let escaped = file.to_string_lossy().replace('\'', r"'\''");
        contents.push_str(&format!("file '{escaped}'\n"));
    }
    fs::write(list_path, contents).with_context(|| format!("writing {}", list_path.display()))
}
