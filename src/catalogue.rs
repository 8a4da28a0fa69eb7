#![forbid(unsafe_code)]

//! Catalogue adapters: where a tracked series' season manifests come from.

use crate::fetch::fetch_text;
use crate::tracking::{SeasonSpec, TrackedSeries};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use ureq::Agent;

pub const ANIME_SAMA: &str = "anime-sama";
const MANIFEST_FILE: &str = "episodes.js";

/// Source of raw season manifests for one streaming site.
pub trait Catalogue: Send + Sync {
    /// Every manifest part of the tracked season, in part order. Any error
    /// means the series is skipped for this cycle.
    fn manifests(&self, series: &TrackedSeries) -> Result<Vec<String>>;
}

/// Adapters keyed by the `streaming` field of tracked entries.
#[derive(Default, Clone)]
pub struct CatalogueSet {
    adapters: HashMap<String, Arc<dyn Catalogue>>,
}

impl CatalogueSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, streaming: impl Into<String>, catalogue: Arc<dyn Catalogue>) -> Self {
        self.adapters.insert(streaming.into(), catalogue);
        self
    }

    pub fn get(&self, streaming: &str) -> Option<&Arc<dyn Catalogue>> {
        self.adapters.get(streaming.trim())
    }
}

/// Season path segments for a season spec: `saison3`, `saison3-2`, ...
pub fn season_parts(spec: SeasonSpec) -> Vec<String> {
    (1..=spec.parts)
        .map(|part| match part {
            1 => format!("saison{}", spec.base),
            part => format!("saison{}-{part}", spec.base),
        })
        .collect()
}

pub struct AnimeSamaCatalogue {
    agent: Agent,
    base_url: String,
    cache_dir: PathBuf,
}

impl AnimeSamaCatalogue {
    pub fn new(agent: Agent, base_url: impl Into<String>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            agent,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            cache_dir: cache_dir.into(),
        }
    }

    pub fn manifest_url(&self, name: &str, part: &str, language: &str) -> String {
        format!(
            "{}/catalogue/{}/{part}/{}/{MANIFEST_FILE}",
            self.base_url,
            name.trim(),
            language.trim()
        )
    }

    fn cache(&self, series: &TrackedSeries, spec: SeasonSpec, part: usize, body: &str) {
        let name = format!(
            "{}-s{}-part{}.js",
            series.series_folder().replace(['/', '\\'], "_"),
            spec.base,
            part
        );
        let path = self.cache_dir.join(name);
        if let Err(err) = fs::create_dir_all(&self.cache_dir).and_then(|_| fs::write(&path, body)) {
            log::debug!("could not cache manifest at {}: {err}", path.display());
        }
    }
}

impl Catalogue for AnimeSamaCatalogue {
    fn manifests(&self, series: &TrackedSeries) -> Result<Vec<String>> {
        let spec = series.season_spec()?;
        let mut manifests = Vec::with_capacity(spec.parts as usize);
        for (index, part) in season_parts(spec).iter().enumerate() {
            let url = self.manifest_url(&series.name, part, &series.langage);
            let response = fetch_text(&self.agent, &url, &[])
                .with_context(|| format!("fetching manifest {url}"))?;
            self.cache(series, spec, index + 1, &response.body);
            manifests.push(response.body);
        }
        Ok(manifests)
    }
}
