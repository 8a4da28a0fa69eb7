#![forbid(unsafe_code)]

//! Library-path mapping (`plex_path.json`) and on-disk episode naming.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryPath {
    pub path: String,
    #[serde(default)]
    pub language: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct LibraryMap {
    entries: Vec<LibraryPath>,
}

impl LibraryMap {
    pub fn new(entries: Vec<LibraryPath>) -> Self {
        Self { entries }
    }

    /// Reads the mapping; a missing file is an empty mapping.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
        let entries: Vec<LibraryPath> =
            serde_json::from_str(&raw).with_context(|| format!("Parsing {}", path.display()))?;
        Ok(Self::new(entries))
    }

    pub fn entries(&self) -> &[LibraryPath] {
        &self.entries
    }

    /// Library folder for a language tag. Tags are meant to be unique across
    /// entries; if they are not, the first entry wins.
    pub fn folder_for(&self, language: &str) -> Option<&str> {
        let mut matches = self.entries.iter().filter(|entry| {
            entry
                .language
                .iter()
                .any(|tag| tag.trim().eq_ignore_ascii_case(language.trim()))
        });
        let first = matches.next()?;
        if let Some(duplicate) = matches.next() {
            log::warn!(
                "language '{language}' is mapped to both '{}' and '{}', using the first",
                first.path,
                duplicate.path
            );
        }
        Some(first.path.as_str())
    }
}

pub fn season_folder(season: u32) -> String {
    format!("season {season}")
}

/// `"{series} s{season} {index:02}.mp4"` with a 1-based index.
pub fn episode_file_name(series: &str, season: u32, index: usize) -> String {
    format!("{series} s{season} {index:02}.mp4")
}

/// `{plex_root}/{folder}/{series}/season {n}/{episode}`
pub fn destination_path(
    plex_root: &Path,
    folder: &str,
    series: &str,
    season: u32,
    episode: &str,
) -> PathBuf {
    plex_root
        .join(folder)
        .join(series)
        .join(season_folder(season))
        .join(episode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn folder_lookup_is_case_insensitive_and_first_wins() {
        let map = LibraryMap::new(vec![
            LibraryPath {
                path: "anime".into(),
                language: vec!["VOSTFR".into()],
            },
            LibraryPath {
                path: "anime-vf".into(),
                language: vec!["vf".into(), "vostfr".into()],
            },
        ]);
        assert_eq!(map.folder_for("vostfr"), Some("anime"));
        assert_eq!(map.folder_for("vf"), Some("anime-vf"));
        assert_eq!(map.folder_for("va"), None);
    }

    #[test]
    fn load_reads_json_array() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("plex_path.json");
        fs::write(&path, r#"[{"path": "anime", "language": ["vostfr"]}]"#)?;
        let map = LibraryMap::load(&path)?;
        assert_eq!(map.entries().len(), 1);
        assert!(LibraryMap::load(&dir.path().join("missing.json"))?.entries().is_empty());
        Ok(())
    }

    #[test]
    fn destination_follows_library_layout() {
        let name = episode_file_name("demo", 1, 3);
        assert_eq!(name, "demo s1 03.mp4");
        assert_eq!(
            destination_path(Path::new("/plex"), "anime", "demo", 1, &name),
            PathBuf::from("/plex/anime/demo/season 1/demo s1 03.mp4")
        );
        assert_eq!(episode_file_name("demo", 2, 112), "demo s2 112.mp4");
    }
}
