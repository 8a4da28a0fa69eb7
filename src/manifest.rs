#![forbid(unsafe_code)]

//! Season manifest parsing and projection onto the host whitelist.
//!
//! A manifest is a small script listing one array of episode URLs per mirror
//! host (`var eps1 = ['https://...', ...];`). Each array is cleaned up to its
//! dominant host, arrays are re-keyed by that host and projected onto the
//! ordered whitelist, producing one URL per whitelisted host for every
//! episode index.

use crate::library::episode_file_name;
use crate::store::{EpisodeStore, MergeSummary, NO_URL, SeasonKey};
use anyhow::Result;
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use url::Url;

static ARRAY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)(?:\b(?:var|let|const)\s+)?([A-Za-z_$][\w$]*)\s*=\s*\[(.*?)\]")
        .expect("array pattern")
});
static ITEM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"'([^']*)'|"([^"]*)""#).expect("item pattern")
});
static BLOCK_COMMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)/\*.*?\*/").expect("comment pattern")
});
static LINE_COMMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*//.*$").expect("comment pattern")
});

/// One URL array from a manifest, positions preserved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostArray {
    pub name: String,
    pub entries: Vec<Option<String>>,
}

impl HostArray {
    fn usable(&self) -> usize {
        self.entries.iter().filter(|entry| entry.is_some()).count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// No array at all, usually a comment-only placeholder for an
    /// unreleased season.
    Placeholder,
    /// Arrays exist but none carries a usable URL for a whitelisted host.
    NoUsableEntries,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractSummary {
    pub slots: usize,
    pub episodes: usize,
    pub changes: MergeSummary,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractOutcome {
    Skipped(SkipReason),
    Extracted(ExtractSummary),
}

/// `host[:port]` of a URL.
pub fn netloc(raw: &str) -> Option<String> {
    let url = Url::parse(raw.trim()).ok()?;
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

/// Whether a netloc belongs to a whitelisted host pattern. Patterns match
/// exactly, ignoring the port, or as a parent domain.
pub fn host_matches(netloc: &str, pattern: &str) -> bool {
    let netloc = netloc.to_ascii_lowercase();
    let pattern = pattern.to_ascii_lowercase();
    if netloc == pattern {
        return true;
    }
    let host = netloc.split(':').next().unwrap_or(&netloc);
    host == pattern || host.ends_with(&format!(".{pattern}"))
}

/// Every URL array in the manifest text, comments stripped.
pub fn parse_arrays(text: &str) -> Vec<HostArray> {
    let without_blocks = BLOCK_COMMENT_RE.replace_all(text, "");
    let cleaned = LINE_COMMENT_RE.replace_all(&without_blocks, "");
    ARRAY_RE
        .captures_iter(&cleaned)
        .map(|captures| {
            let entries = ITEM_RE
                .captures_iter(&captures[2])
                .map(|item| {
                    let value = item
                        .get(1)
                        .or_else(|| item.get(2))
                        .map(|value| value.as_str().trim())
                        .unwrap_or_default();
                    netloc(value).map(|_| value.to_string())
                })
                .collect();
            HostArray {
                name: captures[1].to_string(),
                entries,
            }
        })
        .collect()
}

/// Most frequent netloc in the array (first seen wins ties); entries on any
/// other netloc are blanked.
pub fn apply_dominant_host(array: &HostArray) -> Option<(String, Vec<Option<String>>)> {
    let hosts: Vec<Option<String>> = array
        .entries
        .iter()
        .map(|entry| entry.as_deref().and_then(netloc))
        .collect();

    let mut counts: HashMap<&str, usize> = HashMap::new();
    let mut order: Vec<&str> = Vec::new();
    for host in hosts.iter().flatten() {
        let count = counts.entry(host.as_str()).or_insert(0);
        if *count == 0 {
            order.push(host.as_str());
        }
        *count += 1;
    }
    let mut dominant: Option<(&str, usize)> = None;
    for host in order {
        let count = counts[host];
        if dominant.is_none_or(|(_, best)| count > best) {
            dominant = Some((host, count));
        }
    }
    let (dominant, _) = dominant?;

    let cleaned = array
        .entries
        .iter()
        .zip(&hosts)
        .map(|(entry, host)| match host {
            Some(host) if host == dominant => entry.clone(),
            _ => None,
        })
        .collect();
    Some((dominant.to_string(), cleaned))
}

/// Projects one manifest onto the whitelist: `result[host][index]`, every
/// host list padded to the longest whitelisted array.
pub fn project(arrays: &[HostArray], whitelist: &[String]) -> Vec<Vec<Option<String>>> {
    let mut by_host: Vec<Option<Vec<Option<String>>>> = vec![None; whitelist.len()];
    for array in arrays {
        if array.usable() == 0 {
            log::info!("array '{}' has no usable entries yet", array.name);
            continue;
        }
        let Some((dominant, entries)) = apply_dominant_host(array) else {
            continue;
        };
        match whitelist
            .iter()
            .position(|pattern| host_matches(&dominant, pattern))
        {
            Some(slot) => {
                if by_host[slot].is_some() {
                    log::debug!("array '{}' replaces an earlier array for {dominant}", array.name);
                }
                by_host[slot] = Some(entries);
            }
            None => log::debug!("array '{}' is on unlisted host {dominant}", array.name),
        }
    }

    let length = by_host
        .iter()
        .flatten()
        .map(Vec::len)
        .max()
        .unwrap_or(0);
    by_host
        .into_iter()
        .map(|entries| {
            let mut entries = entries.unwrap_or_default();
            entries.resize(length, None);
            entries
        })
        .collect()
}

pub struct LinkExtractor {
    store: Arc<EpisodeStore>,
    whitelist: Vec<String>,
}

impl LinkExtractor {
    pub fn new(store: Arc<EpisodeStore>, whitelist: Vec<String>) -> Self {
        Self { store, whitelist }
    }

    /// Per-index URL lists for a season spread over `manifests` (in part
    /// order). Each part is padded to its own length before the next one is
    /// appended, so numbering stays continuous. `None` marks an index with
    /// no URL on any host.
    pub fn slots(&self, manifests: &[String]) -> Result<Vec<Option<Vec<String>>>, SkipReason> {
        let mut combined: Vec<Vec<Option<String>>> = vec![Vec::new(); self.whitelist.len()];
        let mut saw_array = false;
        for manifest in manifests {
            let arrays = parse_arrays(manifest);
            saw_array |= !arrays.is_empty();
            for (host, entries) in combined.iter_mut().zip(project(&arrays, &self.whitelist)) {
                host.extend(entries);
            }
        }
        if !saw_array {
            return Err(SkipReason::Placeholder);
        }

        let length = combined.first().map(Vec::len).unwrap_or(0);
        let slots: Vec<Option<Vec<String>>> = (0..length)
            .map(|index| {
                let urls: Vec<String> = combined
                    .iter()
                    .map(|host| host[index].clone().unwrap_or_else(|| NO_URL.to_string()))
                    .collect();
                urls.iter().any(|url| url != NO_URL).then_some(urls)
            })
            .collect();
        if slots.iter().all(Option::is_none) {
            return Err(SkipReason::NoUsableEntries);
        }
        Ok(slots)
    }

    /// Parses the manifests of one season and merges the result into the
    /// store, keeping the status of episodes already known.
    pub fn extract(
        &self,
        key: &SeasonKey,
        season: u32,
        manifests: &[String],
    ) -> Result<ExtractOutcome> {
        let slots = match self.slots(manifests) {
            Ok(slots) => slots,
            Err(reason) => {
                log::info!("{key}: manifest skipped ({reason:?})");
                return Ok(ExtractOutcome::Skipped(reason));
            }
        };

        let total = slots.len();
        let episodes: Vec<(String, Vec<String>)> = slots
            .into_iter()
            .enumerate()
            .filter_map(|(index, urls)| {
                urls.map(|urls| (episode_file_name(&key.series, season, index + 1), urls))
            })
            .collect();
        let count = episodes.len();
        let changes = self.store.merge_season(key, episodes)?;
        log::info!(
            "{key}: {count} episodes over {total} slots ({} new, {} updated, {} removed)",
            changes.added,
            changes.updated,
            changes.removed
        );
        Ok(ExtractOutcome::Extracted(ExtractSummary {
            slots: total,
            episodes: count,
            changes,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EpisodeStatus;
    use tempfile::tempdir;

    fn whitelist() -> Vec<String> {
        ["host-a.example", "host-b.example", "host-c.example", "host-d.example"]
            .iter()
            .map(|host| host.to_string())
            .collect()
    }

    fn array(name: &str, urls: &[String]) -> String {
        let items: Vec<String> = urls.iter().map(|url| format!("'{url}'")).collect();
        format!("var {name} = [\n    {},\n];\n", items.join(",\n    "))
    }

    fn urls(host: &str, count: usize, prefix: &str) -> Vec<String> {
        (1..=count)
            .map(|index| format!("https://{host}/{prefix}{index}"))
            .collect()
    }

    fn extractor() -> (tempfile::TempDir, LinkExtractor) {
        let dir = tempdir().unwrap();
        let store = Arc::new(EpisodeStore::open(dir.path().join("db.json")));
        (dir, LinkExtractor::new(store, whitelist()))
    }

    fn key() -> SeasonKey {
        SeasonKey::new("anime", "demo", "season 1")
    }

    #[test]
    fn parse_arrays_accepts_declarations_and_skips_comments() {
        let text = r#"
            /* var eps9 = ['https://host-a.example/hidden']; */
            // var eps8 = ['https://host-a.example/hidden'];
            var eps1 = ['https://host-a.example/1', "https://host-a.example/2", ''];
            eps2 = [
                'https://host-b.example/1',
            ];
        "#;
        let arrays = parse_arrays(text);
        assert_eq!(arrays.len(), 2);
        assert_eq!(arrays[0].name, "eps1");
        assert_eq!(arrays[0].entries.len(), 3);
        assert_eq!(arrays[0].entries[2], None);
        assert_eq!(arrays[1].name, "eps2");
        assert_eq!(
            arrays[1].entries,
            vec![Some("https://host-b.example/1".to_string())]
        );
    }

    #[test]
    fn dominant_host_blanks_stray_mirrors() {
        let array = HostArray {
            name: "eps1".into(),
            entries: vec![
                Some("https://host-a.example/1".into()),
                Some("https://host-a.example/2".into()),
                Some("https://host-b.example/3".into()),
            ],
        };
        let (host, entries) = apply_dominant_host(&array).unwrap();
        assert_eq!(host, "host-a.example");
        assert_eq!(entries[0].as_deref(), Some("https://host-a.example/1"));
        assert_eq!(entries[1].as_deref(), Some("https://host-a.example/2"));
        assert_eq!(entries[2], None);
    }

    #[test]
    fn dominant_host_ties_keep_first_seen() {
        let array = HostArray {
            name: "eps1".into(),
            entries: vec![
                Some("https://host-b.example/1".into()),
                Some("https://host-a.example/2".into()),
            ],
        };
        assert_eq!(apply_dominant_host(&array).unwrap().0, "host-b.example");
    }

    #[test]
    fn shorter_hosts_are_padded() {
        let (_dir, extractor) = extractor();
        let manifest = format!(
            "{}{}",
            array("eps1", &urls("host-a.example", 5, "a")),
            array("eps2", &urls("host-b.example", 3, "b"))
        );
        let slots = extractor.slots(&[manifest]).unwrap();
        assert_eq!(slots.len(), 5);
        for (index, slot) in slots.iter().enumerate() {
            let slot = slot.as_ref().unwrap();
            assert_eq!(slot.len(), 4);
            assert_eq!(slot[0], format!("https://host-a.example/a{}", index + 1));
            assert_eq!(slot[2], NO_URL);
            assert_eq!(slot[3], NO_URL);
        }
        assert_eq!(slots[2].as_ref().unwrap()[1], "https://host-b.example/b3");
        assert_eq!(slots[3].as_ref().unwrap()[1], NO_URL);
        assert_eq!(slots[4].as_ref().unwrap()[1], NO_URL);
    }

    #[test]
    fn arrays_are_projected_in_whitelist_order() {
        let (_dir, extractor) = extractor();
        let manifest = format!(
            "{}{}{}",
            array("eps1", &urls("www.host-d.example", 1, "d")),
            array("eps2", &urls("host-a.example", 1, "a")),
            array("eps3", &urls("unlisted.example", 1, "x"))
        );
        let slots = extractor.slots(&[manifest]).unwrap();
        assert_eq!(
            slots[0].clone().unwrap(),
            vec![
                "https://host-a.example/a1".to_string(),
                NO_URL.to_string(),
                NO_URL.to_string(),
                "https://www.host-d.example/d1".to_string(),
            ]
        );
    }

    #[test]
    fn multi_part_numbering_is_contiguous() -> Result<()> {
        let (_dir, extractor) = extractor();
        let part1 = array("eps1", &urls("host-a.example", 12, "p1-"));
        let part2 = array("eps1", &urls("host-a.example", 8, "p2-"));
        let outcome = extractor.extract(&key(), 1, &[part1, part2])?;
        assert!(matches!(
            outcome,
            ExtractOutcome::Extracted(ExtractSummary { episodes: 20, .. })
        ));

        let names: Vec<String> = extractor
            .store
            .get(&key())
            .into_iter()
            .map(|entry| entry.name)
            .collect();
        let expected: Vec<String> = (1..=20)
            .map(|index| episode_file_name("demo", 1, index))
            .collect();
        assert_eq!(names, expected);
        let thirteenth = &extractor.store.get(&key())[12];
        assert_eq!(thirteenth.record.source_urls[0], "https://host-a.example/p2-1");
        Ok(())
    }

    #[test]
    fn empty_index_is_omitted_but_numbering_is_positional() -> Result<()> {
        let (_dir, extractor) = extractor();
        let manifest =
            "var eps1 = ['https://host-a.example/1', '', 'https://host-a.example/3'];".to_string();
        extractor.extract(&key(), 1, &[manifest])?;
        let names: Vec<String> = extractor
            .store
            .get(&key())
            .into_iter()
            .map(|entry| entry.name)
            .collect();
        assert_eq!(names, vec!["demo s1 01.mp4", "demo s1 03.mp4"]);
        Ok(())
    }

    #[test]
    fn placeholder_manifest_writes_nothing() -> Result<()> {
        let (_dir, extractor) = extractor();
        let outcome = extractor.extract(&key(), 1, &["/* coming soon */".to_string()])?;
        assert_eq!(outcome, ExtractOutcome::Skipped(SkipReason::Placeholder));
        let outcome = extractor.extract(&key(), 1, &["var eps1 = [''];".to_string()])?;
        assert_eq!(outcome, ExtractOutcome::Skipped(SkipReason::NoUsableEntries));
        assert!(extractor.store.get(&key()).is_empty());
        assert!(!extractor.store.path().exists());
        Ok(())
    }

    #[test]
    fn downloaded_status_survives_rescan() -> Result<()> {
        let (_dir, extractor) = extractor();
        let manifest = array("eps1", &urls("host-a.example", 3, "a"));
        extractor.extract(&key(), 1, &[manifest.clone()])?;
        extractor.store.upsert(
            &key(),
            "demo s1 02.mp4",
            EpisodeStatus::Downloaded,
            vec!["https://host-a.example/a2".into()],
        )?;

        extractor.extract(&key(), 1, &[manifest])?;
        let episodes = extractor.store.get(&key());
        assert_eq!(episodes.len(), 3);
        assert_eq!(episodes[1].record.status, EpisodeStatus::Downloaded);
        assert_eq!(episodes[1].record.source_urls.len(), 4);
        assert_eq!(episodes[0].record.status, EpisodeStatus::NotDownloaded);
        Ok(())
    }
}
