#![forbid(unsafe_code)]

//! Mirror host strategies and the dispatcher that walks an episode's
//! candidate URLs in priority order.

use crate::fetch::{download_resumable, fetch_text, remove_if_exists};
use crate::hls::{Playlist, best_variant, parse_playlist, resolve_uri};
use crate::manifest::{host_matches, netloc};
use crate::remux::Remuxer;
use crate::segments::{SegmentDownloader, plan_segments, verify_segments, write_concat_list};
use crate::store::NO_URL;
use anyhow::{Context, Result, anyhow, bail};
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use ureq::Agent;

pub type Headers = Vec<(String, String)>;

/// Scratch locations for one attempt at one URL.
#[derive(Debug, Clone)]
pub struct Workspace {
    /// Private directory removed when the attempt ends.
    pub dir: PathBuf,
    /// Resumable single-file target, kept across attempts.
    pub partial_file: PathBuf,
}

/// Turns one candidate URL into a finished media file.
pub trait HostStrategy: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Returns the path of the produced file, inside `workspace`.
    fn acquire(&self, url: &str, workspace: &Workspace) -> Result<PathBuf>;
}

/// How the media (or playlist) URL is found from a candidate URL.
pub enum PageResolver {
    /// The candidate already points at the media.
    Direct,
    /// The candidate is an embed page; the first capture group of the
    /// pattern is the media URL, possibly relative to the page.
    Pattern(Regex),
}

impl PageResolver {
    pub fn pattern(pattern: &str) -> Result<Self> {
        Ok(Self::Pattern(
            Regex::new(pattern).with_context(|| format!("invalid page pattern {pattern}"))?,
        ))
    }

    /// Returns the media URL and the page it was found on.
    fn resolve(
        &self,
        agent: &Agent,
        url: &str,
        headers: &[(String, String)],
    ) -> Result<(String, Option<String>)> {
        match self {
            Self::Direct => Ok((url.to_string(), None)),
            Self::Pattern(pattern) => {
                let page = fetch_text(agent, url, headers)
                    .with_context(|| format!("fetching embed page {url}"))?;
                let raw = pattern
                    .captures(&page.body)
                    .and_then(|captures| captures.get(1))
                    .map(|found| found.as_str().replace("\\/", "/"))
                    .ok_or_else(|| anyhow!("no media link on embed page {url}"))?;
                Ok((resolve_uri(&page.url, &raw)?, Some(page.url)))
            }
        }
    }
}

fn with_referer(headers: &[(String, String)], referer: Option<String>) -> Headers {
    let mut headers: Headers = headers.to_vec();
    if let Some(referer) = referer {
        headers.retain(|(name, _)| !name.eq_ignore_ascii_case("referer"));
        headers.push(("Referer".to_string(), referer));
    }
    headers
}

/// Single-file host: one resumable byte-range download.
pub struct DirectHost {
    agent: Agent,
    headers: Headers,
    resolver: PageResolver,
}

impl DirectHost {
    pub fn new(agent: Agent, headers: Headers, resolver: PageResolver) -> Self {
        Self {
            agent,
            headers,
            resolver,
        }
    }
}

impl HostStrategy for DirectHost {
    fn kind(&self) -> &'static str {
        "direct"
    }

    fn acquire(&self, url: &str, workspace: &Workspace) -> Result<PathBuf> {
        let (media_url, page) = self.resolver.resolve(&self.agent, url, &self.headers)?;
        let headers = with_referer(&self.headers, page);
        let report = download_resumable(&self.agent, &media_url, &headers, &workspace.partial_file)
            .with_context(|| format!("downloading {media_url}"))?;
        log::debug!(
            "{media_url}: {} bytes written (resumed from {}, restarted: {})",
            report.bytes_written,
            report.resumed_from,
            report.restarted
        );
        Ok(workspace.partial_file.clone())
    }
}

/// Segmented host: playlist resolution, parallel segment fetch, verification
/// and remux.
pub struct HlsHost {
    agent: Agent,
    headers: Headers,
    resolver: PageResolver,
    segments: Arc<SegmentDownloader>,
    remuxer: Arc<Remuxer>,
}

impl HlsHost {
    pub fn new(
        agent: Agent,
        headers: Headers,
        resolver: PageResolver,
        segments: Arc<SegmentDownloader>,
        remuxer: Arc<Remuxer>,
    ) -> Self {
        Self {
            agent,
            headers,
            resolver,
            segments,
            remuxer,
        }
    }

    /// Absolute segment URLs of the best rendition.
    fn segment_urls(
        &self,
        playlist_url: &str,
        headers: &[(String, String)],
    ) -> Result<Vec<String>> {
        let fetched = fetch_text(&self.agent, playlist_url, headers)
            .with_context(|| format!("fetching playlist {playlist_url}"))?;
        let (media_url, segments) = match parse_playlist(&fetched.body)? {
            Playlist::Media(segments) => (fetched.url, segments),
            Playlist::Master(variants) => {
                let best = best_variant(&variants)
                    .ok_or_else(|| anyhow!("no variant in {playlist_url}"))?;
                log::debug!("{playlist_url}: picked {:?} ({})", best.resolution, best.uri);
                let variant_url = resolve_uri(&fetched.url, &best.uri)?;
                let media = fetch_text(&self.agent, &variant_url, headers)
                    .with_context(|| format!("fetching rendition {variant_url}"))?;
                match parse_playlist(&media.body)? {
                    Playlist::Media(segments) => (media.url, segments),
                    Playlist::Master(_) => {
                        bail!("rendition {variant_url} is another master playlist")
                    }
                }
            }
        };
        segments
            .iter()
            .map(|segment| resolve_uri(&media_url, segment))
            .collect()
    }
}

impl HostStrategy for HlsHost {
    fn kind(&self) -> &'static str {
        "hls"
    }

    fn acquire(&self, url: &str, workspace: &Workspace) -> Result<PathBuf> {
        let (playlist_url, page) = self.resolver.resolve(&self.agent, url, &self.headers)?;
        let headers = with_referer(&self.headers, page);
        let urls = self.segment_urls(&playlist_url, &headers)?;
        let count = urls.len();
        let segment_dir = workspace.dir.join("segments");
        self.segments
            .download(&plan_segments(urls), &headers, &segment_dir)?;

        let files = verify_segments(&segment_dir, count)?;
        let list = workspace.dir.join("concat.txt");
        write_concat_list(&files, &list)?;
        let output = workspace.dir.join("episode.mp4");
        self.remuxer.merge(&list, &workspace.dir, &output)?;
        log::debug!("{playlist_url}: merged {count} segments");
        Ok(output)
    }
}

/// Ordered `host -> strategy` table. Registration order is the host
/// priority used everywhere, including the manifest whitelist.
#[derive(Default)]
pub struct HostRegistry {
    entries: Vec<(String, Arc<dyn HostStrategy>)>,
}

impl HostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        host: impl Into<String>,
        strategy: Arc<dyn HostStrategy>,
    ) -> &mut Self {
        self.entries.push((host.into(), strategy));
        self
    }

    pub fn hosts(&self) -> Vec<String> {
        self.entries.iter().map(|(host, _)| host.clone()).collect()
    }

    pub fn strategy_for(&self, url: &str) -> Option<(&str, &dyn HostStrategy)> {
        let location = netloc(url)?;
        self.entries
            .iter()
            .find(|(host, _)| host_matches(&location, host))
            .map(|(host, strategy)| (host.as_str(), strategy.as_ref()))
    }

    /// The mirrors used by the anime-sama catalogue, in priority order.
    pub fn catalogue_defaults(
        agent: &Agent,
        segments: Arc<SegmentDownloader>,
        remuxer: Arc<Remuxer>,
    ) -> Result<Self> {
        let referer = |origin: &str| -> Headers {
            vec![
                ("Referer".to_string(), origin.to_string()),
                ("Accept".to_string(), "*/*".to_string()),
            ]
        };

        let mut registry = Self::new();
        registry
            .register(
                "video.sibnet.ru",
                Arc::new(DirectHost::new(
                    agent.clone(),
                    referer("https://video.sibnet.ru/"),
                    PageResolver::pattern(r#"player\.src\(\[\{\s*src:\s*"([^"]+)""#)?,
                )),
            )
            .register(
                "oneupload.to",
                Arc::new(HlsHost::new(
                    agent.clone(),
                    referer("https://oneupload.to/"),
                    PageResolver::pattern(r#"file\s*:\s*"([^"]+\.m3u8[^"]*)""#)?,
                    Arc::clone(&segments),
                    Arc::clone(&remuxer),
                )),
            )
            .register(
                "vidmoly.to",
                Arc::new(HlsHost::new(
                    agent.clone(),
                    referer("https://vidmoly.to/"),
                    PageResolver::pattern(r#"["']([^"']*master\.m3u8[^"']*)["']"#)?,
                    Arc::clone(&segments),
                    Arc::clone(&remuxer),
                )),
            )
            .register(
                "sendvid.com",
                Arc::new(DirectHost::new(
                    agent.clone(),
                    referer("https://sendvid.com/"),
                    PageResolver::pattern(r#"<meta\s+property="og:video"\s+content="([^"]+)""#)?,
                )),
            );
        Ok(registry)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedAttempt {
    pub url: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Success { host: String, url: String },
    Failed { attempts: Vec<FailedAttempt> },
    /// No candidate URL at all.
    Skipped,
}

/// What a worker needs to turn candidate URLs into a file on disk.
pub trait EpisodeDownloader: Send + Sync {
    fn download(&self, candidate_urls: &[String], destination: &Path) -> DispatchOutcome;
}

pub struct HostDispatcher {
    registry: Arc<HostRegistry>,
    work_root: PathBuf,
    partial_root: PathBuf,
}

/// Stable per-URL key used to name partial downloads.
pub fn workspace_key(url: &str) -> String {
    blake3::hash(url.as_bytes()).to_hex().to_string()
}

impl HostDispatcher {
    pub fn new(
        registry: Arc<HostRegistry>,
        work_root: impl Into<PathBuf>,
        partial_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            registry,
            work_root: work_root.into(),
            partial_root: partial_root.into(),
        }
    }

    /// Tries each candidate in order and moves the first success to
    /// `destination`.
    pub fn dispatch(&self, candidate_urls: &[String], destination: &Path) -> DispatchOutcome {
        let candidates: Vec<&str> = candidate_urls
            .iter()
            .map(|url| url.trim())
            .filter(|url| !url.is_empty() && *url != NO_URL)
            .collect();
        if candidates.is_empty() {
            return DispatchOutcome::Skipped;
        }

        let mut attempts = Vec::new();
        for url in candidates {
            match self.attempt(url, destination) {
                Ok(host) => {
                    log::info!("{} downloaded from {host}", destination.display());
                    return DispatchOutcome::Success {
                        host,
                        url: url.to_string(),
                    };
                }
                Err(err) => {
                    log::warn!("{}: {url} failed: {err:#}", destination.display());
                    attempts.push(FailedAttempt {
                        url: url.to_string(),
                        reason: format!("{err:#}"),
                    });
                }
            }
        }
        DispatchOutcome::Failed { attempts }
    }

    fn attempt(&self, url: &str, destination: &Path) -> Result<String> {
        let (host, strategy) = self
            .registry
            .strategy_for(url)
            .ok_or_else(|| anyhow!("no strategy registered for {url}"))?;
        fs::create_dir_all(&self.work_root)
            .with_context(|| format!("creating {}", self.work_root.display()))?;
        fs::create_dir_all(&self.partial_root)
            .with_context(|| format!("creating {}", self.partial_root.display()))?;

        let key = workspace_key(url);
        let dir = tempfile::Builder::new()
            .prefix(&format!("job-{}-", &key[..12]))
            .tempdir_in(&self.work_root)
            .context("creating job workspace")?;
        let workspace = Workspace {
            dir: dir.path().to_path_buf(),
            partial_file: self.partial_root.join(format!("{key}.mp4")),
        };

        log::debug!("{url}: trying {host} ({})", strategy.kind());
        let produced = strategy.acquire(url, &workspace);
        let result = produced.and_then(|produced| move_into_place(&produced, destination));
        if let Err(err) = dir.close() {
            log::warn!("could not remove job workspace: {err}");
        }
        result?;
        remove_if_exists(&workspace.partial_file)?;
        Ok(host.to_string())
    }
}

impl EpisodeDownloader for HostDispatcher {
    fn download(&self, candidate_urls: &[String], destination: &Path) -> DispatchOutcome {
        self.dispatch(candidate_urls, destination)
    }
}

/// Renames `source` to `destination`, falling back to copy and delete when
/// they sit on different filesystems. Parent directories are created.
pub fn move_into_place(source: &Path, destination: &Path) -> Result<()> {
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    if fs::rename(source, destination).is_ok() {
        return Ok(());
    }
    let staging = destination.with_extension("part");
    fs::copy(source, &staging)
        .with_context(|| format!("copying {} to {}", source.display(), staging.display()))?;
    fs::rename(&staging, destination)
        .with_context(|| format!("replacing {}", destination.display()))?;
    fs::remove_file(source).with_context(|| format!("removing {}", source.display()))?;
    Ok(())
}
