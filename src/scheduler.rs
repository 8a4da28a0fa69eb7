#![forbid(unsafe_code)]

//! Periodic scan loop: manifests in, download jobs out.

use crate::catalogue::CatalogueSet;
use crate::config::RuntimeConfig;
use crate::library::{LibraryMap, destination_path, season_folder};
use crate::manifest::LinkExtractor;
use crate::planning::{PlanningDecision, PlanningSource, decide};
use crate::queue::{DownloadJob, Enqueued, JobQueue, JobTarget};
use crate::store::{EpisodeStore, SeasonKey};
use crate::tracking::{SeasonSpec, TrackedSeries, TrackingFile, day_names};
use anyhow::{Context, Result};
use chrono::{Datelike, Local, Weekday};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

pub const REPORT_EVERY: Duration = Duration::from_secs(900);
const WAIT_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub scanned: usize,
    pub skipped: usize,
    pub jobs_queued: usize,
    pub jobs_replaced: usize,
}

/// Where one tracked season lives, both in the store and on disk.
struct SeasonLocation {
    key: SeasonKey,
    spec: SeasonSpec,
    folder: String,
}

pub struct ScanScheduler {
    tracking: TrackingFile,
    library_file: PathBuf,
    plex_root: PathBuf,
    store: Arc<EpisodeStore>,
    extractor: LinkExtractor,
    catalogues: CatalogueSet,
    queue: Arc<JobQueue>,
    planning: Option<Arc<dyn PlanningSource>>,
    interval: Duration,
    report_every: Duration,
    shutdown: Arc<AtomicBool>,
}

pub fn today() -> Weekday {
    Local::now().weekday()
}

/// `HH:MM:SS`, hours unbounded.
pub fn format_remaining(remaining: Duration) -> String {
    let seconds = remaining.as_secs();
    format!(
        "{:02}:{:02}:{:02}",
        seconds / 3600,
        (seconds % 3600) / 60,
        seconds % 60
    )
}

impl ScanScheduler {
    pub fn new(
        config: &RuntimeConfig,
        store: Arc<EpisodeStore>,
        extractor: LinkExtractor,
        catalogues: CatalogueSet,
        queue: Arc<JobQueue>,
    ) -> Self {
        let paths = config.paths();
        Self {
            tracking: TrackingFile::open(paths.tracking_file),
            library_file: paths.library_file,
            plex_root: config.plex_root.clone(),
            store,
            extractor,
            catalogues,
            queue,
            planning: None,
            interval: config.scan_interval,
            report_every: REPORT_EVERY,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_planning(mut self, source: Arc<dyn PlanningSource>) -> Self {
        self.planning = Some(source);
        self
    }

    /// Flag that ends [`ScanScheduler::run_forever`] at the next check.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    fn locate(&self, series: &TrackedSeries, library: &LibraryMap) -> Result<SeasonLocation> {
        let spec = series.season_spec()?;
        let folder = library
            .folder_for(&series.langage)
            .with_context(|| format!("no library path for language '{}'", series.langage))?
            .to_string();
        Ok(SeasonLocation {
            key: SeasonKey::new(&folder, series.series_folder(), season_folder(spec.base)),
            spec,
            folder,
        })
    }

    /// One pass over the series due on `day`.
    pub fn scan_once(&self, day: Weekday) -> Result<ScanReport> {
        let document = self.tracking.load()?;
        let library = LibraryMap::load(&self.library_file)?;
        let due = document.due_on(day);
        log::info!("scan started: {} entries due on {}", due.len(), day_names(day)[0]);

        let mut report = ScanReport::default();
        for series in &due {
            match self.scan_series(series, &library) {
                Ok((queued, replaced)) => {
                    report.scanned += 1;
                    report.jobs_queued += queued;
                    report.jobs_replaced += replaced;
                }
                Err(err) => {
                    report.skipped += 1;
                    log::warn!("skipping '{}' season {}: {err:#}", series.name, series.season);
                }
            }
        }
        log::info!(
            "scan finished: {} scanned, {} skipped, {} jobs queued, {} refreshed",
            report.scanned,
            report.skipped,
            report.jobs_queued,
            report.jobs_replaced
        );
        Ok(report)
    }

    fn scan_series(&self, series: &TrackedSeries, library: &LibraryMap) -> Result<(usize, usize)> {
        let location = self.locate(series, library)?;
        let catalogue = self
            .catalogues
            .get(&series.streaming)
            .with_context(|| format!("unsupported streaming site '{}'", series.streaming))?;
        let manifests = catalogue.manifests(series)?;
        self.extractor
            .extract(&location.key, location.spec.base, &manifests)?;

        let mut queued = 0;
        let mut replaced = 0;
        for episode in self.store.not_downloaded(&location.key) {
            let destination = destination_path(
                &self.plex_root,
                &location.folder,
                series.series_folder(),
                location.spec.base,
                &episode.name,
            );
            let job = DownloadJob {
                episode_name: episode.name,
                target: JobTarget {
                    destination,
                    season: location.key.clone(),
                },
                candidate_urls: episode.record.source_urls,
            };
            match self.queue.enqueue(job) {
                Enqueued::Queued => queued += 1,
                Enqueued::Replaced => replaced += 1,
            }
        }
        Ok((queued, replaced))
    }

    /// Retires day-scheduled series that left the remote planning and are
    /// fully downloaded. Returns how many entries were removed.
    pub fn reconcile(&self) -> Result<usize> {
        let Some(planning) = &self.planning else {
            return Ok(0);
        };
        let entries = planning.load()?;
        if entries.is_empty() {
            log::debug!("no planning data, reconciliation skipped");
            return Ok(0);
        }
        let library = LibraryMap::load(&self.library_file)?;
        let document = self.tracking.load()?;

        let mut retired = 0;
        for (day, series) in document.day_entries() {
            let entry = entries.iter().find(|entry| entry.describes(&series));
            let complete = self
                .locate(&series, &library)
                .ok()
                .and_then(|location| self.store.season_complete(&location.key));
            match decide(entry, complete) {
                PlanningDecision::Retire => {
                    if self.tracking.remove(&day, &series)? {
                        retired += 1;
                        log::info!(
                            "'{}' season {} left the planning and is complete, removed from {day}",
                            series.name,
                            series.season
                        );
                    }
                }
                PlanningDecision::Moved { expected, actual } => log::info!(
                    "'{}' season {} airs on {actual} instead of {expected}",
                    series.name,
                    series.season
                ),
                PlanningDecision::HoldIncomplete => log::info!(
                    "'{}' season {} left the planning but is not fully downloaded, keeping it",
                    series.name,
                    series.season
                ),
                PlanningDecision::Scheduled | PlanningDecision::Unknown => {}
            }
        }
        Ok(retired)
    }

    /// Scan then reconcile. Errors are logged, never propagated.
    /// Reconciles against the planning, then scans. The first cycle doubles
    /// as the startup reconciliation.
    pub fn run_cycle(&self, day: Weekday) -> ScanReport {
        if let Err(err) = self.reconcile() {
            log::error!("planning reconciliation failed: {err:#}");
        }
        self.scan_once(day).unwrap_or_else(|err| {
            log::error!("scan failed: {err:#}");
            ScanReport::default()
        })
    }

    /// Sleeps for the scan interval, logging the remaining time every
    /// `report_every`. Returns early on shutdown.
    pub fn wait(&self) {
        let deadline = Instant::now() + self.interval;
        log::info!("next scan in {}", format_remaining(self.interval));
        let mut next_report = Instant::now() + self.report_every;
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            if now >= next_report {
                log::info!("next scan in {}", format_remaining(deadline - now));
                next_report += self.report_every;
            }
            thread::sleep((deadline - now).min(WAIT_TICK));
        }
        log::info!("waiting over, starting scan");
    }

    pub fn run_forever(&self) {
        while !self.shutdown.load(Ordering::Acquire) {
            self.run_cycle(today());
            self.wait();
        }
        log::info!("scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalogue::{ANIME_SAMA, AnimeSamaCatalogue};
    use crate::config::DataPaths;
    use crate::fetch::build_agent;
    use crate::hosts::{DirectHost, HostDispatcher, HostRegistry, PageResolver};
    use crate::planning::{FilePlanningSource, PlanningEntry};
    use crate::queue::WorkerPool;
    use crate::store::{EpisodeStatus, NO_URL};
    use crate::test_support::TestServer;
    use log::LevelFilter;
    use std::fs;
    use std::sync::atomic::AtomicUsize;
    use tempfile::{TempDir, tempdir};
    use wiremock::matchers::{path, path_regex};
    use wiremock::{Mock, Request, ResponseTemplate};

    const MANIFEST_PATH: &str = "/catalogue/demo/saison1/vostfr/episodes.js";

    struct Harness {
        _dir: TempDir,
        config: RuntimeConfig,
        paths: DataPaths,
        server: TestServer,
        registry: Arc<HostRegistry>,
        store: Arc<EpisodeStore>,
        queue: Arc<JobQueue>,
    }

    impl Harness {
        fn new(tracking: &str) -> Self {
            let server = TestServer::new();
            let urls: Vec<String> = (1..=3)
                .map(|index| format!("'{}'", server.url(&format!("/media/{index}.mp4"))))
                .collect();
            let manifest = format!("var eps1 = [{}];\n", urls.join(", "));
            server.mount(
                Mock::given(path(MANIFEST_PATH))
                    .respond_with(ResponseTemplate::new(200).set_body_string(manifest)),
            );
            server.mount(
                Mock::given(path_regex(r"^/media/")).respond_with(|request: &Request| {
                    let file = request.url.path().trim_start_matches("/media/");
                    ResponseTemplate::new(200).set_body_string(format!("video {file}"))
                }),
            );

            let dir = tempdir().unwrap();
            let config = RuntimeConfig {
                data_root: dir.path().join("data"),
                plex_root: dir.path().join("plex"),
                threads: 2,
                scan_interval: Duration::from_millis(50),
                http_timeout: Duration::from_secs(5),
                log_level: LevelFilter::Info,
                ffmpeg: PathBuf::from("ffmpeg"),
                catalogue_url: server.url(""),
                auto_planning: true,
            };
            let paths = config.paths();
            paths.prepare().unwrap();
            fs::write(&paths.tracking_file, tracking).unwrap();
            fs::write(
                &paths.library_file,
                r#"[{"path": "anime", "language": ["vostfr"]}]"#,
            )
            .unwrap();

            let agent = build_agent(config.http_timeout);
            let mut registry = HostRegistry::new();
            registry
                .register(
                    server.host(),
                    Arc::new(DirectHost::new(agent.clone(), Vec::new(), PageResolver::Direct)),
                )
                .register(
                    "sendvid.com",
                    Arc::new(DirectHost::new(agent, Vec::new(), PageResolver::Direct)),
                );

            Self {
                store: Arc::new(EpisodeStore::open(&paths.episode_db)),
                _dir: dir,
                config,
                paths,
                server,
                registry: Arc::new(registry),
                queue: Arc::new(JobQueue::new()),
            }
        }

        fn scheduler(&self) -> ScanScheduler {
            let agent = build_agent(self.config.http_timeout);
            let catalogues = CatalogueSet::new().with(
                ANIME_SAMA,
                Arc::new(AnimeSamaCatalogue::new(
                    agent,
                    self.config.catalogue_url.clone(),
                    self.paths.manifests.clone(),
                )),
            );
            ScanScheduler::new(
                &self.config,
                Arc::clone(&self.store),
                LinkExtractor::new(Arc::clone(&self.store), self.registry.hosts()),
                catalogues,
                Arc::clone(&self.queue),
            )
            .with_planning(Arc::new(FilePlanningSource::new(&self.paths.planning_file)))
        }

        fn season(&self) -> SeasonKey {
            SeasonKey::new("anime", "demo", "season 1")
        }
    }

    fn tracked(day: &str) -> String {
        format!(
            r#"{{
                "auto_download": {{
                    "{day}": [{{
                        "name": "demo",
                        "season": "1",
                        "langage": "vostfr",
                        "streaming": "anime-sama",
                        "file_name": "none"
                    }}]
                }},
                "single_download": []
            }}"#
        )
    }

    #[test]
    fn tracked_series_is_scanned_queued_and_downloaded() -> Result<()> {
        let harness = Harness::new(&tracked("no_day"));
        let scheduler = harness.scheduler();

        let report = scheduler.scan_once(Weekday::Wed)?;
        assert_eq!(report.jobs_queued, 3);
        let episodes = harness.store.get(&harness.season());
        assert_eq!(episodes.len(), 3);
        assert!(
            episodes
                .iter()
                .all(|entry| entry.record.status == EpisodeStatus::NotDownloaded)
        );
        assert_eq!(
            episodes[0].record.source_urls,
            vec![harness.server.url("/media/1.mp4"), NO_URL.to_string()]
        );
        assert!(harness.paths.manifests.join("demo-s1-part1.js").exists());

        // a second scan before any worker ran refreshes instead of duplicating
        let report = scheduler.scan_once(Weekday::Wed)?;
        assert_eq!(report.jobs_queued, 0);
        assert_eq!(report.jobs_replaced, 3);
        assert_eq!(harness.queue.len(), 3);

        let dispatcher = HostDispatcher::new(
            Arc::clone(&harness.registry),
            &harness.paths.download,
            &harness.paths.partial,
        );
        let pool = WorkerPool::start(
            harness.config.threads,
            Arc::clone(&harness.queue),
            Arc::new(dispatcher),
            Arc::clone(&harness.store),
        )?;
        assert!(harness.queue.wait_idle(Some(Duration::from_secs(20))));
        pool.shutdown();

        for index in 1..=3 {
            let file = harness
                .config
                .plex_root
                .join(format!("anime/demo/season 1/demo s1 0{index}.mp4"));
            assert_eq!(fs::read_to_string(&file)?, format!("video {index}.mp4"));
        }
        let episodes = harness.store.get(&harness.season());
        assert!(
            episodes
                .iter()
                .all(|entry| entry.record.status == EpisodeStatus::Downloaded)
        );

        let report = scheduler.scan_once(Weekday::Wed)?;
        assert_eq!(report.jobs_queued, 0);
        assert!(harness.queue.is_empty());
        Ok(())
    }

    #[test]
    fn series_not_due_today_is_ignored() -> Result<()> {
        let harness = Harness::new(&tracked("lundi"));
        let scheduler = harness.scheduler();
        assert_eq!(scheduler.scan_once(Weekday::Tue)?, ScanReport::default());
        assert_eq!(scheduler.scan_once(Weekday::Mon)?.jobs_queued, 3);
        Ok(())
    }

    #[test]
    fn unreachable_manifest_skips_series() -> Result<()> {
        let harness = Harness::new(
            r#"{"auto_download": {
                "no_day": [{"name": "missing", "season": "1", "langage": "vostfr"}]
            }}"#,
        );
        let report = harness.scheduler().scan_once(Weekday::Mon)?;
        assert_eq!(report.skipped, 1);
        assert_eq!(report.jobs_queued, 0);
        assert!(harness.store.libraries().is_empty());
        Ok(())
    }

    fn write_planning(harness: &Harness, found: bool) {
        fs::write(
            &harness.paths.planning_file,
            format!(
                r#"[{{"series": "demo", "season": "1", "language": "vostfr",
                     "found_in_remote_schedule": {found}, "expected_day": "lundi"}}]"#
            ),
        )
        .unwrap();
    }

    #[test]
    fn delisted_complete_series_is_retired() -> Result<()> {
        let harness = Harness::new(&tracked("lundi"));
        let scheduler = harness.scheduler();
        write_planning(&harness, false);

        // nothing downloaded yet: kept
        scheduler.scan_once(Weekday::Mon)?;
        assert_eq!(scheduler.reconcile()?, 0);

        for episode in harness.store.get(&harness.season()) {
            harness.store.upsert(
                &harness.season(),
                &episode.name,
                EpisodeStatus::Downloaded,
                episode.record.source_urls,
            )?;
        }
        assert_eq!(scheduler.reconcile()?, 1);
        assert_eq!(scheduler.reconcile()?, 0);
        let document = TrackingFile::open(&harness.paths.tracking_file).load()?;
        assert!(document.day_entries().is_empty());
        Ok(())
    }

    #[test]
    fn scheduled_series_is_kept() -> Result<()> {
        let harness = Harness::new(&tracked("lundi"));
        let scheduler = harness.scheduler();
        write_planning(&harness, true);
        harness.store.upsert(
            &harness.season(),
            "demo s1 01.mp4",
            EpisodeStatus::Downloaded,
            vec!["u".into()],
        )?;
        assert_eq!(scheduler.reconcile()?, 0);
        assert_eq!(
            TrackingFile::open(&harness.paths.tracking_file)
                .load()?
                .day_entries()
                .len(),
            1
        );
        Ok(())
    }

    #[test]
    fn wait_honours_interval_and_shutdown() {
        let harness = Harness::new(&tracked("no_day"));
        let scheduler = harness.scheduler();
        let started = Instant::now();
        scheduler.wait();
        assert!(started.elapsed() >= Duration::from_millis(50));

        scheduler.shutdown_handle().store(true, Ordering::Release);
        scheduler.run_forever();
    }

    /// Counts planning reads and stops the scheduler after the first one.
    struct StopAfterFirstLoad {
        loads: AtomicUsize,
        shutdown: Arc<AtomicBool>,
    }

    impl PlanningSource for StopAfterFirstLoad {
        fn load(&self) -> Result<Vec<PlanningEntry>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            self.shutdown.store(true, Ordering::Release);
            Ok(Vec::new())
        }
    }

    #[test]
    fn startup_reconciles_once() {
        let harness = Harness::new(&tracked("no_day"));
        let scheduler = harness.scheduler();
        let planning = Arc::new(StopAfterFirstLoad {
            loads: AtomicUsize::new(0),
            shutdown: scheduler.shutdown_handle(),
        });
        let scheduler = scheduler.with_planning(Arc::clone(&planning) as Arc<dyn PlanningSource>);

        scheduler.run_forever();
        assert_eq!(planning.loads.load(Ordering::SeqCst), 1);
        assert_eq!(harness.queue.len(), 3);
    }

    #[test]
    fn remaining_time_format() {
        assert_eq!(format_remaining(Duration::from_secs(0)), "00:00:00");
        assert_eq!(format_remaining(Duration::from_secs(3599)), "00:59:59");
        assert_eq!(format_remaining(Duration::from_secs(90_061)), "25:01:01");
    }
}
