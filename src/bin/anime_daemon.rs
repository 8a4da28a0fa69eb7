#![forbid(unsafe_code)]

//! Long-running acquisition daemon: scans tracked series on a timer and keeps
//! a pool of workers downloading whatever is missing.

use anyhow::{Context, Result};
use clap::Parser;
use plex_anime_tools::{
    catalogue::{ANIME_SAMA, AnimeSamaCatalogue, CatalogueSet},
    config::{RuntimeConfig, RuntimeOverrides, resolve_runtime_config},
    fetch::build_agent,
    hosts::{HostDispatcher, HostRegistry},
    logging::init_logger,
    manifest::LinkExtractor,
    planning::FilePlanningSource,
    queue::{JobQueue, WorkerPool},
    remux::Remuxer,
    scheduler::{ScanScheduler, today},
    segments::SegmentDownloader,
    store::EpisodeStore,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

#[derive(Debug, Parser)]
#[command(about = "Downloads new episodes of tracked series into a Plex library")]
struct Args {
    /// Data directory (config, database, logs, downloads). Overrides DATA_PATH.
    #[arg(long)]
    data_root: Option<PathBuf>,
    /// Plex library root. Overrides PLEX_PATH.
    #[arg(long)]
    plex_root: Option<PathBuf>,
    /// Number of download workers.
    #[arg(long)]
    threads: Option<usize>,
    /// Seconds between scans.
    #[arg(long)]
    interval: Option<u64>,
    /// Dotenv-style file read before the environment.
    #[arg(long)]
    env_file: Option<PathBuf>,
    /// Run one scan, wait for the downloads to finish and exit.
    #[arg(long)]
    once: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = resolve_runtime_config(RuntimeOverrides {
        data_root: args.data_root,
        plex_root: args.plex_root,
        threads: args.threads,
        scan_interval_secs: args.interval,
        env_path: args.env_file,
    })?;

    let paths = config.paths();
    paths.prepare()?;
    init_logger(config.log_level, &paths.log_file)?;
    log::info!(
        "data root {}, plex root {}, {} workers, scan every {}s",
        config.data_root.display(),
        config.plex_root.display(),
        config.threads,
        config.scan_interval.as_secs()
    );

    run(&config, args.once)
}

fn run(config: &RuntimeConfig, once: bool) -> Result<()> {
    let paths = config.paths();
    let agent = build_agent(config.http_timeout);
    let store = Arc::new(EpisodeStore::open(&paths.episode_db));
    let queue = Arc::new(JobQueue::new());

    let registry = Arc::new(HostRegistry::catalogue_defaults(
        &agent,
        Arc::new(SegmentDownloader::new(agent.clone())),
        Arc::new(Remuxer::new(&config.ffmpeg)),
    )?);
    let dispatcher = HostDispatcher::new(Arc::clone(&registry), &paths.download, &paths.partial);
    let pool = WorkerPool::start(
        config.threads,
        Arc::clone(&queue),
        Arc::new(dispatcher),
        Arc::clone(&store),
    )?;

    let catalogues = CatalogueSet::new().with(
        ANIME_SAMA,
        Arc::new(AnimeSamaCatalogue::new(
            agent,
            config.catalogue_url.clone(),
            &paths.manifests,
        )),
    );
    let mut scheduler = ScanScheduler::new(
        config,
        Arc::clone(&store),
        LinkExtractor::new(Arc::clone(&store), registry.hosts()),
        catalogues,
        Arc::clone(&queue),
    );
    if config.auto_planning {
        let planning = FilePlanningSource::new(&paths.planning_file);
        scheduler = scheduler.with_planning(Arc::new(planning));
    }

    if once {
        let report = scheduler.run_cycle(today());
        log::info!("waiting for {} queued downloads", report.jobs_queued);
        queue.wait_idle(None);
        pool.shutdown();
        log::info!("single run finished");
        return Ok(());
    }

    let handle = thread::Builder::new()
        .name("scheduler".to_string())
        .spawn(move || scheduler.run_forever())
        .context("spawning scheduler thread")?;
    if handle.join().is_err() {
        log::error!("scheduler thread panicked");
    }
    pool.shutdown();
    Ok(())
}
