#![forbid(unsafe_code)]

//! Shared download queue and the fixed pool of workers draining it.

use crate::hosts::{DispatchOutcome, EpisodeDownloader};
use crate::store::{EpisodeStatus, EpisodeStore, SeasonKey};
use anyhow::{Context, Result};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub const POP_TIMEOUT: Duration = Duration::from_secs(1);

/// Where a finished episode goes and which store record it updates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobTarget {
    pub destination: PathBuf,
    pub season: SeasonKey,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadJob {
    pub episode_name: String,
    pub target: JobTarget,
    pub candidate_urls: Vec<String>,
}

impl DownloadJob {
    fn same_identity(&self, other: &DownloadJob) -> bool {
        self.episode_name == other.episode_name
            && self.target.destination == other.target.destination
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Queued,
    /// A pending job with the same identity had its URLs replaced.
    Replaced,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<DownloadJob>,
    active: usize,
}

/// FIFO of pending jobs. Popped jobs count as active until
/// [`JobQueue::complete`] is called.
#[derive(Default)]
pub struct JobQueue {
    state: Mutex<QueueState>,
    available: Condvar,
    idle: Condvar,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a job, or refreshes the URLs of a pending job with the same
    /// episode name and destination.
    pub fn enqueue(&self, job: DownloadJob) -> Enqueued {
        let mut state = self.state.lock();
        if let Some(existing) = state
            .pending
            .iter_mut()
            .find(|pending| pending.same_identity(&job))
        {
            existing.candidate_urls = job.candidate_urls;
            return Enqueued::Replaced;
        }
        state.pending.push_back(job);
        drop(state);
        self.available.notify_one();
        Enqueued::Queued
    }

    pub fn pop_timeout(&self, timeout: Duration) -> Option<DownloadJob> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(job) = state.pending.pop_front() {
                state.active += 1;
                return Some(job);
            }
            if self.available.wait_until(&mut state, deadline).timed_out() {
                let job = state.pending.pop_front()?;
                state.active += 1;
                return Some(job);
            }
        }
    }

    /// Marks one popped job as finished.
    pub fn complete(&self) {
        let mut state = self.state.lock();
        state.active = state.active.saturating_sub(1);
        let idle = state.active == 0 && state.pending.is_empty();
        drop(state);
        if idle {
            self.idle.notify_all();
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn active(&self) -> usize {
        self.state.lock().active
    }

    /// Blocks until nothing is pending or running, or `timeout` passes.
    /// Returns whether the queue went idle.
    pub fn wait_idle(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut state = self.state.lock();
        while state.active > 0 || !state.pending.is_empty() {
            match deadline {
                Some(deadline) => {
                    if self.idle.wait_until(&mut state, deadline).timed_out() {
                        return state.active == 0 && state.pending.is_empty();
                    }
                }
                None => self.idle.wait(&mut state),
            }
        }
        true
    }
}

/// `threads` long-lived workers popping from one queue.
pub struct WorkerPool {
    shutdown: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(
        threads: usize,
        queue: Arc<JobQueue>,
        downloader: Arc<dyn EpisodeDownloader>,
        store: Arc<EpisodeStore>,
    ) -> Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(threads);
        for index in 0..threads.max(1) {
            let queue = Arc::clone(&queue);
            let downloader = Arc::clone(&downloader);
            let store = Arc::clone(&store);
            let shutdown = Arc::clone(&shutdown);
            let handle = thread::Builder::new()
                .name(format!("worker-{index}"))
                .spawn(move || worker_loop(&queue, downloader.as_ref(), &store, &shutdown))
                .with_context(|| format!("spawning worker {index}"))?;
            handles.push(handle);
        }
        log::info!("started {} download workers", handles.len());
        Ok(Self { shutdown, handles })
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Stops workers after their current job and joins them.
    pub fn shutdown(self) {
        self.shutdown.store(true, Ordering::Release);
        for handle in self.handles {
            if handle.join().is_err() {
                log::error!("worker thread terminated abnormally");
            }
        }
    }
}

fn worker_loop(
    queue: &JobQueue,
    downloader: &dyn EpisodeDownloader,
    store: &EpisodeStore,
    shutdown: &AtomicBool,
) {
    while !shutdown.load(Ordering::Acquire) {
        let Some(job) = queue.pop_timeout(POP_TIMEOUT) else {
            continue;
        };
        let result = panic::catch_unwind(AssertUnwindSafe(|| run_job(&job, downloader, store)));
        if let Err(payload) = result {
            log::error!(
                "job '{}' ({}) panicked: {}",
                job.episode_name,
                job.target.season,
                panic_message(payload.as_ref())
            );
        }
        queue.complete();
    }
}

fn run_job(job: &DownloadJob, downloader: &dyn EpisodeDownloader, store: &EpisodeStore) {
    log::info!("downloading '{}' ({})", job.episode_name, job.target.season);
    match downloader.download(&job.candidate_urls, &job.target.destination) {
        DispatchOutcome::Success { host, .. } => {
            match store.upsert(
                &job.target.season,
                &job.episode_name,
                EpisodeStatus::Downloaded,
                job.candidate_urls.clone(),
            ) {
                Ok(()) => log::info!("'{}' downloaded from {host}", job.episode_name),
                Err(err) => log::error!(
                    "'{}' downloaded but could not be recorded: {err:#}",
                    job.episode_name
                ),
            }
        }
        DispatchOutcome::Failed { attempts } => log::warn!(
            "'{}' failed on all {} hosts, will retry next scan",
            job.episode_name,
            attempts.len()
        ),
        DispatchOutcome::Skipped => {
            log::info!("'{}' has no candidate URL", job.episode_name)
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
