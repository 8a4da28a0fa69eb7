#![forbid(unsafe_code)]

//! Blocking HTTP helpers shared by every host strategy.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::{Duration, Instant};
use thiserror::Error;
use ureq::{Agent, AgentBuilder, Request, Response};

pub const USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0";
const MAX_REDIRECTS: u32 = 5;

const SMALL_CHUNK: usize = 64 * 1024;
const MEDIUM_CHUNK: usize = 256 * 1024;
const LARGE_CHUNK: usize = 1024 * 1024;
const SLOW_RATE: f64 = 1024.0 * 1024.0;
const FAST_RATE: f64 = 5.0 * 1024.0 * 1024.0;
const ADAPT_EVERY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP status {0}")]
    Status(u16),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("body truncated: expected {expected} bytes, received {received}")]
    Truncated { expected: u64, received: u64 },
    #[error("server resumed at byte {served}, expected {requested}")]
    UnexpectedRange { requested: u64, served: u64 },
}

impl From<ureq::Error> for FetchError {
    fn from(err: ureq::Error) -> Self {
        match err {
            ureq::Error::Status(code, _) => Self::Status(code),
            ureq::Error::Transport(transport) => Self::Transport(transport.to_string()),
        }
    }
}

/// Outcome of a resumable transfer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchReport {
    pub bytes_written: u64,
    pub resumed_from: u64,
    pub total_size: Option<u64>,
    /// The partial file was rejected by the server and the transfer started
    /// over.
    pub restarted: bool,
}

#[derive(Debug, Clone)]
pub struct TextResponse {
    /// URL after redirects.
    pub url: String,
    pub body: String,
}

pub fn build_agent(timeout: Duration) -> Agent {
    AgentBuilder::new()
        .timeout(timeout)
        .redirects(MAX_REDIRECTS)
        .user_agent(USER_AGENT)
        .build()
}

fn request(agent: &Agent, url: &str, headers: &[(String, String)]) -> Request {
    headers
        .iter()
        .fold(agent.get(url), |request, (name, value)| request.set(name, value))
}

pub fn fetch_text(
    agent: &Agent,
    url: &str,
    headers: &[(String, String)],
) -> Result<TextResponse, FetchError> {
    let response = request(agent, url, headers).call()?;
    let final_url = response.get_url().to_string();
    let body = response.into_string()?;
    Ok(TextResponse {
        url: final_url,
        body,
    })
}

/// Downloads `url` into `dest`, replacing whatever is there.
pub fn fetch_to_file(
    agent: &Agent,
    url: &str,
    headers: &[(String, String)],
    dest: &Path,
) -> Result<u64, FetchError> {
    let response = request(agent, url, headers).call()?;
    let expected = content_length(&response);
    let mut file = File::create(dest)?;
    let received = stream_body(response.into_reader(), &mut file)?;
    check_length(expected, received)?;
    Ok(received)
}

enum Attempt {
    Done(FetchReport),
    RangeRejected,
}

/// Resumable single-file download.
///
/// An existing `dest` is treated as a partial download and continued with a
/// `Range` request. A `200` answer restarts from byte 0, `206` appends and a
/// `416` discards the partial file and restarts unconditionally.
pub fn download_resumable(
    agent: &Agent,
    url: &str,
    headers: &[(String, String)],
    dest: &Path,
) -> Result<FetchReport, FetchError> {
    match attempt(agent, url, headers, dest)? {
        Attempt::Done(report) => Ok(report),
        Attempt::RangeRejected => {
            log::warn!(
                "range rejected for {url}, discarding partial file {}",
                dest.display()
            );
            remove_if_exists(dest)?;
            match attempt(agent, url, headers, dest)? {
                Attempt::Done(report) => Ok(FetchReport {
                    restarted: true,
                    ..report
                }),
                Attempt::RangeRejected => Err(FetchError::Status(416)),
            }
        }
    }
}

fn attempt(
    agent: &Agent,
    url: &str,
    headers: &[(String, String)],
    dest: &Path,
) -> Result<Attempt, FetchError> {
    let existing = match fs::metadata(dest) {
        Ok(metadata) => metadata.len(),
        Err(err) if err.kind() == io::ErrorKind::NotFound => 0,
        Err(err) => return Err(err.into()),
    };

    let mut request = request(agent, url, headers);
    if existing > 0 {
        request = request.set("Range", &format!("bytes={existing}-"));
    }
    let response = match request.call() {
        Ok(response) => response,
        Err(ureq::Error::Status(416, _)) if existing > 0 => return Ok(Attempt::RangeRejected),
        Err(err) => return Err(err.into()),
    };

    match response.status() {
        200 => {
            if existing > 0 {
                log::info!("server ignored range for {url}, restarting from 0");
            }
            let expected = content_length(&response);
            let mut file = File::create(dest)?;
            let written = stream_body(response.into_reader(), &mut file)?;
            check_length(expected, written)?;
            Ok(Attempt::Done(FetchReport {
                bytes_written: written,
                resumed_from: 0,
                total_size: expected.or(Some(written)),
                restarted: false,
            }))
        }
        206 => {
            let range = response.header("Content-Range").and_then(parse_content_range);
            let total = range.and_then(|range| range.total);
            if total.is_some_and(|total| total <= existing) {
                log::info!("{} already complete ({existing} bytes)", dest.display());
                return Ok(Attempt::Done(FetchReport {
                    bytes_written: 0,
                    resumed_from: existing,
                    total_size: total,
                    restarted: false,
                }));
            }
            let start = range.map(|range| range.start).unwrap_or(existing);
            if start > existing {
                return Err(FetchError::UnexpectedRange {
                    requested: existing,
                    served: start,
                });
            }
            let expected = content_length(&response);
            let mut file = OpenOptions::new().write(true).open(dest)?;
            file.set_len(start)?;
            file.seek(SeekFrom::Start(start))?;
            let written = stream_body(response.into_reader(), &mut file)?;
            check_length(expected, written)?;
            Ok(Attempt::Done(FetchReport {
                bytes_written: written,
                resumed_from: start,
                total_size: total.or(Some(start + written)),
                restarted: false,
            }))
        }
        other => Err(FetchError::Status(other)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    pub total: Option<u64>,
}

/// Parses `bytes START-END/TOTAL` (`TOTAL` may be `*`).
pub fn parse_content_range(raw: &str) -> Option<ContentRange> {
    let spec = raw.trim().strip_prefix("bytes")?.trim();
    let (range, total) = spec.split_once('/')?;
    let (start, end) = range.split_once('-')?;
    Some(ContentRange {
        start: start.trim().parse().ok()?,
        end: end.trim().parse().ok()?,
        total: total.trim().parse().ok(),
    })
}

fn content_length(response: &Response) -> Option<u64> {
    response
        .header("Content-Length")
        .and_then(|value| value.trim().parse().ok())
}

fn check_length(expected: Option<u64>, received: u64) -> Result<(), FetchError> {
    match expected {
        Some(expected) if expected != received => {
            Err(FetchError::Truncated { expected, received })
        }
        _ => Ok(()),
    }
}

/// Read buffer size for an observed throughput in bytes per second.
pub fn chunk_size_for(bytes_per_sec: f64) -> usize {
    if bytes_per_sec < SLOW_RATE {
        SMALL_CHUNK
    } else if bytes_per_sec > FAST_RATE {
        LARGE_CHUNK
    } else {
        MEDIUM_CHUNK
    }
}

fn stream_body(mut reader: impl Read, file: &mut File) -> io::Result<u64> {
    let mut buffer = vec![0u8; LARGE_CHUNK];
    let mut chunk = MEDIUM_CHUNK;
    let mut total = 0u64;
    let mut window_start = Instant::now();
    let mut window_bytes = 0u64;

    loop {
        let read = match reader.read(&mut buffer[..chunk]) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        file.write_all(&buffer[..read])?;
        total += read as u64;
        window_bytes += read as u64;

        let elapsed = window_start.elapsed();
        if elapsed >= ADAPT_EVERY {
            chunk = chunk_size_for(window_bytes as f64 / elapsed.as_secs_f64());
            window_start = Instant::now();
            window_bytes = 0;
        }
    }
    file.flush()?;
    Ok(total)
}

pub fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}
