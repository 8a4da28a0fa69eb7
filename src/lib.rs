#![forbid(unsafe_code)]

//! Episode acquisition engine: scans tracked series on the remote catalogue,
//! records every known episode in a JSON episode database and downloads the
//! missing ones into a Plex-style library.

pub mod catalogue;
pub mod config;
pub mod fetch;
pub mod hls;
pub mod hosts;
pub mod library;
pub mod logging;
pub mod manifest;
pub mod planning;
pub mod queue;
pub mod remux;
pub mod scheduler;
pub mod segments;
pub mod store;
pub mod tracking;

#[cfg(test)]
pub(crate) mod test_support;
