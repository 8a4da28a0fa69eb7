#![forbid(unsafe_code)]

//! Logger initialization for console and file output.

use anyhow::{Context, Result};
use log::LevelFilter;
use simplelog::{
    ColorChoice, CombinedLogger, Config, ConfigBuilder, TermLogger, TerminalMode, ThreadLogMode,
    WriteLogger,
};
use std::fs::{self, OpenOptions};
use std::path::Path;

/// Logs to the terminal and appends to `log_file`, which the dashboard tails.
pub fn init_logger(level: LevelFilter, log_file: &Path) -> Result<()> {
    if let Some(parent) = log_file.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .with_context(|| format!("opening log file {}", log_file.display()))?;

    let config = logger_config();
    CombinedLogger::init(vec![
        TermLogger::new(level, config.clone(), TerminalMode::Mixed, ColorChoice::Auto),
        WriteLogger::new(level, config, file),
    ])
    .context("initializing logger")?;

    Ok(())
}

fn logger_config() -> Config {
    ConfigBuilder::new()
        .set_thread_level(LevelFilter::Error)
        .set_thread_mode(ThreadLogMode::Names)
        .set_target_level(LevelFilter::Error)
        .add_filter_ignore_str("rustls")
        .add_filter_ignore_str("ureq")
        .build()
}
