#![forbid(unsafe_code)]

//! Runtime configuration and the on-disk data layout.
//!
//! Values are resolved in layers: built-in defaults, `config/config.toml`
//! inside the data root, a dotenv-style file, the process environment and
//! finally command-line overrides.

use anyhow::{Context, Result, anyhow};
use log::LevelFilter;
use serde::Deserialize;
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_THREADS: usize = 4;
pub const DEFAULT_SCAN_INTERVAL_SECS: u64 = 3600;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CATALOGUE_URL: &str = "https://anime-sama.fr";
pub const DEFAULT_FFMPEG: &str = "ffmpeg";

const LOGS_SUBDIR: &str = "logs";
const LOG_FILE: &str = "anime-daemon.log";
const DATABASE_SUBDIR: &str = "database";
const EPISODE_DB_FILE: &str = "plex_database.json";
const PLANNING_FILE: &str = "planning_scan_data.json";
const CONFIG_SUBDIR: &str = "config";
const SETTINGS_FILE: &str = "config.toml";
const TRACKING_FILE: &str = "anime.json";
const LIBRARY_FILE: &str = "plex_path.json";
const DOWNLOAD_SUBDIR: &str = "download";
const PARTIAL_SUBDIR: &str = "partial";
const MANIFEST_SUBDIR: &str = "episode";

/// Fully resolved settings handed to every component at construction time.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub data_root: PathBuf,
    pub plex_root: PathBuf,
    pub threads: usize,
    pub scan_interval: Duration,
    pub http_timeout: Duration,
    pub log_level: LevelFilter,
    pub ffmpeg: PathBuf,
    pub catalogue_url: String,
    pub auto_planning: bool,
}

impl RuntimeConfig {
    pub fn paths(&self) -> DataPaths {
        DataPaths::new(&self.data_root)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub data_root: Option<PathBuf>,
    pub plex_root: Option<PathBuf>,
    pub threads: Option<usize>,
    pub scan_interval_secs: Option<u64>,
    pub env_path: Option<PathBuf>,
}

/// Shape of `config/config.toml`. Every key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SettingsFile {
    pub settings: Settings,
    pub anime_sama: CatalogueSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub threads: Option<usize>,
    pub timer: Option<u64>,
    pub log_level: Option<String>,
    pub http_timeout: Option<u64>,
    pub ffmpeg: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CatalogueSettings {
    pub base_url: Option<String>,
    pub auto_planning: Option<bool>,
}

pub fn resolve_runtime_config(overrides: RuntimeOverrides) -> Result<RuntimeConfig> {
    let env_path = overrides
        .env_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(&env_path)?;
    build_runtime_config(&file_vars, env_var_string, overrides)
}

fn build_runtime_config(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> Result<RuntimeConfig> {
    let data_root = overrides
        .data_root
        .map(|path| path.to_string_lossy().into_owned())
        .or_else(|| lookup_value("DATA_PATH", file_vars, &env_lookup))
        .ok_or_else(|| anyhow!("DATA_PATH not set"))?;
    let plex_root = overrides
        .plex_root
        .map(|path| path.to_string_lossy().into_owned())
        .or_else(|| lookup_value("PLEX_PATH", file_vars, &env_lookup))
        .ok_or_else(|| anyhow!("PLEX_PATH not set"))?;
    let data_root = PathBuf::from(data_root);

    let settings = load_settings(&DataPaths::new(&data_root).settings_file)?;

    let threads = overrides
        .threads
        .or_else(|| parse_lookup("THREADS", file_vars, &env_lookup))
        .or(settings.settings.threads)
        .unwrap_or(DEFAULT_THREADS)
        .max(1);
    let scan_interval = overrides
        .scan_interval_secs
        .or_else(|| parse_lookup("TIMER", file_vars, &env_lookup))
        .or(settings.settings.timer)
        .unwrap_or(DEFAULT_SCAN_INTERVAL_SECS);
    let http_timeout = settings
        .settings
        .http_timeout
        .unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS)
        .max(1);
    let log_level = lookup_value("LOG_LEVEL", file_vars, &env_lookup)
        .or(settings.settings.log_level)
        .and_then(|value| value.trim().parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Info);
    let ffmpeg = lookup_value("FFMPEG_BIN", file_vars, &env_lookup)
        .or(settings.settings.ffmpeg)
        .unwrap_or_else(|| DEFAULT_FFMPEG.to_string());
    let catalogue_url = settings
        .anime_sama
        .base_url
        .map(|value| value.trim().trim_end_matches('/').to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_CATALOGUE_URL.to_string());

    Ok(RuntimeConfig {
        data_root,
        plex_root: PathBuf::from(plex_root),
        threads,
        scan_interval: Duration::from_secs(scan_interval),
        http_timeout: Duration::from_secs(http_timeout),
        log_level,
        ffmpeg: PathBuf::from(ffmpeg),
        catalogue_url,
        auto_planning: settings.anime_sama.auto_planning.unwrap_or(true),
    })
}

/// Reads `config.toml`; a missing file yields the defaults.
pub fn load_settings(path: &Path) -> Result<SettingsFile> {
    if !path.exists() {
        return Ok(SettingsFile::default());
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("Parsing {}", path.display()))
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| file_vars.get(key).cloned())
}

fn parse_lookup<T: std::str::FromStr>(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<T> {
    lookup_value(key, file_vars, env_lookup).and_then(|value| value.trim().parse::<T>().ok())
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}

/// Every location under the data root the daemon reads or writes.
#[derive(Debug, Clone)]
pub struct DataPaths {
    pub root: PathBuf,
    pub logs: PathBuf,
    pub log_file: PathBuf,
    pub database: PathBuf,
    pub episode_db: PathBuf,
    pub planning_file: PathBuf,
    pub config_dir: PathBuf,
    pub settings_file: PathBuf,
    pub tracking_file: PathBuf,
    pub library_file: PathBuf,
    pub download: PathBuf,
    pub partial: PathBuf,
    pub manifests: PathBuf,
}

impl DataPaths {
    pub fn new(root: &Path) -> Self {
        let root = root.to_path_buf();
        let logs = root.join(LOGS_SUBDIR);
        let database = root.join(DATABASE_SUBDIR);
        let config_dir = root.join(CONFIG_SUBDIR);
        let download = root.join(DOWNLOAD_SUBDIR);

        Self {
            log_file: logs.join(LOG_FILE),
            episode_db: database.join(EPISODE_DB_FILE),
            planning_file: database.join(PLANNING_FILE),
            settings_file: config_dir.join(SETTINGS_FILE),
            tracking_file: config_dir.join(TRACKING_FILE),
            library_file: config_dir.join(LIBRARY_FILE),
            partial: download.join(PARTIAL_SUBDIR),
            manifests: download.join(MANIFEST_SUBDIR),
            root,
            logs,
            database,
            config_dir,
            download,
        }
    }

    /// Creates every directory we might write to so later steps can assume
    /// the tree exists.
    pub fn prepare(&self) -> Result<()> {
        for dir in [
            &self.logs,
            &self.database,
            &self.config_dir,
            &self.download,
            &self.partial,
            &self.manifests,
        ] {
            fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        Ok(())
    }
}
