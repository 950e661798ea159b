use std::{path::PathBuf, time::Duration};

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:5000";
const DEFAULT_YT_DLP_BIN: &str = "yt-dlp";
const DEFAULT_YT_DLP_TIMEOUT_SECONDS: u64 = 180;
const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 3;
const DEFAULT_DOWNLOAD_RETENTION_SECONDS: u64 = 20 * 60;
const DEFAULT_STALE_DOWNLOAD_SECONDS: u64 = 2 * 60 * 60;

/// Runtime settings, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub storage_root: PathBuf,
    pub yt_dlp_bin: String,
    pub engine_timeout: Duration,
    pub max_concurrent_downloads: usize,
    /// Zero keeps downloaded files until the next startup sweep.
    pub download_retention: Duration,
    /// Zero disables the startup sweep.
    pub stale_after: Duration,
    pub strict_domain_match: bool,
    pub allowed_origins: Vec<String>,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let bind_addr = if let Some(configured) = lookup("APP_ADDR").as_deref().and_then(non_empty)
        {
            configured.to_string()
        } else if let Some(port) = lookup("PORT").and_then(|value| value.trim().parse::<u16>().ok())
        {
            format!("0.0.0.0:{port}")
        } else {
            DEFAULT_BIND_ADDR.to_string()
        };

        let storage_root = lookup("DOWNLOAD_DIR")
            .as_deref()
            .and_then(non_empty)
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("video-downloader"));

        let yt_dlp_bin = lookup("YT_DLP_BIN")
            .as_deref()
            .and_then(non_empty)
            .unwrap_or(DEFAULT_YT_DLP_BIN)
            .to_string();

        let engine_timeout = read_u64(&lookup, "YT_DLP_TIMEOUT_SECONDS")
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_YT_DLP_TIMEOUT_SECONDS);

        let max_concurrent_downloads = read_u64(&lookup, "MAX_CONCURRENT_DOWNLOADS")
            .and_then(|value| usize::try_from(value).ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_MAX_CONCURRENT_DOWNLOADS);

        let allowed_origins = lookup("ALLOWED_ORIGINS")
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|origin| !origin.is_empty())
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        Self {
            bind_addr,
            storage_root,
            yt_dlp_bin,
            engine_timeout: Duration::from_secs(engine_timeout),
            max_concurrent_downloads,
            download_retention: Duration::from_secs(
                read_u64(&lookup, "DOWNLOAD_RETENTION_SECONDS")
                    .unwrap_or(DEFAULT_DOWNLOAD_RETENTION_SECONDS),
            ),
            stale_after: Duration::from_secs(
                read_u64(&lookup, "STALE_DOWNLOAD_SECONDS")
                    .unwrap_or(DEFAULT_STALE_DOWNLOAD_SECONDS),
            ),
            strict_domain_match: read_bool(&lookup, "STRICT_DOMAIN_MATCH").unwrap_or(false),
            allowed_origins,
        }
    }
}

fn read_bool(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<bool> {
    let value = lookup(name)?;
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn read_u64(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<u64> {
    lookup(name).and_then(|value| value.trim().parse::<u64>().ok())
}

pub(crate) fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
