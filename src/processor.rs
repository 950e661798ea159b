use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::Local;
use serde::Serialize;
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

use crate::{
    engine::{DownloadJob, EngineError, EngineFormat, MediaEngine},
    error::ProcessorError,
    storage,
};

pub const BEST_FORMAT: &str = "bestvideo+bestaudio/best";
const BEST_MP4_FORMAT: &str = "best[ext=mp4]/bestvideo[ext=mp4]+bestaudio[ext=m4a]/best";
const BEST_M4A_FORMAT: &str = "bestaudio[ext=m4a]/bestaudio";
const BEST_MP3_FORMAT: &str = "bestaudio[ext=mp3]/bestaudio";

/// Matching is by substring unless strict matching is enabled, so hosts
/// like `evil-youtube.com.attacker.net` pass the default check.
const SUPPORTED_DOMAINS: [&str; 11] = [
    "youtube.com",
    "youtu.be",
    "www.youtube.com",
    "instagram.com",
    "www.instagram.com",
    "tiktok.com",
    "www.tiktok.com",
    "twitter.com",
    "www.twitter.com",
    "x.com",
    "www.x.com",
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormatDescriptor {
    pub format_id: String,
    pub description: String,
    pub ext: String,
}

impl FormatDescriptor {
    fn new(format_id: &str, description: &str, ext: &str) -> Self {
        Self {
            format_id: format_id.to_string(),
            description: description.to_string(),
            ext: ext.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoInfo {
    pub title: String,
    pub duration: String,
    pub thumbnail: String,
    pub uploader: String,
    pub formats: Vec<FormatDescriptor>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DownloadedFile {
    pub path: PathBuf,
    /// Sanitized title plus the extension the engine actually produced.
    pub filename: String,
}

pub struct VideoProcessor {
    engine: Arc<dyn MediaEngine>,
    storage_root: PathBuf,
    strict_domain_match: bool,
}

impl VideoProcessor {
    pub fn new(engine: Arc<dyn MediaEngine>, storage_root: impl Into<PathBuf>) -> Self {
        Self {
            engine,
            storage_root: storage_root.into(),
            strict_domain_match: false,
        }
    }

    pub fn with_strict_domain_match(mut self, strict: bool) -> Self {
        self.strict_domain_match = strict;
        self
    }

    pub fn storage_root(&self) -> &Path {
        &self.storage_root
    }

    pub fn is_valid_url(&self, url: &str) -> bool {
        is_valid_url(url)
    }

    pub fn is_supported_platform(&self, url: &str) -> bool {
        is_supported_platform(url, self.strict_domain_match)
    }

    pub async fn fetch_info(&self, url: &str) -> Result<VideoInfo, ProcessorError> {
        let info = self.engine.extract_info(url).await.map_err(|error| {
            warn!(%url, %error, "metadata extraction failed");
            classify(error, |message| {
                ProcessorError::Extraction(format!(
                    "Could not extract video information: {message}"
                ))
            })
        })?;

        Ok(VideoInfo {
            title: info.title.unwrap_or_else(|| "Unknown Title".to_string()),
            duration: format_duration(info.duration),
            thumbnail: info.thumbnail.unwrap_or_default(),
            uploader: info.uploader.unwrap_or_else(|| "Unknown".to_string()),
            formats: build_formats(info.formats.as_deref().unwrap_or_default()),
        })
    }

    pub async fn download(
        &self,
        url: &str,
        format_id: &str,
    ) -> Result<DownloadedFile, ProcessorError> {
        let format = resolve_format(format_id);
        let audio_only = is_audio_only(&format);
        let prefix = format!(
            "{}_{}",
            Local::now().format("%Y%m%d_%H%M%S"),
            &Uuid::new_v4().simple().to_string()[..8]
        );
        let output_template = self
            .storage_root
            .join(format!("{prefix}_%(title)s.%(ext)s"))
            .to_string_lossy()
            .into_owned();

        let result = self.run_download(url, &format, &prefix, output_template, audio_only).await;
        if result.is_err() {
            let removed = storage::remove_prefixed(&self.storage_root, &prefix).await;
            if removed > 0 {
                info!(%prefix, removed, "removed files of failed download");
            }
        }
        result
    }

    async fn run_download(
        &self,
        url: &str,
        format: &str,
        prefix: &str,
        output_template: String,
        audio_only: bool,
    ) -> Result<DownloadedFile, ProcessorError> {
        let download_failed = |error: EngineError| {
            warn!(%url, %format, %error, "download failed");
            classify(error, |message| {
                ProcessorError::Download(format!("Download failed: {message}"))
            })
        };

        let info = self
            .engine
            .extract_info(url)
            .await
            .map_err(download_failed)?;
        let clean_title = sanitize_title(info.title.as_deref().unwrap_or("video"));

        let job = DownloadJob {
            url: url.to_string(),
            format: format.to_string(),
            output_template,
            merge_to_mp4: !audio_only,
        };
        let printed_path = self.engine.download(&job).await.map_err(download_failed)?;

        let path = self
            .locate_artifact(printed_path.as_deref(), prefix)
            .await?
            .ok_or_else(|| ProcessorError::Internal("Downloaded file not found".to_string()))?;

        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("bin");
        let filename = format!("{clean_title}.{extension}");
        info!(%url, %format, path = %path.display(), %filename, "download ready");

        Ok(DownloadedFile { path, filename })
    }

    /// Prefers the path the engine printed; falls back to the first file in
    /// the storage root whose name starts with `prefix`.
    async fn locate_artifact(
        &self,
        printed_path: Option<&Path>,
        prefix: &str,
    ) -> Result<Option<PathBuf>, ProcessorError> {
        let canonical_root = tokio::fs::canonicalize(&self.storage_root)
            .await
            .map_err(|error| {
                ProcessorError::Internal(format!("could not resolve storage root: {error}"))
            })?;

        if let Some(path) = printed_path {
            let candidate = if path.is_absolute() {
                path.to_path_buf()
            } else {
                self.storage_root.join(path)
            };
            if let Some(valid) = resolve_candidate(&canonical_root, &candidate, prefix).await? {
                return Ok(Some(valid));
            }
            warn!(path = %candidate.display(), "engine reported a path that is not this job's artifact");
        }

        let mut entries = tokio::fs::read_dir(&self.storage_root)
            .await
            .map_err(|error| {
                ProcessorError::Internal(format!("could not open storage root: {error}"))
            })?;

        while let Some(entry) = entries.next_entry().await.map_err(|error| {
            ProcessorError::Internal(format!("could not read storage root: {error}"))
        })? {
            if let Some(valid) = resolve_candidate(&canonical_root, &entry.path(), prefix).await? {
                return Ok(Some(valid));
            }
        }

        Ok(None)
    }
}

/// Engine extensions for unfinished downloads; never handed to a client.
const PARTIAL_SUFFIXES: [&str; 3] = [".part", ".ytdl", ".temp"];

/// Accepts `candidate` only if it is a finished regular file of the job
/// named by `prefix`, inside the storage root. Returns its canonical path.
async fn resolve_candidate(
    canonical_root: &Path,
    candidate: &Path,
    prefix: &str,
) -> Result<Option<PathBuf>, ProcessorError> {
    let Some(name) = candidate.file_name().and_then(|name| name.to_str()) else {
        return Ok(None);
    };
    if !name.starts_with(prefix) || PARTIAL_SUFFIXES.iter().any(|suffix| name.ends_with(suffix)) {
        return Ok(None);
    }

    let metadata = match tokio::fs::metadata(candidate).await {
        Ok(metadata) => metadata,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
        Err(error) => {
            return Err(ProcessorError::Internal(format!(
                "could not inspect downloaded file: {error}"
            )));
        }
    };

    if !metadata.is_file() {
        return Ok(None);
    }

    let canonical = tokio::fs::canonicalize(candidate).await.map_err(|error| {
        ProcessorError::Internal(format!("could not resolve downloaded file: {error}"))
    })?;

    if !canonical.starts_with(canonical_root) {
        warn!(path = %canonical.display(), "ignoring file outside the storage root");
        return Ok(None);
    }

    Ok(Some(canonical))
}

fn classify(
    error: EngineError,
    media_failure: impl FnOnce(String) -> ProcessorError,
) -> ProcessorError {
    if error.is_media_failure() {
        media_failure(error.to_string())
    } else {
        ProcessorError::Internal(error.to_string())
    }
}

pub fn is_valid_url(url: &str) -> bool {
    let Some((scheme, rest)) = url.split_once(':') else {
        return false;
    };

    let mut chars = scheme.chars();
    let scheme_ok = chars.next().is_some_and(|first| first.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    if !scheme_ok {
        return false;
    }

    let Some(after_slashes) = rest.strip_prefix("//") else {
        return false;
    };
    after_slashes
        .split(['/', '?', '#'])
        .next()
        .is_some_and(|netloc| !netloc.is_empty())
}

pub fn is_supported_platform(url: &str, strict: bool) -> bool {
    let Ok(parsed) = Url::parse(url) else {
        return false;
    };
    let Some(host) = parsed.host_str() else {
        return false;
    };
    let host = host.to_lowercase();

    SUPPORTED_DOMAINS.iter().any(|domain| {
        if strict {
            host == *domain || host.ends_with(&format!(".{domain}"))
        } else {
            host.contains(domain)
        }
    })
}

/// Curated menu: four fixed "best" entries, then every engine format that
/// carries video, in engine order.
pub fn build_formats(formats: &[EngineFormat]) -> Vec<FormatDescriptor> {
    let mut descriptors = vec![
        FormatDescriptor::new(
            BEST_FORMAT,
            "📹 Best Quality Available (Video + Audio)",
            "mp4",
        ),
        FormatDescriptor::new(BEST_MP4_FORMAT, "📹 Best MP4 Quality with Audio", "mp4"),
        FormatDescriptor::new(BEST_M4A_FORMAT, "🎵 Best Audio Quality (M4A)", "m4a"),
        FormatDescriptor::new(BEST_MP3_FORMAT, "🎵 Best Audio Quality (MP3)", "mp3"),
    ];

    descriptors.extend(
        formats
            .iter()
            .filter(|format| has_video(format))
            .map(|format| FormatDescriptor {
                format_id: format.format_id.clone(),
                description: describe_format(format),
                ext: format.ext.clone().unwrap_or_else(|| "mp4".to_string()),
            }),
    );

    descriptors
}

fn describe_format(format: &EngineFormat) -> String {
    let mut description = match format.height.filter(|height| *height > 0) {
        Some(height) => format!("{height}p"),
        None => format
            .format_note
            .clone()
            .or_else(|| format.quality.map(|quality| quality.to_string()))
            .unwrap_or_else(|| "Unknown".to_string()),
    };

    if let Some(fps) = format.fps.filter(|fps| *fps > 0.0) {
        description.push_str(&format!(" {fps}fps"));
    }

    if has_audio(format) {
        description.push_str(" (Video + Audio)");
    } else {
        description.push_str(" (Video only)");
    }

    if let Some(bytes) = format.filesize.filter(|bytes| *bytes > 0.0) {
        description.push_str(&format!(" - {:.1}MB", bytes / 1_048_576.0));
    }

    description
}

fn has_video(format: &EngineFormat) -> bool {
    matches!(format.vcodec.as_deref(), Some(value) if value != "none")
}

fn has_audio(format: &EngineFormat) -> bool {
    matches!(format.acodec.as_deref(), Some(value) if value != "none")
}

pub fn resolve_format(format_id: &str) -> String {
    if format_id == "best" {
        BEST_FORMAT.to_string()
    } else {
        format_id.to_string()
    }
}

pub fn is_audio_only(format: &str) -> bool {
    format.contains("bestaudio") && !format.contains("bestvideo")
}

pub fn format_duration(seconds: Option<f64>) -> String {
    let Some(total) = seconds.filter(|value| *value > 0.0) else {
        return "Unknown".to_string();
    };
    let total = total as u64;
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;

    if hours > 0 {
        format!("{hours}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes}:{seconds:02}")
    }
}

/// Keeps letters, digits, underscores, whitespace and hyphens, then turns
/// each run of hyphens/whitespace into a single hyphen.
pub fn sanitize_title(title: &str) -> String {
    let mut sanitized = String::with_capacity(title.len());
    let mut in_separator_run = false;

    for character in title.chars() {
        if character == '-' || character.is_whitespace() {
            if !in_separator_run {
                sanitized.push('-');
                in_separator_run = true;
            }
        } else if character.is_alphanumeric() || character == '_' {
            sanitized.push(character);
            in_separator_run = false;
        }
    }

    if sanitized.is_empty() {
        "video".to_string()
    } else {
        sanitized
    }
}
