//! Adapter around the `yt-dlp` executable.
//!
//! The processor only sees [`MediaEngine`]; [`YtDlp`] is the production
//! implementation and runs the binary as a child process.

use std::{io::ErrorKind, path::PathBuf, process::Output, time::Duration};

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::{process::Command, time::timeout};
use tracing::debug;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0} is not installed on this system")]
    NotInstalled(String),
    #[error("could not run the extraction engine: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("the operation took longer than {0} seconds")]
    TimedOut(u64),
    #[error("{0}")]
    Failed(String),
    #[error("unreadable engine output: {0}")]
    InvalidOutput(#[from] serde_json::Error),
}

impl EngineError {
    /// True when the engine ran and reported a problem with the media
    /// itself, as opposed to the engine being unusable.
    pub fn is_media_failure(&self) -> bool {
        matches!(
            self,
            Self::Failed(_) | Self::TimedOut(_) | Self::InvalidOutput(_)
        )
    }
}

/// Metadata as reported by `yt-dlp -J`.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct EngineInfo {
    pub title: Option<String>,
    pub duration: Option<f64>,
    pub thumbnail: Option<String>,
    pub uploader: Option<String>,
    #[serde(default)]
    pub formats: Option<Vec<EngineFormat>>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct EngineFormat {
    pub format_id: String,
    pub ext: Option<String>,
    pub vcodec: Option<String>,
    pub acodec: Option<String>,
    pub height: Option<u32>,
    pub fps: Option<f64>,
    pub format_note: Option<String>,
    pub quality: Option<f64>,
    pub filesize: Option<f64>,
}

/// One download invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadJob {
    pub url: String,
    pub format: String,
    pub output_template: String,
    pub merge_to_mp4: bool,
}

#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn extract_info(&self, url: &str) -> Result<EngineInfo, EngineError>;

    /// Runs the download and returns the final file path if the engine
    /// reported one.
    async fn download(&self, job: &DownloadJob) -> Result<Option<PathBuf>, EngineError>;
}

#[derive(Debug, Clone)]
pub struct YtDlp {
    binary: String,
    timeout: Duration,
}

impl YtDlp {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    async fn run(&self, args: Vec<String>) -> Result<Output, EngineError> {
        debug!(binary = %self.binary, ?args, "running extraction engine");
        let command_future = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output();
        let output = timeout(self.timeout, command_future)
            .await
            .map_err(|_| EngineError::TimedOut(self.timeout.as_secs()))?
            .map_err(|error| {
                if error.kind() == ErrorKind::NotFound {
                    EngineError::NotInstalled(self.binary.clone())
                } else {
                    EngineError::Spawn(error)
                }
            })?;

        if !output.status.success() {
            return Err(EngineError::Failed(run_error_message(&output.stderr)));
        }

        Ok(output)
    }
}

#[async_trait]
impl MediaEngine for YtDlp {
    async fn extract_info(&self, url: &str) -> Result<EngineInfo, EngineError> {
        let output = self.run(info_args(url)).await?;
        Ok(serde_json::from_slice(&output.stdout)?)
    }

    async fn download(&self, job: &DownloadJob) -> Result<Option<PathBuf>, EngineError> {
        let output = self.run(download_args(job)).await?;
        Ok(printed_artifact(&output.stdout))
    }
}

fn info_args(url: &str) -> Vec<String> {
    vec![
        "-J".to_string(),
        "--no-playlist".to_string(),
        "--no-warnings".to_string(),
        url.to_string(),
    ]
}

fn download_args(job: &DownloadJob) -> Vec<String> {
    let mut args = vec![
        "--no-playlist".to_string(),
        "--no-warnings".to_string(),
        "--newline".to_string(),
        "--print".to_string(),
        "after_move:filepath".to_string(),
        "-o".to_string(),
        job.output_template.clone(),
        "-f".to_string(),
        job.format.clone(),
    ];

    if job.merge_to_mp4 {
        args.push("--merge-output-format".to_string());
        args.push("mp4".to_string());
    }

    args.push(job.url.clone());
    args
}

fn run_error_message(stderr: &[u8]) -> String {
    let message = String::from_utf8_lossy(stderr)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .unwrap_or("yt-dlp could not complete the operation")
        .to_string();

    match message.strip_prefix("ERROR:") {
        Some(rest) => rest.trim().to_string(),
        None => message,
    }
}

/// `--print after_move:filepath` emits the final path after every progress
/// line, so the artifact is the last line that is not a `[tag]` status line.
fn printed_artifact(stdout: &[u8]) -> Option<PathBuf> {
    String::from_utf8_lossy(stdout)
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with('['))
        .map(PathBuf::from)
}
