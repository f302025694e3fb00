//! yt-dlp-backed capability providers.
//!
//! The backend never builds shell strings: every invocation is an argument
//! vector handed to `tokio::process::Command`, so a hostile URL cannot smuggle
//! shell syntax into the call. Both capabilities (metadata extraction and
//! media extraction) are traits so tests can substitute stub binaries and a
//! future revision can swap in a remote backend without touching the routes.

use std::{
    io,
    path::PathBuf,
    pin::Pin,
    process::Stdio,
    task::{Context, Poll},
    time::Duration,
};

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde::Deserialize;
use tokio::{
    io::{AsyncRead, ReadBuf},
    process::{Child, ChildStdout, Command},
    time::timeout,
};

use crate::{
    error::DownloadError,
    formats::StreamDescriptor,
};

/// Budget for the metadata-only call. Media extraction budgets come from the
/// caller (config) because they dominate the request wall-clock.
const METADATA_TIMEOUT_SECS: u64 = 20;

/// Minimal mirror of yt-dlp's `--dump-single-json` payload. Only the fields
/// this service reads are declared; everything stays optional because older
/// videos may lack metadata.
#[derive(Debug, Deserialize)]
pub struct VideoInfo {
    pub id: String,
    pub title: Option<String>,
    pub fulltitle: Option<String>,
    pub description: Option<String>,
    pub view_count: Option<i64>,
    pub upload_date: Option<String>,
    #[serde(default)]
    pub release_timestamp: Option<i64>,
    pub uploader: Option<String>,
    pub channel: Option<String>,
    pub duration: Option<i64>,
    #[serde(rename = "duration_string")]
    pub duration_string: Option<String>,
    pub formats: Option<Vec<FormatInfo>>,
}

#[derive(Debug, Deserialize)]
pub struct FormatInfo {
    #[serde(rename = "format_id")]
    pub format_id: Option<String>,
    pub height: Option<i64>,
    pub fps: Option<f64>,
    pub ext: Option<String>,
    pub vcodec: Option<String>,
    pub filesize: Option<i64>,
    #[serde(rename = "filesize_approx")]
    pub filesize_approx: Option<i64>,
}

/// Normalized, request-scoped view of one video's metadata.
#[derive(Debug, Clone)]
pub struct VideoMetadata {
    pub video_id: String,
    pub title: String,
    pub author: Option<String>,
    pub duration: Option<i64>,
    pub duration_text: Option<String>,
    pub views: Option<i64>,
    pub publish_date: Option<String>,
    pub description: String,
    pub streams: Vec<StreamDescriptor>,
}

/// What the extraction tool is asked to produce.
#[derive(Debug, Clone)]
pub enum ExtractionMode {
    Video,
    /// Extract the audio track and transcode to mp3 at the given bitrate.
    Audio { bitrate_kbps: u32 },
}

/// One resolved extraction: source URL plus the rendered format selector.
#[derive(Debug, Clone)]
pub struct ExtractionRequest {
    pub url: String,
    pub selector: String,
    pub mode: ExtractionMode,
}

/// Live extraction process with its stdout pipe. Dropping the handle kills
/// the child (`kill_on_drop`), which is how client disconnection terminates
/// an in-flight streamed download.
#[derive(Debug)]
pub struct MediaStream {
    child: Child,
    stdout: ChildStdout,
}

impl MediaStream {
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }
}

impl AsyncRead for MediaStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdout).poll_read(cx, buf)
    }
}

/// Capability: fetch title/author/streams for a URL, or fail with a
/// `NotFound`-style error when the video is unavailable.
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<VideoMetadata, DownloadError>;
}

/// Capability: produce a media file (or byte stream) for a resolved format
/// selector, respecting the caller's wall-clock budget.
#[async_trait]
pub trait ExtractionProvider: Send + Sync {
    /// Runs the tool with `-o <output_template>`; the template may contain
    /// yt-dlp substitutions such as `%(ext)s`.
    async fn extract_to_path(
        &self,
        request: &ExtractionRequest,
        output_template: &str,
        budget: Duration,
    ) -> Result<(), DownloadError>;

    /// Spawns the tool with media directed to stdout. The caller owns the
    /// returned handle for the lifetime of the response.
    fn open_stream(&self, request: &ExtractionRequest) -> Result<MediaStream, DownloadError>;
}

/// The production provider: a yt-dlp binary on disk.
#[derive(Debug, Clone)]
pub struct YtDlp {
    bin: PathBuf,
}

impl YtDlp {
    pub fn new(bin: PathBuf) -> Self {
        Self { bin }
    }

    /// Runs `yt-dlp --version` to fail loudly at startup when the tool is
    /// missing or broken.
    pub async fn ensure_available(&self) -> Result<()> {
        let status = Command::new(&self.bin)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;

        match status {
            Ok(status) if status.success() => Ok(()),
            Ok(_) => bail!(
                "{} is installed but returned a failure status",
                self.bin.display()
            ),
            Err(err) => bail!(
                "{} is not installed or not in PATH: {}",
                self.bin.display(),
                err
            ),
        }
    }

    fn base_command(&self) -> Command {
        let mut command = Command::new(&self.bin);
        command
            .arg("--no-playlist")
            .arg("--no-warnings")
            .arg("--no-progress")
            .stdin(Stdio::null())
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl MetadataProvider for YtDlp {
    async fn fetch(&self, url: &str) -> Result<VideoMetadata, DownloadError> {
        let mut command = self.base_command();
        command
            .arg("--dump-single-json")
            .arg("--skip-download")
            .arg(url)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        log::debug!("fetching metadata for {url}");

        let budget = Duration::from_secs(METADATA_TIMEOUT_SECS);
        let output = timeout(budget, command.output())
            .await
            .map_err(|_| DownloadError::Timeout(budget.as_secs()))?
            .map_err(spawn_error)?;

        if !output.status.success() {
            return Err(classify_tool_failure(&output.stderr));
        }

        let info: VideoInfo = serde_json::from_slice(&output.stdout).map_err(|err| {
            DownloadError::ExtractionFailed(format!("could not parse yt-dlp metadata: {err}"))
        })?;

        Ok(build_metadata(info))
    }
}

#[async_trait]
impl ExtractionProvider for YtDlp {
    async fn extract_to_path(
        &self,
        request: &ExtractionRequest,
        output_template: &str,
        budget: Duration,
    ) -> Result<(), DownloadError> {
        let mut command = self.base_command();
        command
            .arg("--format")
            .arg(&request.selector)
            .arg("--output")
            .arg(output_template);

        if let ExtractionMode::Audio { bitrate_kbps } = request.mode {
            command
                .arg("--extract-audio")
                .arg("--audio-format")
                .arg("mp3")
                .arg("--audio-quality")
                .arg(format!("{bitrate_kbps}K"));
        }

        command
            .arg(&request.url)
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        log::info!(
            "extracting {} with selector {:?} (budget {}s)",
            request.url,
            request.selector,
            budget.as_secs()
        );

        let output = timeout(budget, command.output())
            .await
            .map_err(|_| DownloadError::Timeout(budget.as_secs()))?
            .map_err(spawn_error)?;

        if !output.status.success() {
            return Err(classify_tool_failure(&output.stderr));
        }

        Ok(())
    }

    fn open_stream(&self, request: &ExtractionRequest) -> Result<MediaStream, DownloadError> {
        let mut command = self.base_command();
        command
            .arg("--format")
            .arg(&request.selector)
            .arg("--output")
            .arg("-")
            .arg("--quiet")
            .arg(&request.url)
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        log::info!(
            "streaming {} with selector {:?}",
            request.url,
            request.selector
        );

        let mut child = command.spawn().map_err(spawn_error)?;
        let stdout = child.stdout.take().ok_or_else(|| {
            DownloadError::Unexpected("extraction process stdout was not captured".to_string())
        })?;

        Ok(MediaStream { child, stdout })
    }
}

fn spawn_error(err: io::Error) -> DownloadError {
    if err.kind() == io::ErrorKind::NotFound {
        DownloadError::Unexpected(
            "yt-dlp is not installed; install it and restart the backend".to_string(),
        )
    } else {
        DownloadError::Io(err)
    }
}

/// Maps a non-zero yt-dlp exit onto the error taxonomy using the last
/// meaningful stderr line. Private/deleted videos are reported distinctly so
/// the client can show an actionable message.
fn classify_tool_failure(stderr: &[u8]) -> DownloadError {
    let message = String::from_utf8_lossy(stderr)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .unwrap_or("yt-dlp could not complete the operation")
        .to_string();

    let lower = message.to_ascii_lowercase();
    if lower.contains("private video")
        || lower.contains("video unavailable")
        || lower.contains("has been removed")
        || lower.contains("not available")
        || lower.contains("account associated")
    {
        DownloadError::NotFound(
            "This video is unavailable. It might be private or removed.".to_string(),
        )
    } else {
        DownloadError::ExtractionFailed(message)
    }
}

/// Translates the raw yt-dlp payload into the normalized record the API
/// serves, converting dates and durations on the way.
fn build_metadata(info: VideoInfo) -> VideoMetadata {
    let title = info
        .fulltitle
        .as_deref()
        .or(info.title.as_deref())
        .filter(|t| !t.is_empty())
        .unwrap_or(&info.id)
        .to_owned();

    let publish_date = info
        .upload_date
        .as_deref()
        .and_then(upload_date_to_iso)
        .or_else(|| info.release_timestamp.and_then(timestamp_to_iso));

    let duration_text = info
        .duration_string
        .clone()
        .or_else(|| info.duration.map(format_duration));

    let author = info.channel.clone().or_else(|| info.uploader.clone());

    let streams = info
        .formats
        .unwrap_or_default()
        .into_iter()
        .filter_map(|format| {
            let format_id = format.format_id?;
            Some(StreamDescriptor {
                format_id,
                height: format.height,
                fps: format.fps,
                ext: format.ext.unwrap_or_else(|| "mp4".to_owned()),
                estimated_bytes: format.filesize.or(format.filesize_approx),
                video_codec: format.vcodec,
            })
        })
        .collect();

    VideoMetadata {
        video_id: info.id,
        title,
        author,
        duration: info.duration,
        duration_text,
        views: info.view_count,
        publish_date,
        description: info.description.unwrap_or_default(),
        streams,
    }
}

/// Converts yt-dlp's `YYYYMMDD` upload date format into ISO-8601.
fn upload_date_to_iso(value: &str) -> Option<String> {
    if value.len() != 8 {
        return None;
    }
    let year = &value[0..4];
    let month = &value[4..6];
    let day = &value[6..8];
    let naive = NaiveDate::from_ymd_opt(year.parse().ok()?, month.parse().ok()?, day.parse().ok()?);
    let naive = naive?.and_hms_opt(0, 0, 0)?;
    Some(format!("{}Z", naive.format("%Y-%m-%dT%H:%M:%S")))
}

/// Converts epoch seconds into an ISO-8601 string.
fn timestamp_to_iso(timestamp: i64) -> Option<String> {
    chrono::DateTime::<Utc>::from_timestamp(timestamp, 0).map(|datetime| datetime.to_rfc3339())
}

/// Renders durations as `H:MM:SS` or `M:SS` for short clips.
pub fn format_duration(duration: i64) -> String {
    let hours = duration / 3600;
    let minutes = (duration % 3600) / 60;
    let seconds = duration % 60;

    if hours > 0 {
        format!("{hours}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes}:{seconds:02}")
    }
}
