//! Delivery strategies for resolved downloads.
//!
//! Small payloads are buffered: the extraction tool writes a uniquely named
//! scratch file under a hard wall-clock budget, the file is read whole, and
//! the scratch path is deleted on every exit path. Large payloads are
//! streamed: bytes flow from the extraction process's stdout straight into
//! the response body, and client disconnection kills the child process.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use uuid::Uuid;

use crate::{
    error::DownloadError,
    formats::{AudioTier, DeliveryPlan, FallbackChain},
    ytdlp::{ExtractionMode, ExtractionProvider, ExtractionRequest, MediaStream},
};

/// Format selector used for audio extraction; the mp3 transcode happens as a
/// post-processing step, so the source selector just wants the best audio
/// track.
const AUDIO_SELECTOR: &str = "bestaudio/best";

/// A fully buffered download, ready to be sent as one response.
#[derive(Debug)]
pub struct BufferedFile {
    pub bytes: Vec<u8>,
    pub filename: String,
    pub content_type: String,
}

/// Result of dispatching a resolved chain.
#[derive(Debug)]
pub enum DeliveryOutcome {
    Buffered(BufferedFile),
    Streamed {
        stream: MediaStream,
        filename: String,
        content_type: String,
    },
}

/// Executes the delivery strategy chosen for a request.
pub struct Dispatcher {
    extractor: Arc<dyn ExtractionProvider>,
    scratch_dir: PathBuf,
    buffer_timeout: Duration,
    retry_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        extractor: Arc<dyn ExtractionProvider>,
        scratch_dir: PathBuf,
        buffer_timeout: Duration,
        retry_timeout: Duration,
    ) -> Self {
        Self {
            extractor,
            scratch_dir,
            buffer_timeout,
            retry_timeout,
        }
    }

    /// Runs the chain under the chosen plan. `ext_hint` names the container
    /// the streamed strategy should advertise, since no file ever exists to
    /// inspect.
    pub async fn dispatch(
        &self,
        chain: &FallbackChain,
        url: &str,
        title: &str,
        ext_hint: &str,
        plan: DeliveryPlan,
    ) -> Result<DeliveryOutcome, DownloadError> {
        match plan {
            DeliveryPlan::Buffered => self
                .buffered(
                    &chain.selector(),
                    &chain.terminal().selector(),
                    url,
                    title,
                    ExtractionMode::Video,
                )
                .await
                .map(DeliveryOutcome::Buffered),
            DeliveryPlan::Streamed => {
                let request = ExtractionRequest {
                    url: url.to_owned(),
                    selector: chain.selector(),
                    mode: ExtractionMode::Video,
                };
                let stream = self.extractor.open_stream(&request)?;
                Ok(DeliveryOutcome::Streamed {
                    stream,
                    filename: attachment_filename(title, ext_hint),
                    content_type: content_type_for_ext(ext_hint),
                })
            }
        }
    }

    /// Audio is always buffered: the mp3 conversion only runs once the
    /// source download completes, so there is nothing to forward early.
    pub async fn dispatch_audio(
        &self,
        tier: AudioTier,
        url: &str,
        title: &str,
    ) -> Result<BufferedFile, DownloadError> {
        self.buffered(
            AUDIO_SELECTOR,
            AUDIO_SELECTOR,
            url,
            title,
            ExtractionMode::Audio {
                bitrate_kbps: tier.bitrate_kbps(),
            },
        )
        .await
    }

    /// The buffered strategy: extract to a scratch file, retry once with the
    /// terminal selector if the tool succeeded without producing output, and
    /// read the result into memory. The scratch guard deletes every file
    /// carrying this request's token on all exit paths.
    async fn buffered(
        &self,
        primary_selector: &str,
        terminal_selector: &str,
        url: &str,
        title: &str,
        mode: ExtractionMode,
    ) -> Result<BufferedFile, DownloadError> {
        tokio::fs::create_dir_all(&self.scratch_dir).await?;
        let guard = ScratchGuard::new(&self.scratch_dir);

        let request = ExtractionRequest {
            url: url.to_owned(),
            selector: primary_selector.to_owned(),
            mode: mode.clone(),
        };
        self.extractor
            .extract_to_path(&request, &guard.output_template(), self.buffer_timeout)
            .await?;

        let mut produced = guard.find_output()?;
        if produced.is_none() {
            log::warn!(
                "extraction of {url} produced no output file, retrying with {terminal_selector:?}"
            );
            let retry = ExtractionRequest {
                url: url.to_owned(),
                selector: terminal_selector.to_owned(),
                mode,
            };
            self.extractor
                .extract_to_path(&retry, &guard.output_template(), self.retry_timeout)
                .await?;
            produced = guard.find_output()?;
        }

        let path = produced.ok_or_else(|| {
            DownloadError::ExtractionFailed(
                "extraction completed without producing an output file".to_string(),
            )
        })?;

        let bytes = tokio::fs::read(&path).await?;
        if bytes.is_empty() {
            return Err(DownloadError::ExtractionFailed(
                "extraction produced an empty file".to_string(),
            ));
        }

        let ext = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("mp4")
            .to_owned();

        Ok(BufferedFile {
            bytes,
            filename: attachment_filename(title, &ext),
            content_type: content_type_for_ext(&ext),
        })
    }
}

/// Owns one request's scratch token. yt-dlp picks the final extension, so
/// cleanup sweeps everything with the token prefix, including `.part` files
/// left by an interrupted download.
struct ScratchGuard {
    dir: PathBuf,
    token: String,
}

impl ScratchGuard {
    fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            token: Uuid::new_v4().to_string(),
        }
    }

    /// yt-dlp `-o` template: `<dir>/<token>.%(ext)s`.
    fn output_template(&self) -> String {
        format!("{}/{}.%(ext)s", self.dir.display(), self.token)
    }

    /// Finds the completed output file for this token, ignoring partials.
    fn find_output(&self) -> Result<Option<PathBuf>, DownloadError> {
        let prefix = format!("{}.", self.token);
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(&prefix) && !name.ends_with(".part") {
                return Ok(Some(entry.path()));
            }
        }
        Ok(None)
    }
}

impl Drop for ScratchGuard {
    fn drop(&mut self) {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return;
        };
        for entry in entries.flatten() {
            if entry
                .file_name()
                .to_string_lossy()
                .starts_with(&self.token)
            {
                if let Err(err) = std::fs::remove_file(entry.path()) {
                    log::warn!(
                        "could not remove scratch file {}: {err}",
                        entry.path().display()
                    );
                }
            }
        }
    }
}

/// Replaces every character outside `[A-Za-z0-9.-]` so the result is safe in
/// a `Content-Disposition` header and on any filesystem.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();

    if cleaned.chars().all(|c| c == '-' || c == '.') {
        "download".to_string()
    } else {
        cleaned
    }
}

pub fn attachment_filename(title: &str, ext: &str) -> String {
    format!("{}.{}", sanitize_filename(title), ext)
}

/// Content type for the containers yt-dlp actually hands back, with a
/// mime_guess fallback for anything exotic.
pub fn content_type_for_ext(ext: &str) -> String {
    match ext.to_ascii_lowercase().as_str() {
        "mp4" => "video/mp4".to_owned(),
        "webm" => "video/webm".to_owned(),
        "mkv" => "video/x-matroska".to_owned(),
        "avi" => "video/x-msvideo".to_owned(),
        "mp3" => "audio/mpeg".to_owned(),
        other => mime_guess::from_ext(other)
            .first()
            .map(|mime| mime.to_string())
            .unwrap_or_else(|| "application/octet-stream".to_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::{QualityPreset, resolve};
    use crate::ytdlp::YtDlp;
    use std::fs;
    #[cfg(unix)]
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    #[test]
    fn sanitized_names_only_use_the_safe_alphabet() {
        let inputs = [
            "Rick Astley - Never Gonna Give You Up (Official Video)",
            "weird/../../path\\injection",
            "tabs\tand\nnewlines",
            "ünïcödé ✨ title",
            "already-safe.name-123",
        ];
        for input in inputs {
            let sanitized = sanitize_filename(input);
            assert!(
                sanitized
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-'),
                "bad char survived in {sanitized:?}"
            );
        }
        assert_eq!(sanitize_filename("already-safe.name-123"), "already-safe.name-123");
    }

    #[test]
    fn sanitization_falls_back_when_nothing_survives() {
        assert_eq!(sanitize_filename("★★★"), "download");
        assert_eq!(sanitize_filename(""), "download");
        assert_eq!(attachment_filename("★", "mp4"), "download.mp4");
    }

    #[test]
    fn content_types_cover_the_known_containers() {
        assert_eq!(content_type_for_ext("mp4"), "video/mp4");
        assert_eq!(content_type_for_ext("WEBM"), "video/webm");
        assert_eq!(content_type_for_ext("mkv"), "video/x-matroska");
        assert_eq!(content_type_for_ext("avi"), "video/x-msvideo");
        assert_eq!(content_type_for_ext("mp3"), "audio/mpeg");
        assert_eq!(content_type_for_ext("zzz"), "application/octet-stream");
    }

    #[test]
    fn scratch_guard_sweeps_its_token_on_drop() {
        let dir = tempdir().unwrap();
        let guard = ScratchGuard::new(dir.path());
        let kept = dir.path().join("unrelated.mp4");
        let swept = dir.path().join(format!("{}.mp4", guard.token));
        let partial = dir.path().join(format!("{}.mp4.part", guard.token));
        fs::write(&kept, b"keep").unwrap();
        fs::write(&swept, b"sweep").unwrap();
        fs::write(&partial, b"sweep").unwrap();

        assert_eq!(guard.find_output().unwrap(), Some(swept.clone()));
        drop(guard);

        assert!(kept.exists());
        assert!(!swept.exists());
        assert!(!partial.exists());
    }

    /// Installs an executable yt-dlp stand-in and returns its path. The
    /// script body receives the resolved `--output` value as `$output`.
    #[cfg(unix)]
    fn install_stub(dir: &Path, body: &str) -> PathBuf {
        let script_path = dir.join("yt-dlp");
        let script = format!(
            r#"#!/usr/bin/env bash
set -euo pipefail
prev=""
output=""
for arg in "$@"; do
    if [[ "$prev" == "--output" ]]; then
        output="$arg"
    fi
    prev="$arg"
done
{body}
"#
        );
        fs::write(&script_path, script).unwrap();
        let mut perms = fs::metadata(&script_path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&script_path, perms).unwrap();
        script_path
    }

    #[cfg(unix)]
    fn dispatcher_with_stub(stub: PathBuf, scratch: &Path) -> Dispatcher {
        Dispatcher::new(
            Arc::new(YtDlp::new(stub)),
            scratch.to_path_buf(),
            Duration::from_secs(5),
            Duration::from_secs(2),
        )
    }

    fn scratch_is_empty(scratch: &Path) -> bool {
        fs::read_dir(scratch)
            .map(|entries| entries.count() == 0)
            .unwrap_or(true)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn buffered_dispatch_returns_bytes_and_cleans_up() {
        let bin_dir = tempdir().unwrap();
        let scratch = tempdir().unwrap();
        let stub = install_stub(
            bin_dir.path(),
            r#"target="${output/\%(ext)s/mp4}"
printf 'fake-video-bytes' > "$target""#,
        );
        let dispatcher = dispatcher_with_stub(stub, scratch.path());

        let chain = resolve(&QualityPreset::Best);
        let outcome = dispatcher
            .dispatch(
                &chain,
                "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
                "A Title With Spaces!",
                "mp4",
                DeliveryPlan::Buffered,
            )
            .await
            .unwrap();

        let DeliveryOutcome::Buffered(file) = outcome else {
            panic!("expected buffered outcome");
        };
        assert_eq!(file.bytes, b"fake-video-bytes");
        assert_eq!(file.content_type, "video/mp4");
        assert_eq!(file.filename, "A-Title-With-Spaces-.mp4");
        assert!(scratch_is_empty(scratch.path()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn empty_output_retries_once_then_fails() {
        let bin_dir = tempdir().unwrap();
        let scratch = tempdir().unwrap();
        let invocation_log = bin_dir.path().join("invocations.log");
        // Exits 0 but never writes an output file.
        let stub = install_stub(
            bin_dir.path(),
            &format!(r#"echo "$@" >> "{}""#, invocation_log.display()),
        );
        let dispatcher = dispatcher_with_stub(stub, scratch.path());

        let chain = resolve(&QualityPreset::UltraReliable);
        let err = dispatcher
            .dispatch(
                &chain,
                "https://youtu.be/dQw4w9WgXcQ",
                "title",
                "mp4",
                DeliveryPlan::Buffered,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::ExtractionFailed(_)));
        let log = fs::read_to_string(&invocation_log).unwrap();
        assert_eq!(log.lines().count(), 2, "expected exactly one retry");
        assert!(log.lines().nth(1).unwrap().contains("--format worst --output"));
        assert!(scratch_is_empty(scratch.path()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn budget_overrun_reports_a_timeout() {
        let bin_dir = tempdir().unwrap();
        let scratch = tempdir().unwrap();
        let stub = install_stub(bin_dir.path(), "sleep 5");
        let dispatcher = Dispatcher::new(
            Arc::new(YtDlp::new(stub)),
            scratch.path().to_path_buf(),
            Duration::from_millis(200),
            Duration::from_millis(200),
        );

        let chain = resolve(&QualityPreset::Best);
        let err = dispatcher
            .dispatch(
                &chain,
                "https://youtu.be/dQw4w9WgXcQ",
                "title",
                "mp4",
                DeliveryPlan::Buffered,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::Timeout(_)));
        assert!(err.to_string().contains("timeout"));
        assert!(scratch_is_empty(scratch.path()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn private_videos_surface_as_not_found() {
        let bin_dir = tempdir().unwrap();
        let scratch = tempdir().unwrap();
        let stub = install_stub(
            bin_dir.path(),
            r#"echo "ERROR: Private video" >&2
exit 1"#,
        );
        let dispatcher = dispatcher_with_stub(stub, scratch.path());

        let chain = resolve(&QualityPreset::Best);
        let err = dispatcher
            .dispatch(
                &chain,
                "https://youtu.be/dQw4w9WgXcQ",
                "title",
                "mp4",
                DeliveryPlan::Buffered,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::NotFound(_)));
        assert!(scratch_is_empty(scratch.path()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn zero_byte_output_counts_as_extraction_failure() {
        let bin_dir = tempdir().unwrap();
        let scratch = tempdir().unwrap();
        let stub = install_stub(
            bin_dir.path(),
            r#"target="${output/\%(ext)s/mp4}"
: > "$target""#,
        );
        let dispatcher = dispatcher_with_stub(stub, scratch.path());

        let chain = resolve(&QualityPreset::Best);
        let err = dispatcher
            .dispatch(
                &chain,
                "https://youtu.be/dQw4w9WgXcQ",
                "title",
                "mp4",
                DeliveryPlan::Buffered,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::ExtractionFailed(_)));
        assert!(scratch_is_empty(scratch.path()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn streamed_dispatch_forwards_stdout() {
        use tokio::io::AsyncReadExt;

        let bin_dir = tempdir().unwrap();
        let scratch = tempdir().unwrap();
        let stub = install_stub(bin_dir.path(), r#"printf 'streamed-bytes'"#);
        let dispatcher = dispatcher_with_stub(stub, scratch.path());

        let chain = resolve(&QualityPreset::Best);
        let outcome = dispatcher
            .dispatch(
                &chain,
                "https://youtu.be/dQw4w9WgXcQ",
                "My Video",
                "webm",
                DeliveryPlan::Streamed,
            )
            .await
            .unwrap();

        let DeliveryOutcome::Streamed {
            mut stream,
            filename,
            content_type,
        } = outcome
        else {
            panic!("expected streamed outcome");
        };
        assert_eq!(filename, "My-Video.webm");
        assert_eq!(content_type, "video/webm");

        let mut collected = Vec::new();
        stream.read_to_end(&mut collected).await.unwrap();
        assert_eq!(collected, b"streamed-bytes");
        assert!(scratch_is_empty(scratch.path()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn audio_dispatch_transcodes_to_mp3() {
        let bin_dir = tempdir().unwrap();
        let scratch = tempdir().unwrap();
        let invocation_log = bin_dir.path().join("invocations.log");
        let stub = install_stub(
            bin_dir.path(),
            &format!(
                r#"echo "$@" >> "{}"
target="${{output/\%(ext)s/mp3}}"
printf 'fake-audio' > "$target""#,
                invocation_log.display()
            ),
        );
        let dispatcher = dispatcher_with_stub(stub, scratch.path());

        let file = dispatcher
            .dispatch_audio(AudioTier::Good, "https://youtu.be/dQw4w9WgXcQ", "Song")
            .await
            .unwrap();

        assert_eq!(file.bytes, b"fake-audio");
        assert_eq!(file.content_type, "audio/mpeg");
        assert_eq!(file.filename, "Song.mp3");
        let log = fs::read_to_string(&invocation_log).unwrap();
        assert!(log.contains("--extract-audio"));
        assert!(log.contains("128K"));
        assert!(scratch_is_empty(scratch.path()));
    }
}
