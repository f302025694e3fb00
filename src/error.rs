//! Error taxonomy shared by the library and the HTTP backend.
//!
//! Every public entry point converts one of these variants into the JSON
//! shape `{error, suggestion?}` at its boundary; nothing else is allowed to
//! leak to a client except mid-stream transport errors, where the response
//! headers have already been committed.

use thiserror::Error;

/// Failure classification for everything between URL intake and the final
/// byte handed to the client.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Missing or malformed caller input (bad URL, empty form field).
    #[error("{0}")]
    InvalidInput(String),

    /// The video exists as a URL but cannot be fetched (private, deleted,
    /// region-locked).
    #[error("{0}")]
    NotFound(String),

    /// The external extraction call exceeded its wall-clock budget.
    #[error("extraction timeout after {0}s")]
    Timeout(u64),

    /// yt-dlp exited non-zero for a non-timeout reason, or produced no
    /// usable output file.
    #[error("{0}")]
    ExtractionFailed(String),

    /// The metadata extractor reported zero encoded formats for the video.
    #[error("no downloadable formats reported for this video")]
    NoFormatsAvailable,

    /// Filesystem trouble while staging or reading scratch files.
    #[error("unexpected I/O failure: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else. Callers map this to HTTP 500.
    #[error("{0}")]
    Unexpected(String),
}

impl DownloadError {
    /// Actionable hint surfaced alongside the error message, when one exists.
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            DownloadError::Timeout(_) => {
                Some("Try a smaller video or a lower quality preset.")
            }
            DownloadError::ExtractionFailed(_) => {
                Some("Try a smaller video or different quality.")
            }
            DownloadError::NoFormatsAvailable => Some("Try a different video URL."),
            DownloadError::NotFound(_) => {
                Some("The video may be private or deleted.")
            }
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, DownloadError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_mentions_timeout() {
        let err = DownloadError::Timeout(28);
        assert!(err.to_string().contains("timeout"));
        assert!(err.to_string().contains("28"));
    }

    #[test]
    fn suggestions_cover_recoverable_variants() {
        assert!(DownloadError::Timeout(8).suggestion().is_some());
        assert!(
            DownloadError::ExtractionFailed("empty output".into())
                .suggestion()
                .is_some()
        );
        assert!(
            DownloadError::InvalidInput("Invalid YouTube URL".into())
                .suggestion()
                .is_none()
        );
    }
}
