//! Format-selection and fallback policy.
//!
//! Given a caller-selected quality preset and (optionally) the encoded
//! streams yt-dlp reported for a video, this module produces the ordered
//! fallback chain handed to the extraction tool and classifies the likely
//! payload as buffer-then-send or stream-as-generated. The ladders are
//! deliberately conservative: the ceilings were tuned against the request
//! budget of the HTTP backend, and raising them re-introduces timeouts on
//! slow links.

use serde::{Deserialize, Serialize};

use crate::error::DownloadError;

/// Payloads whose largest known rendition exceeds this are streamed instead
/// of buffered through a scratch file.
pub const STREAM_THRESHOLD_BYTES: i64 = 100 * 1024 * 1024;

/// One encoded rendition of a source video, as reported by the metadata
/// extractor. Request-scoped: fetched per request and discarded with the
/// response, never cached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub format_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fps: Option<f64>,
    pub ext: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_bytes: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_codec: Option<String>,
}

impl StreamDescriptor {
    /// Whether the rendition carries a video track. yt-dlp reports audio-only
    /// streams with `vcodec: "none"`.
    pub fn has_video(&self) -> bool {
        self.video_codec
            .as_deref()
            .is_some_and(|codec| !codec.eq_ignore_ascii_case("none"))
    }

    /// Known size in mebibytes, rounded to two decimals.
    pub fn megabytes(&self) -> Option<f64> {
        self.estimated_bytes
            .filter(|bytes| *bytes > 0)
            .map(|bytes| (bytes as f64 / 1_048_576.0 * 100.0).round() / 100.0)
    }
}

/// Caller-selectable quality/reliability tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QualityPreset {
    Best,
    SlowConnection,
    UltraReliable,
    Explicit(String),
}

impl QualityPreset {
    /// Maps the `format_id` query value onto a preset. Anything that is not
    /// a known tag is treated as an explicit yt-dlp format identifier.
    pub fn parse(tag: &str) -> Self {
        match tag {
            "best" => QualityPreset::Best,
            "slow_connection" => QualityPreset::SlowConnection,
            "ultra_reliable" => QualityPreset::UltraReliable,
            other => QualityPreset::Explicit(other.to_owned()),
        }
    }

    /// Height ceiling of the preset's opening constraint, used when picking
    /// the filesize-estimate candidate from known streams.
    fn opening_height_ceiling(&self) -> i64 {
        match self {
            QualityPreset::Best | QualityPreset::Explicit(_) => 720,
            QualityPreset::SlowConnection => 480,
            QualityPreset::UltraReliable => 360,
        }
    }
}

/// A single rung of a fallback chain: an optional explicit format match plus
/// optional height and size ceilings. All fields `None` means "worst
/// available", which the extraction tool can always satisfy.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FormatConstraint {
    pub explicit_format: Option<String>,
    pub max_height: Option<u32>,
    pub max_megabytes: Option<u32>,
}

impl FormatConstraint {
    fn capped(max_height: u32, max_megabytes: u32) -> Self {
        Self {
            explicit_format: None,
            max_height: Some(max_height),
            max_megabytes: Some(max_megabytes),
        }
    }

    fn height_only(max_height: u32) -> Self {
        Self {
            explicit_format: None,
            max_height: Some(max_height),
            max_megabytes: None,
        }
    }

    fn worst() -> Self {
        Self::default()
    }

    pub fn is_unconstrained(&self) -> bool {
        self.explicit_format.is_none()
            && self.max_height.is_none()
            && self.max_megabytes.is_none()
    }

    /// Renders the constraint in yt-dlp's format-selection syntax, e.g.
    /// `best[height<=720][filesize<200M]` or bare `worst` for the terminal
    /// safety net.
    pub fn selector(&self) -> String {
        let base = match &self.explicit_format {
            Some(id) => id.as_str(),
            None if self.is_unconstrained() => "worst",
            None => "best",
        };

        let mut selector = base.to_owned();
        if let Some(height) = self.max_height {
            selector.push_str(&format!("[height<={height}]"));
        }
        if let Some(megabytes) = self.max_megabytes {
            selector.push_str(&format!("[filesize<{megabytes}M]"));
        }
        selector
    }
}

/// Ordered sequence of constraints evaluated first-to-last by the extraction
/// tool's own fallback matching. Never empty; the last element is always the
/// unconstrained "worst", so resolution cannot fail for lack of a match.
#[derive(Debug, Clone)]
pub struct FallbackChain(Vec<FormatConstraint>);

impl FallbackChain {
    pub fn constraints(&self) -> &[FormatConstraint] {
        &self.0
    }

    /// The least-constrained rung, used for the single retry after an
    /// empty-output extraction.
    pub fn terminal(&self) -> &FormatConstraint {
        // Invariant: the chain is constructed non-empty.
        self.0.last().unwrap_or(&TERMINAL)
    }

    /// Joins every rung with `/` so one yt-dlp invocation walks the whole
    /// chain internally.
    pub fn selector(&self) -> String {
        self.0
            .iter()
            .map(FormatConstraint::selector)
            .collect::<Vec<_>>()
            .join("/")
    }
}

static TERMINAL: FormatConstraint = FormatConstraint {
    explicit_format: None,
    max_height: None,
    max_megabytes: None,
};

/// How the resolved payload should travel to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPlan {
    /// Write to a scratch file under a hard timeout, then send whole.
    Buffered,
    /// Forward bytes from the extraction process as they are produced.
    Streamed,
}

/// Builds the fallback chain for a preset.
///
/// The ladders degrade height and size together so that the probability of
/// blowing the request budget shrinks at each rung, and every chain ends in
/// the unconstrained safety net.
pub fn resolve(preset: &QualityPreset) -> FallbackChain {
    let mut rungs = match preset {
        QualityPreset::Best => best_ladder(),
        QualityPreset::SlowConnection => vec![
            FormatConstraint::capped(480, 80),
            FormatConstraint::capped(360, 40),
            FormatConstraint::height_only(240),
        ],
        QualityPreset::UltraReliable => vec![FormatConstraint::capped(360, 30)],
        QualityPreset::Explicit(id) => {
            // The user's pick is attempted first but still rides under the
            // platform's height/size budget, then degrades through the
            // generic ladder.
            let mut rungs = vec![FormatConstraint {
                explicit_format: Some(id.clone()),
                max_height: Some(720),
                max_megabytes: Some(200),
            }];
            rungs.extend(best_ladder());
            rungs
        }
    };

    rungs.push(FormatConstraint::worst());
    FallbackChain(rungs)
}

fn best_ladder() -> Vec<FormatConstraint> {
    vec![
        FormatConstraint::capped(720, 200),
        FormatConstraint::capped(480, 100),
        FormatConstraint::capped(360, 50),
    ]
}

/// Streams that can actually be shown to the user as download choices:
/// carrying a video track and a known height, sorted best-first.
pub fn video_candidates(streams: &[StreamDescriptor]) -> Vec<&StreamDescriptor> {
    let mut candidates: Vec<&StreamDescriptor> = streams
        .iter()
        .filter(|stream| stream.has_video() && stream.height.is_some())
        .collect();
    candidates.sort_by(|a, b| b.height.cmp(&a.height));
    candidates
}

/// Picks the rendition whose filesize estimate is shown before the caller
/// commits to a download: the tallest stream at or under the preset's
/// opening ceiling, or the smallest stream when everything is above it.
pub fn recommend<'a>(
    preset: &QualityPreset,
    streams: &'a [StreamDescriptor],
) -> Result<&'a StreamDescriptor, DownloadError> {
    let candidates = video_candidates(streams);
    let ceiling = preset.opening_height_ceiling();

    candidates
        .iter()
        .find(|stream| stream.height.is_some_and(|height| height <= ceiling))
        .or_else(|| candidates.last())
        .copied()
        .ok_or(DownloadError::NoFormatsAvailable)
}

/// Classifies the download by the largest known rendition. Unknown sizes
/// stay buffered: that path is the one carrying a wall-clock budget.
pub fn classify(streams: &[StreamDescriptor]) -> DeliveryPlan {
    let largest = streams
        .iter()
        .filter(|stream| stream.has_video())
        .filter_map(|stream| stream.estimated_bytes)
        .filter(|bytes| *bytes > 0)
        .max();

    match largest {
        Some(bytes) if bytes > STREAM_THRESHOLD_BYTES => DeliveryPlan::Streamed,
        _ => DeliveryPlan::Buffered,
    }
}

/// Bitrate ladder for `/download_audio`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioTier {
    Best,
    Good,
    Medium,
}

impl AudioTier {
    pub fn parse(tag: &str) -> Self {
        match tag {
            "good" => AudioTier::Good,
            "medium" => AudioTier::Medium,
            _ => AudioTier::Best,
        }
    }

    pub fn bitrate_kbps(&self) -> u32 {
        match self {
            AudioTier::Best => 192,
            AudioTier::Good => 128,
            AudioTier::Medium => 96,
        }
    }
}
