//! YouTube URL handling: validation, video-id extraction, and thumbnail URL
//! construction. The accepted URL shapes mirror what the frontend lets users
//! paste: `watch?v=`, `youtu.be/`, `/embed/`, and `/v/` links.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

static YOUTUBE_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(https?://)?(www\.)?(youtube|youtu|youtube-nocookie)\.(com|be)/(watch\?v=|embed/|v/|.+\?v=)?([^&=%?]{11})",
    )
    .expect("YouTube URL pattern is valid")
});

pub fn is_valid_youtube_url(url: &str) -> bool {
    YOUTUBE_URL.is_match(url)
}

/// Pulls the 11-character video id out of any supported URL shape.
pub fn extract_video_id(url: &str) -> Option<String> {
    if let Some(pos) = url.find("youtu.be/") {
        return take_id(&url[pos + "youtu.be/".len()..]);
    }

    if let Some(pos) = url.find("v=") {
        return take_id(&url[pos + 2..]);
    }

    for marker in ["/embed/", "/v/"] {
        if let Some(pos) = url.find(marker) {
            return take_id(&url[pos + marker.len()..]);
        }
    }

    None
}

fn take_id(tail: &str) -> Option<String> {
    let id: String = tail
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .take(11)
        .collect();
    (id.len() == 11).then_some(id)
}

pub fn watch_url(video_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={video_id}")
}

/// Thumbnail resolutions published by img.youtube.com, from smallest to
/// largest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThumbnailQuality {
    Default,
    Medium,
    High,
    Standard,
    Maxres,
}

impl ThumbnailQuality {
    /// Unknown tags fall back to `High`, the densest variant guaranteed to
    /// exist for every video.
    pub fn parse(tag: &str) -> Self {
        match tag {
            "default" => ThumbnailQuality::Default,
            "medium" => ThumbnailQuality::Medium,
            "standard" => ThumbnailQuality::Standard,
            "maxres" => ThumbnailQuality::Maxres,
            _ => ThumbnailQuality::High,
        }
    }

    /// File-name slug used on img.youtube.com.
    pub fn slug(&self) -> &'static str {
        match self {
            ThumbnailQuality::Default => "default",
            ThumbnailQuality::Medium => "mqdefault",
            ThumbnailQuality::High => "hqdefault",
            ThumbnailQuality::Standard => "sddefault",
            ThumbnailQuality::Maxres => "maxresdefault",
        }
    }
}

pub fn thumbnail_url(video_id: &str, quality: ThumbnailQuality) -> String {
    format!(
        "https://img.youtube.com/vi/{video_id}/{}.jpg",
        quality.slug()
    )
}

/// The full thumbnail ladder returned by `/get_video_info`.
#[derive(Debug, Clone, Serialize)]
pub struct ThumbnailSet {
    pub default: String,
    pub medium: String,
    pub high: String,
    pub standard: String,
    pub maxres: String,
}

impl ThumbnailSet {
    pub fn for_video(video_id: &str) -> Self {
        Self {
            default: thumbnail_url(video_id, ThumbnailQuality::Default),
            medium: thumbnail_url(video_id, ThumbnailQuality::Medium),
            high: thumbnail_url(video_id, ThumbnailQuality::High),
            standard: thumbnail_url(video_id, ThumbnailQuality::Standard),
            maxres: thumbnail_url(video_id, ThumbnailQuality::Maxres),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_the_usual_url_shapes() {
        assert!(is_valid_youtube_url(
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ"
        ));
        assert!(is_valid_youtube_url("http://youtu.be/dQw4w9WgXcQ"));
        assert!(is_valid_youtube_url("youtube.com/watch?v=dQw4w9WgXcQ"));
        assert!(is_valid_youtube_url(
            "https://www.youtube-nocookie.com/embed/dQw4w9WgXcQ"
        ));
    }

    #[test]
    fn rejects_garbage() {
        assert!(!is_valid_youtube_url("not a url"));
        assert!(!is_valid_youtube_url("https://example.com/watch?v=abc"));
        assert!(!is_valid_youtube_url(""));
    }

    #[test]
    fn extracts_ids_from_every_shape() {
        let id = Some("dQw4w9WgXcQ".to_owned());
        assert_eq!(
            extract_video_id("https://www.youtube.com/watch?v=dQw4w9WgXcQ"),
            id
        );
        assert_eq!(extract_video_id("https://youtu.be/dQw4w9WgXcQ?t=42"), id);
        assert_eq!(
            extract_video_id("https://www.youtube.com/embed/dQw4w9WgXcQ"),
            id
        );
        assert_eq!(extract_video_id("https://www.youtube.com/v/dQw4w9WgXcQ"), id);
        assert_eq!(extract_video_id("https://www.youtube.com/"), None);
    }

    #[test]
    fn thumbnail_slugs_follow_the_img_youtube_names() {
        assert_eq!(ThumbnailQuality::parse("maxres").slug(), "maxresdefault");
        assert_eq!(ThumbnailQuality::parse("medium").slug(), "mqdefault");
        assert_eq!(ThumbnailQuality::parse("bogus").slug(), "hqdefault");
        assert_eq!(
            thumbnail_url("abc123def45", ThumbnailQuality::Standard),
            "https://img.youtube.com/vi/abc123def45/sddefault.jpg"
        );
    }
}
