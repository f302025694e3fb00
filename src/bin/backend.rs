//! HTTP backend serving the GrabTube web frontend.
//!
//! Four routes: metadata lookup, thumbnail download, video download, and
//! audio extraction. Every handler converts `DownloadError` into the JSON
//! shape `{error, suggestion?}` at the boundary; only a failure in the
//! middle of a streamed body escapes as a transport error, because by then
//! the headers are already on the wire.

use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Body,
    extract::{Form, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use grabtube_tools::{
    config::{self, RuntimeConfig},
    delivery::{BufferedFile, DeliveryOutcome, Dispatcher},
    error::DownloadError,
    formats::{self, AudioTier, QualityPreset, StreamDescriptor},
    youtube::{self, ThumbnailQuality, ThumbnailSet},
    ytdlp::{MetadataProvider, VideoMetadata, YtDlp},
};
use serde::{Deserialize, Serialize};
use tokio::signal;
use tokio_util::io::ReaderStream;

#[derive(Clone)]
struct AppState {
    metadata: Arc<dyn MetadataProvider>,
    dispatcher: Arc<Dispatcher>,
    http: reqwest::Client,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
    suggestion: Option<String>,
}

impl ApiError {
    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
            suggestion: None,
        }
    }
}

impl From<DownloadError> for ApiError {
    fn from(err: DownloadError) -> Self {
        let status = match &err {
            DownloadError::InvalidInput(_)
            | DownloadError::ExtractionFailed(_)
            | DownloadError::NoFormatsAvailable => StatusCode::BAD_REQUEST,
            DownloadError::NotFound(_) => StatusCode::NOT_FOUND,
            DownloadError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            DownloadError::Io(_) | DownloadError::Unexpected(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        Self {
            status,
            message: err.to_string(),
            suggestion: err.suggestion().map(str::to_owned),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = serde_json::json!({
            "error": self.message,
        });
        if let Some(suggestion) = self.suggestion {
            body["suggestion"] = serde_json::Value::String(suggestion);
        }
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let config = config::load_runtime_config()?;
    let ytdlp = Arc::new(YtDlp::new(config.ytdlp_bin.clone()));
    ytdlp
        .ensure_available()
        .await
        .context("checking yt-dlp availability")?;

    let state = build_state(&config, ytdlp);

    let app = Router::new()
        .route("/get_video_info", post(get_video_info))
        .route("/download_thumbnail", get(download_thumbnail))
        .route("/download_video", get(download_video))
        .route("/download_audio", get(download_audio))
        .with_state(state);

    let addr = SocketAddr::new(
        config
            .grabtube_host
            .parse()
            .with_context(|| format!("parsing host {}", config.grabtube_host))?,
        config.grabtube_port,
    );
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    log::info!("backend listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running backend")?;

    Ok(())
}

fn build_state(config: &RuntimeConfig, ytdlp: Arc<YtDlp>) -> AppState {
    let dispatcher = Arc::new(Dispatcher::new(
        ytdlp.clone(),
        config.scratch_dir.clone(),
        config.buffer_timeout,
        config.retry_timeout,
    ));

    AppState {
        metadata: ytdlp,
        dispatcher,
        http: reqwest::Client::new(),
    }
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        log::error!("failed to install Ctrl+C handler: {}", err);
    }
}

#[derive(Deserialize)]
struct InfoRequest {
    #[serde(default)]
    url: String,
}

#[derive(Serialize)]
struct VideoInfoResponse {
    video_info: VideoInfoPayload,
}

#[derive(Serialize)]
struct VideoInfoPayload {
    title: String,
    author: Option<String>,
    duration_str: Option<String>,
    views: Option<i64>,
    publish_date: Option<String>,
    description: String,
    thumbnails: ThumbnailSet,
    video_streams: Vec<StreamOption>,
}

#[derive(Serialize)]
struct StreamOption {
    format_id: String,
    resolution: Option<String>,
    fps: Option<f64>,
    filesize: Option<i64>,
    filesize_mb: Option<f64>,
    ext: String,
    recommended: bool,
}

async fn get_video_info(
    State(state): State<AppState>,
    Form(request): Form<InfoRequest>,
) -> ApiResult<Json<VideoInfoResponse>> {
    let url = request.url.trim();
    let video_id = validated_video_id(url)?;

    let metadata = state.metadata.fetch(url).await?;

    Ok(Json(VideoInfoResponse {
        video_info: VideoInfoPayload {
            thumbnails: ThumbnailSet::for_video(&video_id),
            video_streams: build_stream_options(&metadata),
            title: metadata.title,
            author: metadata.author,
            duration_str: metadata.duration_text,
            views: metadata.views,
            publish_date: metadata.publish_date,
            description: metadata.description,
        },
    }))
}

/// The download choices shown to the user: best-first, with the resolver's
/// filesize-estimate candidate flagged as recommended.
fn build_stream_options(metadata: &VideoMetadata) -> Vec<StreamOption> {
    let recommended_id = formats::recommend(&QualityPreset::Best, &metadata.streams)
        .map(|stream| stream.format_id.clone())
        .ok();

    formats::video_candidates(&metadata.streams)
        .into_iter()
        .map(|stream| stream_option(stream, recommended_id.as_deref()))
        .collect()
}

fn stream_option(stream: &StreamDescriptor, recommended_id: Option<&str>) -> StreamOption {
    StreamOption {
        format_id: stream.format_id.clone(),
        resolution: stream.height.map(|height| format!("{height}p")),
        fps: stream.fps,
        filesize: stream.estimated_bytes.filter(|bytes| *bytes > 0),
        filesize_mb: stream.megabytes(),
        ext: stream.ext.clone(),
        recommended: recommended_id == Some(stream.format_id.as_str()),
    }
}

#[derive(Deserialize)]
struct ThumbnailRequest {
    #[serde(default)]
    url: String,
    #[serde(default)]
    quality: Option<String>,
}

async fn download_thumbnail(
    State(state): State<AppState>,
    Query(request): Query<ThumbnailRequest>,
) -> ApiResult<Response> {
    let video_id = validated_video_id(&request.url)?;
    let quality = ThumbnailQuality::parse(request.quality.as_deref().unwrap_or("high"));
    let image_url = youtube::thumbnail_url(&video_id, quality);

    let response = state
        .http
        .get(&image_url)
        .send()
        .await
        .map_err(|err| ApiError::internal(format!("thumbnail request failed: {err}")))?;

    if !response.status().is_success() {
        return Err(ApiError::internal("Failed to download thumbnail"));
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|err| ApiError::internal(format!("thumbnail read failed: {err}")))?;

    let filename = format!("{}_{}.jpg", video_id, quality.slug());
    Ok(attachment_response(bytes.to_vec(), &filename, "image/jpeg"))
}

#[derive(Deserialize)]
struct DownloadRequest {
    #[serde(default)]
    url: String,
    #[serde(default)]
    format_id: Option<String>,
}

async fn download_video(
    State(state): State<AppState>,
    Query(request): Query<DownloadRequest>,
) -> ApiResult<Response> {
    validated_video_id(&request.url)?;

    let preset = QualityPreset::parse(request.format_id.as_deref().unwrap_or("best"));
    let metadata = state.metadata.fetch(&request.url).await?;

    let recommended = formats::recommend(&preset, &metadata.streams)?;
    let ext_hint = recommended.ext.clone();
    let plan = formats::classify(&metadata.streams);
    let chain = formats::resolve(&preset);

    log::info!(
        "downloading {} as {:?} via {:?} delivery",
        metadata.video_id,
        preset,
        plan
    );

    let outcome = state
        .dispatcher
        .dispatch(&chain, &request.url, &metadata.title, &ext_hint, plan)
        .await?;

    match outcome {
        DeliveryOutcome::Buffered(file) => Ok(buffered_response(file)),
        DeliveryOutcome::Streamed {
            stream,
            filename,
            content_type,
        } => {
            let mut headers = HeaderMap::new();
            insert_attachment_headers(&mut headers, &filename, &content_type, None)?;
            let body = Body::from_stream(ReaderStream::new(stream));
            Ok((headers, body).into_response())
        }
    }
}

async fn download_audio(
    State(state): State<AppState>,
    Query(request): Query<DownloadRequest>,
) -> ApiResult<Response> {
    validated_video_id(&request.url)?;

    let tier = AudioTier::parse(request.format_id.as_deref().unwrap_or("best"));
    let metadata = state.metadata.fetch(&request.url).await?;

    log::info!(
        "extracting audio for {} at {} kbps",
        metadata.video_id,
        tier.bitrate_kbps()
    );

    let file = state
        .dispatcher
        .dispatch_audio(tier, &request.url, &metadata.title)
        .await?;

    Ok(buffered_response(file))
}

/// Validates the pasted URL and pulls the video id out of it. Anything that
/// does not look like a YouTube watch URL is rejected before we ever spawn a
/// process for it.
fn validated_video_id(url: &str) -> ApiResult<String> {
    if url.trim().is_empty() {
        return Err(DownloadError::InvalidInput("Please enter a YouTube URL".to_string()).into());
    }
    if !youtube::is_valid_youtube_url(url) {
        return Err(DownloadError::InvalidInput("Invalid YouTube URL".to_string()).into());
    }
    youtube::extract_video_id(url)
        .ok_or_else(|| DownloadError::InvalidInput("Invalid YouTube URL".to_string()).into())
}

fn buffered_response(file: BufferedFile) -> Response {
    attachment_response(file.bytes, &file.filename, &file.content_type)
}

fn attachment_response(bytes: Vec<u8>, filename: &str, content_type: &str) -> Response {
    let mut headers = HeaderMap::new();
    if let Err(err) =
        insert_attachment_headers(&mut headers, filename, content_type, Some(bytes.len()))
    {
        return err.into_response();
    }
    (headers, bytes).into_response()
}

fn insert_attachment_headers(
    headers: &mut HeaderMap,
    filename: &str,
    content_type: &str,
    content_length: Option<usize>,
) -> ApiResult<()> {
    headers.insert(
        header::CONTENT_TYPE,
        content_type
            .parse()
            .map_err(|_| ApiError::internal("invalid content type"))?,
    );
    headers.insert(
        header::CONTENT_DISPOSITION,
        format!("attachment; filename=\"{}\"", filename)
            .parse()
            .map_err(|_| ApiError::internal("invalid attachment filename"))?,
    );
    if let Some(length) = content_length {
        headers.insert(
            header::CONTENT_LENGTH,
            length
                .to_string()
                .parse()
                .map_err(|_| ApiError::internal("invalid content length"))?,
        );
    }
    Ok(())
}
