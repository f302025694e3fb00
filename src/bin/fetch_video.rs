//! Command-line helper that downloads a single video (or its audio track)
//! using the same fallback policy as the HTTP backend. Handy for operating
//! the pipeline on a box without the web frontend.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use grabtube_tools::{
    config,
    delivery::{DeliveryOutcome, Dispatcher},
    formats::{self, AudioTier, DeliveryPlan, QualityPreset},
    youtube,
    ytdlp::{MetadataProvider, YtDlp},
};

#[derive(Parser)]
#[command(
    name = "fetch_video",
    about = "Download a single YouTube video with the GrabTube fallback policy"
)]
struct Cli {
    /// Video URL (youtube.com or youtu.be)
    url: String,

    /// Quality preset: best, slow_connection, ultra_reliable, or an explicit
    /// yt-dlp format id
    #[arg(long, default_value = "best")]
    preset: String,

    /// Extract the audio track as mp3 instead of downloading video
    #[arg(long)]
    audio: bool,

    /// Audio tier when --audio is set: best, good, medium
    #[arg(long, default_value = "best")]
    audio_tier: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    if !youtube::is_valid_youtube_url(&cli.url) {
        bail!("not a valid YouTube URL: {}", cli.url);
    }

    let config = config::load_runtime_config()?;
    let ytdlp = Arc::new(YtDlp::new(config.ytdlp_bin.clone()));
    ytdlp
        .ensure_available()
        .await
        .context("checking yt-dlp availability")?;

    println!("===================================");
    println!("GrabTube Video Fetcher");
    println!("===================================");
    println!("URL: {}", cli.url);
    println!();

    let metadata = ytdlp.fetch(&cli.url).await?;
    println!("Title: {}", metadata.title);
    if let Some(author) = &metadata.author {
        println!("Author: {}", author);
    }
    if let Some(duration) = &metadata.duration_text {
        println!("Duration: {}", duration);
    }
    println!();

    let dispatcher = Dispatcher::new(
        ytdlp.clone(),
        config.scratch_dir.clone(),
        config.buffer_timeout,
        config.retry_timeout,
    );

    let filename = if cli.audio {
        let tier = AudioTier::parse(&cli.audio_tier);
        println!("Extracting audio at {} kbps...", tier.bitrate_kbps());
        let file = dispatcher
            .dispatch_audio(tier, &cli.url, &metadata.title)
            .await?;
        write_output(&file.filename, &file.bytes)?
    } else {
        let preset = QualityPreset::parse(&cli.preset);
        let chain = formats::resolve(&preset);
        let recommended = formats::recommend(&preset, &metadata.streams)?;
        match recommended.megabytes() {
            Some(megabytes) => println!(
                "Selected candidate: {} ({}p, ~{} MB)",
                recommended.format_id,
                recommended.height.unwrap_or_default(),
                megabytes
            ),
            None => println!(
                "Selected candidate: {} ({}p, unknown size)",
                recommended.format_id,
                recommended.height.unwrap_or_default()
            ),
        }
        println!("Downloading with selector: {}", chain.selector());

        // The CLI always buffers: the result lands in the working directory.
        let outcome = dispatcher
            .dispatch(
                &chain,
                &cli.url,
                &metadata.title,
                &recommended.ext,
                DeliveryPlan::Buffered,
            )
            .await?;
        match outcome {
            DeliveryOutcome::Buffered(file) => write_output(&file.filename, &file.bytes)?,
            DeliveryOutcome::Streamed { .. } => {
                bail!("buffered dispatch unexpectedly produced a stream")
            }
        }
    };

    println!();
    println!("===================================");
    println!("Download complete!");
    println!("===================================");
    println!("Saved: {}", filename);

    Ok(())
}

fn write_output(filename: &str, bytes: &[u8]) -> Result<String> {
    std::fs::write(filename, bytes).with_context(|| format!("writing {}", filename))?;
    Ok(filename.to_owned())
}
