use anyhow::{Context, Result};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/grabtube-env";
pub const DEFAULT_GRABTUBE_PORT: u16 = 8080;
pub const DEFAULT_GRABTUBE_HOST: &str = "0.0.0.0";
pub const DEFAULT_YTDLP_BIN: &str = "yt-dlp";
pub const DEFAULT_SCRATCH_DIR: &str = "/tmp/grabtube";
pub const DEFAULT_BUFFER_TIMEOUT_SECS: u64 = 28;
pub const DEFAULT_RETRY_TIMEOUT_SECS: u64 = 8;

#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    pub ytdlp_bin: Option<PathBuf>,
    pub scratch_dir: Option<PathBuf>,
    pub grabtube_host: Option<String>,
    pub grabtube_port: Option<u16>,
    pub buffer_timeout_secs: Option<u64>,
    pub retry_timeout_secs: Option<u64>,
}

/// Fully resolved runtime settings, defaults filled in.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub ytdlp_bin: PathBuf,
    pub scratch_dir: PathBuf,
    pub grabtube_host: String,
    pub grabtube_port: u16,
    pub buffer_timeout: Duration,
    pub retry_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            ytdlp_bin: PathBuf::from(DEFAULT_YTDLP_BIN),
            scratch_dir: PathBuf::from(DEFAULT_SCRATCH_DIR),
            grabtube_host: DEFAULT_GRABTUBE_HOST.to_string(),
            grabtube_port: DEFAULT_GRABTUBE_PORT,
            buffer_timeout: Duration::from_secs(DEFAULT_BUFFER_TIMEOUT_SECS),
            retry_timeout: Duration::from_secs(DEFAULT_RETRY_TIMEOUT_SECS),
        }
    }
}

pub fn read_env_config(path: &Path) -> Result<Option<EnvConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    let mut cfg = EnvConfig::default();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if let Some((key, value_raw)) = trimmed.split_once('=') {
            let value = value_raw.trim().trim_matches('"');
            match key {
                "YTDLP_BIN" => {
                    if !value.is_empty() {
                        cfg.ytdlp_bin = Some(PathBuf::from(value));
                    }
                }
                "SCRATCH_DIR" => {
                    if !value.is_empty() {
                        cfg.scratch_dir = Some(PathBuf::from(value));
                    }
                }
                "GRABTUBE_HOST" => {
                    if !value.is_empty() {
                        cfg.grabtube_host = Some(value.to_string());
                    }
                }
                "GRABTUBE_PORT" => {
                    let port: u16 = value.parse().with_context(|| {
                        format!("Parsing GRABTUBE_PORT from {}", path.display())
                    })?;
                    cfg.grabtube_port = Some(port);
                }
                "BUFFER_TIMEOUT_SECS" => {
                    let secs: u64 = value.parse().with_context(|| {
                        format!("Parsing BUFFER_TIMEOUT_SECS from {}", path.display())
                    })?;
                    cfg.buffer_timeout_secs = Some(secs);
                }
                "RETRY_TIMEOUT_SECS" => {
                    let secs: u64 = value.parse().with_context(|| {
                        format!("Parsing RETRY_TIMEOUT_SECS from {}", path.display())
                    })?;
                    cfg.retry_timeout_secs = Some(secs);
                }
                _ => {}
            }
        }
    }
    Ok(Some(cfg))
}

pub fn load_runtime_config() -> Result<RuntimeConfig> {
    load_runtime_config_from(Path::new(DEFAULT_CONFIG_PATH))
}

/// A missing config file is not an error: the server must boot on a bare
/// host with nothing but yt-dlp on PATH.
pub fn load_runtime_config_from(path: impl AsRef<Path>) -> Result<RuntimeConfig> {
    let path = path.as_ref();
    let cfg = read_env_config(path)?.unwrap_or_default();
    let defaults = RuntimeConfig::default();

    Ok(RuntimeConfig {
        ytdlp_bin: cfg.ytdlp_bin.unwrap_or(defaults.ytdlp_bin),
        scratch_dir: cfg.scratch_dir.unwrap_or(defaults.scratch_dir),
        grabtube_host: cfg.grabtube_host.unwrap_or(defaults.grabtube_host),
        grabtube_port: cfg.grabtube_port.unwrap_or(defaults.grabtube_port),
        buffer_timeout: cfg
            .buffer_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.buffer_timeout),
        retry_timeout: cfg
            .retry_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.retry_timeout),
    })
}
