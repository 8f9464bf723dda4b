use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::ApiError;

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:4000";
pub const DEFAULT_YTDLP_BIN: &str = "yt-dlp";
pub const DEFAULT_STALE_JOB_SECONDS: u64 = 2 * 60 * 60;

pub const DEFAULT_ALLOWED_HOSTS: [&str; 7] = [
    "youtube.com",
    "youtu.be",
    "x.com",
    "twitter.com",
    "tiktok.com",
    "instagram.com",
    "instagr.am",
];

const DEFAULT_ALLOWED_ORIGINS: [&str; 2] = ["http://127.0.0.1:5173", "http://localhost:5173"];

/// Immutable runtime settings, built once at startup and shared through
/// `AppState`.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub ytdlp_bin: PathBuf,
    /// Directory handed to `--ffmpeg-location`.
    pub ffmpeg_location: Option<PathBuf>,
    pub allowed_hosts: Vec<String>,
    pub allowed_origins: Vec<String>,
    pub temp_root: PathBuf,
    pub stale_job_seconds: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            ytdlp_bin: PathBuf::from(DEFAULT_YTDLP_BIN),
            ffmpeg_location: None,
            allowed_hosts: DEFAULT_ALLOWED_HOSTS.map(ToString::to_string).to_vec(),
            allowed_origins: DEFAULT_ALLOWED_ORIGINS.map(ToString::to_string).to_vec(),
            temp_root: std::env::temp_dir().join("vidrelay"),
            stale_job_seconds: DEFAULT_STALE_JOB_SECONDS,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ApiError> {
        let defaults = Self::default();

        let ytdlp_bin = read_string_env("YTDLP_BIN")
            .map(PathBuf::from)
            .unwrap_or(defaults.ytdlp_bin);
        let ffmpeg_location = read_string_env("FFMPEG_LOCATION")
            .map(|value| ffmpeg_directory(Path::new(&value)));

        let allowed_hosts = read_list_env("ALLOWED_HOSTS")
            .map(|hosts| {
                hosts
                    .into_iter()
                    .map(|host| host.trim_start_matches("www.").to_ascii_lowercase())
                    .collect::<Vec<_>>()
            })
            .unwrap_or(defaults.allowed_hosts);
        if allowed_hosts.is_empty() {
            return Err(ApiError::internal("ALLOWED_HOSTS does not list any host."));
        }

        let allowed_origins = match read_list_env("ALLOWED_ORIGINS") {
            Some(origins) => origins,
            None => {
                warn!("ALLOWED_ORIGINS is not set. Falling back to development origins.");
                defaults.allowed_origins
            }
        };

        let temp_root = read_string_env("VIDRELAY_TMP_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.temp_root);
        let stale_job_seconds =
            read_u64_env("STALE_JOB_SECONDS").unwrap_or(defaults.stale_job_seconds);

        Ok(Self {
            bind_addr: resolve_bind_addr(),
            ytdlp_bin,
            ffmpeg_location,
            allowed_hosts,
            allowed_origins,
            temp_root,
            stale_job_seconds,
        })
    }
}

/// yt-dlp wants the folder that contains ffmpeg, not the binary itself.
fn ffmpeg_directory(location: &Path) -> PathBuf {
    if location.is_file() {
        location
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| location.to_path_buf())
    } else {
        location.to_path_buf()
    }
}

fn read_string_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
}

fn read_u64_env(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
}

fn read_list_env(name: &str) -> Option<Vec<String>> {
    let value = std::env::var(name).ok()?;
    let items = split_list(&value);
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn resolve_bind_addr() -> String {
    if let Some(configured) = read_string_env("APP_ADDR") {
        return configured;
    }

    if let Some(port) = std::env::var("PORT")
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
    {
        return format!("0.0.0.0:{port}");
    }

    DEFAULT_BIND_ADDR.to_string()
}

pub(crate) fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
