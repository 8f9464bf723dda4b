use std::path::{Path, PathBuf};

use axum::{
    body::{Body, Bytes},
    extract::{Query, State, rejection::QueryRejection},
    http::{
        HeaderMap, HeaderValue,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
};
use tokio_util::{io::ReaderStream, sync::CancellationToken};
use tracing::{info, warn};

use crate::{
    app::{AppState, UrlPayload, url_from_json_body},
    error::ApiError,
    job_dir::JobDir,
    stream::GuardedStream,
    tool::{OUTPUT_TEMPLATE, ToolError},
    url_policy::Platform,
};

const MEDIA_EXTENSIONS: [&str; 5] = ["mp4", "mkv", "webm", "mp3", "m4a"];
const MAX_FILENAME_CHARS: usize = 200;
const FALLBACK_FILENAME: &str = "download.bin";

/// `GET /api/download?url=...`
pub async fn download_from_query(
    State(state): State<AppState>,
    query: Result<Query<UrlPayload>, QueryRejection>,
) -> Result<Response, ApiError> {
    let url = query.ok().and_then(|Query(payload)| payload.url);
    download(state, url).await
}

/// `POST /api/download` with a `{url}` body.
pub async fn download_from_body(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, ApiError> {
    download(state, url_from_json_body(&body)).await
}

async fn download(state: AppState, url: Option<String>) -> Result<Response, ApiError> {
    let url = state.require_allowed_url(url)?;
    info!(platform = %Platform::detect(&url), "Downloading {url}");

    let job_dir = JobDir::create(&state.config.temp_root)
        .await
        .map_err(|error| {
            warn!("Could not create job directory: {error}");
            ApiError::internal("Could not prepare temporary download")
        })?;

    // Dropping this handler (client gone) cancels the token and kills yt-dlp;
    // `job_dir` is removed by its own Drop on the same path.
    let cancel = CancellationToken::new();
    let _cancel_on_drop = cancel.clone().drop_guard();

    let output_template = job_dir.path().join(OUTPUT_TEMPLATE);
    let exit = match state
        .tool
        .download_to(&url, &output_template, cancel.clone())
        .await
    {
        Ok(exit) => exit,
        Err(error) => {
            warn!("yt-dlp download could not run: {error}");
            job_dir.remove().await;
            return Err(match error {
                ToolError::Spawn { .. } => ApiError::internal("Could not start yt-dlp"),
                ToolError::Io(_) | ToolError::Cancelled => ApiError::internal("Download failed"),
            });
        }
    };

    if !exit.success() {
        job_dir.remove().await;
        return Err(ApiError::internal(format!("Download failed ({exit})")));
    }

    let media_path = match find_media_file(job_dir.path()).await {
        Ok(Some(path)) => path,
        Ok(None) => {
            warn!("yt-dlp exited cleanly but left no media file for {url}");
            job_dir.remove().await;
            return Err(ApiError::internal("File not found after download"));
        }
        Err(error) => {
            warn!("Could not scan job directory: {error}");
            job_dir.remove().await;
            return Err(ApiError::internal("Server error"));
        }
    };

    let opened = async {
        let file = tokio::fs::File::open(&media_path).await?;
        let metadata = file.metadata().await?;
        Ok::<_, std::io::Error>((file, metadata.len()))
    }
    .await;
    let (file, content_length) = match opened {
        Ok(opened) => opened,
        Err(error) => {
            warn!("Could not open downloaded file {:?}: {error}", media_path);
            job_dir.remove().await;
            return Err(ApiError::internal("Server error"));
        }
    };

    let filename = media_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| FALLBACK_FILENAME.to_string());

    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(CONTENT_LENGTH, HeaderValue::from(content_length));
    let disposition = match HeaderValue::from_str(&build_content_disposition(&filename)) {
        Ok(value) => value,
        Err(_) => {
            job_dir.remove().await;
            return Err(ApiError::internal("Could not build the download header."));
        }
    };
    headers.insert(CONTENT_DISPOSITION, disposition);

    info!("Streaming {filename:?} ({content_length} bytes)");
    let body = Body::from_stream(GuardedStream::new(ReaderStream::new(file), job_dir));
    Ok((headers, body).into_response())
}

/// First file in `dir` with a known media extension, by name order.
pub async fn find_media_file(dir: &Path) -> std::io::Result<Option<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut candidates = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_file() && has_media_extension(&path) {
            candidates.push(path);
        }
    }

    candidates.sort();
    Ok(candidates.into_iter().next())
}

fn has_media_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            MEDIA_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
}

fn build_content_disposition(filename: &str) -> String {
    let safe_ascii = sanitize_filename(filename);
    format!(
        "attachment; filename=\"{safe_ascii}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}

/// Replaces everything outside `[A-Za-z0-9 _.()-]` with `_` and caps the
/// result at 200 characters.
pub fn sanitize_filename(value: &str) -> String {
    let sanitized: String = value
        .chars()
        .map(|character| {
            if character.is_ascii_alphanumeric()
                || matches!(character, '.' | '-' | '_' | ' ' | '(' | ')')
            {
                character
            } else {
                '_'
            }
        })
        .take(MAX_FILENAME_CHARS)
        .collect();

    let compact = sanitized.trim();
    if compact.is_empty() {
        FALLBACK_FILENAME.to_string()
    } else {
        compact.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_unsafe_characters() {
        assert_eq!(
            sanitize_filename("Mi \"vídeo\" / #1 (final).mp4"),
            "Mi _v_deo_ _ _1 (final).mp4"
        );
        assert_eq!(sanitize_filename("plain_name-1.webm"), "plain_name-1.webm");
    }

    #[test]
    fn sanitize_caps_length() {
        let long = format!("{}.mp4", "a".repeat(300));
        let safe = sanitize_filename(&long);
        assert_eq!(safe.chars().count(), MAX_FILENAME_CHARS);
        assert!(safe.chars().all(|c| c == 'a'));
    }

    #[test]
    fn sanitize_never_returns_empty() {
        assert_eq!(sanitize_filename(""), FALLBACK_FILENAME);
        assert_eq!(sanitize_filename("   "), FALLBACK_FILENAME);
    }

    #[test]
    fn disposition_carries_both_names() {
        let header = build_content_disposition("Café \"live\".mp4");
        assert_eq!(
            header,
            "attachment; filename=\"Caf_ _live_.mp4\"; filename*=UTF-8''Caf%C3%A9%20%22live%22.mp4"
        );
        assert!(HeaderValue::from_str(&header).is_ok());
    }

    #[test]
    fn media_extensions_are_case_insensitive() {
        assert!(has_media_extension(Path::new("/tmp/a.MP4")));
        assert!(has_media_extension(Path::new("/tmp/a.m4a")));
        assert!(!has_media_extension(Path::new("/tmp/a.mp4.part")));
        assert!(!has_media_extension(Path::new("/tmp/a.json")));
        assert!(!has_media_extension(Path::new("/tmp/mp4")));
    }

    #[tokio::test]
    async fn finds_media_and_ignores_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("clip.mp4.part"), b"x").await.unwrap();
        tokio::fs::write(dir.path().join("clip.info.json"), b"{}").await.unwrap();
        tokio::fs::create_dir(dir.path().join("nested.mp4")).await.unwrap();
        assert_eq!(find_media_file(dir.path()).await.unwrap(), None);

        tokio::fs::write(dir.path().join("clip.mkv"), b"x").await.unwrap();
        assert_eq!(
            find_media_file(dir.path()).await.unwrap(),
            Some(dir.path().join("clip.mkv"))
        );
    }
}
