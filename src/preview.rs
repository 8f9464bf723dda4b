use axum::{
    body::Body,
    extract::{Query, State, rejection::QueryRejection},
    http::header::CONTENT_TYPE,
    response::{IntoResponse, Response},
};
use futures::{StreamExt, stream};
use tokio::sync::oneshot;
use tokio_util::{io::ReaderStream, sync::CancellationToken};
use tracing::{debug, info, warn};

use crate::{
    app::{AppState, UrlPayload},
    error::ApiError,
    stream::GuardedStream,
    tool::{MediaStream, ToolExit},
    url_policy::Platform,
};

const VIDEO_MP4: &str = "video/mp4";

/// `GET /api/preview?url=...`
///
/// Relays yt-dlp's stdout as it is produced. The status line is only
/// committed once the first chunk exists, so a run that fails before
/// producing anything still becomes a 500. After that, a failure just ends the
/// body early.
pub async fn stream_preview(
    State(state): State<AppState>,
    query: Result<Query<UrlPayload>, QueryRejection>,
) -> Result<Response, ApiError> {
    let url = state.require_allowed_url(query.ok().and_then(|Query(payload)| payload.url))?;
    info!(platform = %Platform::detect(&url), "Streaming preview for {url}");

    let cancel = CancellationToken::new();
    let kill_on_drop = cancel.clone().drop_guard();

    let MediaStream { output, exit } = state
        .tool
        .stream_to_stdout(&url, cancel)
        .await
        .map_err(|error| {
            warn!("yt-dlp preview could not run: {error}");
            preview_error("Could not start preview")
        })?;

    let mut chunks = ReaderStream::new(output);
    match chunks.next().await {
        Some(Ok(first)) => {
            tokio::spawn(log_exit(exit));
            let relayed = stream::iter([Ok::<_, std::io::Error>(first)]).chain(chunks);
            let body = Body::from_stream(GuardedStream::new(relayed, kill_on_drop));
            Ok(([(CONTENT_TYPE, VIDEO_MP4)], body).into_response())
        }
        Some(Err(error)) => {
            warn!("Could not read yt-dlp preview output: {error}");
            Err(preview_error("Preview failed"))
        }
        None => {
            let exit = exit.await.unwrap_or(ToolExit { code: None });
            if exit.success() {
                Ok(([(CONTENT_TYPE, VIDEO_MP4)], Body::empty()).into_response())
            } else {
                warn!("yt-dlp preview exited with {exit} before sending data");
                Err(preview_error(format!("Preview failed ({exit})")))
            }
        }
    }
}

fn preview_error(message: impl Into<String>) -> ApiError {
    ApiError::internal(message).with_content_type(VIDEO_MP4)
}

async fn log_exit(exit: oneshot::Receiver<ToolExit>) {
    match exit.await {
        Ok(exit) if exit.success() => debug!("Preview finished"),
        Ok(ToolExit { code: Some(code) }) => {
            warn!("yt-dlp preview failed mid-stream with code {code}; playback is truncated")
        }
        Ok(_) | Err(_) => debug!("Preview process ended without an exit code"),
    }
}
