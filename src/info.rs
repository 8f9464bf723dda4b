use axum::{Json, body::Bytes, extract::State};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    app::{AppState, url_from_json_body},
    config::non_empty,
    error::ApiError,
    tool::last_error_line,
    url_policy::Platform,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InfoResponse {
    pub title: String,
    pub uploader: String,
    pub thumbnail: String,
    pub duration: Option<f64>,
}

// Extractors disagree on field types, so a field of the wrong shape reads as
// absent instead of failing the whole document.
#[derive(Debug, Deserialize)]
struct YtDlpInfo {
    #[serde(default, deserialize_with = "lenient_string")]
    title: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    uploader: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    channel: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    thumbnail: Option<String>,
    #[serde(default, deserialize_with = "lenient_thumbnails")]
    thumbnails: Option<Vec<YtDlpThumbnail>>,
    #[serde(default, deserialize_with = "lenient_number")]
    duration: Option<f64>,
    #[serde(default, deserialize_with = "lenient_entries")]
    entries: Option<Vec<Option<YtDlpInfo>>>,
}

#[derive(Debug, Deserialize)]
struct YtDlpThumbnail {
    #[serde(default, deserialize_with = "lenient_string")]
    url: Option<String>,
}

fn lenient_string<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(text) => Some(text),
        _ => None,
    })
}

fn lenient_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
    Ok(Value::deserialize(deserializer)?.as_f64())
}

fn lenient_thumbnails<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Vec<YtDlpThumbnail>>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Array(items) => Some(
            items
                .into_iter()
                .filter_map(|item| serde_json::from_value(item).ok())
                .collect(),
        ),
        _ => None,
    })
}

fn lenient_entries<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Vec<Option<YtDlpInfo>>>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Array(items) => Some(
            items
                .into_iter()
                .map(|item| {
                    item.is_object()
                        .then(|| serde_json::from_value(item).ok())
                        .flatten()
                })
                .collect(),
        ),
        _ => None,
    })
}

/// `POST /api/info`
pub async fn fetch_info(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<InfoResponse>, ApiError> {
    let url = state.require_allowed_url(url_from_json_body(&body))?;
    info!(platform = %Platform::detect(&url), "Fetching info for {url}");

    let output = state.tool.dump_metadata(&url).await.map_err(|error| {
        warn!("yt-dlp -J could not run: {error}");
        ApiError::internal("Could not start yt-dlp")
    })?;

    if !output.exit.success() {
        warn!(
            "yt-dlp -J failed with {}: {}",
            output.exit,
            last_error_line(&output.stderr)
        );
        debug!("yt-dlp stderr: {}", String::from_utf8_lossy(&output.stderr));
        return Err(ApiError::internal("Failed to fetch info"));
    }

    parse_info(&output.stdout).map(Json).map_err(|error| {
        warn!("Could not parse yt-dlp info for {url}: {error}");
        ApiError::internal("Failed to parse info")
    })
}

/// Normalizes a `yt-dlp -J` document. Playlists contribute their first entry.
pub fn parse_info(stdout: &[u8]) -> Result<InfoResponse, serde_json::Error> {
    let document: Value = serde_json::from_slice(stdout)?;
    if !document.is_object() {
        return Err(serde::de::Error::custom("yt-dlp info is not a JSON object"));
    }
    let document: YtDlpInfo = serde_json::from_value(document)?;
    Ok(normalize(first_entry(document)))
}

fn first_entry(mut document: YtDlpInfo) -> YtDlpInfo {
    match document
        .entries
        .take()
        .and_then(|entries| entries.into_iter().next().flatten())
    {
        Some(entry) => entry,
        None => document,
    }
}

fn normalize(info: YtDlpInfo) -> InfoResponse {
    let uploader = info
        .uploader
        .as_deref()
        .and_then(non_empty)
        .or_else(|| info.channel.as_deref().and_then(non_empty))
        .unwrap_or_default()
        .to_string();
    let thumbnail = info
        .thumbnail
        .as_deref()
        .and_then(non_empty)
        .map(ToString::to_string)
        .or_else(|| {
            info.thumbnails
                .unwrap_or_default()
                .into_iter()
                .find_map(|thumbnail| thumbnail.url.filter(|url| !url.trim().is_empty()))
        })
        .unwrap_or_default();

    InfoResponse {
        title: info.title.unwrap_or_default(),
        uploader,
        thumbnail,
        duration: info
            .duration
            .filter(|seconds| seconds.is_finite() && *seconds > 0.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_document_is_used_directly() {
        let info = parse_info(
            br#"{"title":"Clip","uploader":"Someone","thumbnail":"https://i.ytimg.com/a.jpg","duration":42.5}"#,
        )
        .unwrap();
        assert_eq!(
            info,
            InfoResponse {
                title: "Clip".to_string(),
                uploader: "Someone".to_string(),
                thumbnail: "https://i.ytimg.com/a.jpg".to_string(),
                duration: Some(42.5),
            }
        );
    }

    #[test]
    fn playlist_uses_first_entry() {
        let info = parse_info(
            br#"{"title":"Playlist","entries":[{"title":"First","channel":"Chan"},{"title":"Second"}]}"#,
        )
        .unwrap();
        assert_eq!(info.title, "First");
        assert_eq!(info.uploader, "Chan");
    }

    #[test]
    fn empty_or_null_entries_fall_back_to_document() {
        let info = parse_info(br#"{"title":"Top","entries":[]}"#).unwrap();
        assert_eq!(info.title, "Top");

        let info = parse_info(br#"{"title":"Top","entries":[null]}"#).unwrap();
        assert_eq!(info.title, "Top");

        let info = parse_info(br#"{"title":"Top","entries":null}"#).unwrap();
        assert_eq!(info.title, "Top");
    }

    #[test]
    fn missing_fields_get_safe_defaults() {
        let info = parse_info(br#"{"id":"abc"}"#).unwrap();
        assert_eq!(info.title, "");
        assert_eq!(info.uploader, "");
        assert_eq!(info.thumbnail, "");
        assert_eq!(info.duration, None);

        let serialized = serde_json::to_value(&info).unwrap();
        assert_eq!(serialized["uploader"], "");
        assert!(serialized["duration"].is_null());
    }

    #[test]
    fn channel_and_thumbnail_list_are_fallbacks() {
        let info = parse_info(
            br#"{"title":"t","uploader":"","channel":"Chan","thumbnails":[{"id":"0"},{"url":"https://cdn/1.jpg"}],"duration":0}"#,
        )
        .unwrap();
        assert_eq!(info.uploader, "Chan");
        assert_eq!(info.thumbnail, "https://cdn/1.jpg");
        assert_eq!(info.duration, None);
    }

    #[test]
    fn unexpected_field_types_read_as_absent() {
        let info = parse_info(
            br#"{"title":12345,"uploader":{"name":"x"},"channel":"Chan","thumbnail":false,"thumbnails":[7,{"url":3},{"url":"https://cdn/2.jpg"}],"duration":"long"}"#,
        )
        .unwrap();
        assert_eq!(info.title, "");
        assert_eq!(info.uploader, "Chan");
        assert_eq!(info.thumbnail, "https://cdn/2.jpg");
        assert_eq!(info.duration, None);

        let info = parse_info(br#"{"title":"Top","entries":"none"}"#).unwrap();
        assert_eq!(info.title, "Top");
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(parse_info(b"").is_err());
        assert!(parse_info(b"WARNING: not json").is_err());
        assert!(parse_info(b"[1,2,3]").is_err());
    }
}
