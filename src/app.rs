use std::{collections::HashSet, sync::Arc};

use axum::{
    Json, Router,
    http::{
        HeaderValue, Method,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH},
    },
    response::Html,
    routing::{get, post},
};
use serde::Deserialize;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info};
use url::Url;

use crate::{
    config::{AppConfig, non_empty},
    download,
    error::ApiError,
    info, preview,
    tool::MediaTool,
    url_policy::is_allowed_url,
};

const INDEX_HTML: &str = include_str!("../assets/index.html");

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub tool: Arc<dyn MediaTool>,
}

impl AppState {
    pub fn new(config: AppConfig, tool: Arc<dyn MediaTool>) -> Self {
        Self {
            config: Arc::new(config),
            tool,
        }
    }

    /// Rejects the request before anything is spawned when the URL is absent
    /// or not on the allow-list.
    pub(crate) fn require_allowed_url(&self, url: Option<String>) -> Result<String, ApiError> {
        let url = url
            .as_deref()
            .and_then(non_empty)
            .ok_or_else(|| ApiError::bad_request("Missing url"))?;

        if !is_allowed_url(url, &self.config.allowed_hosts) {
            debug!("Rejected URL {:?}", url);
            return Err(ApiError::bad_request("URL not allowed or invalid"));
        }

        Ok(url.to_string())
    }
}

/// `{url}` as sent in JSON bodies and query strings.
#[derive(Debug, Default, Deserialize)]
pub struct UrlPayload {
    #[serde(default)]
    pub url: Option<String>,
}

/// Reads `{url}` from a JSON body regardless of the declared content type.
/// Anything unreadable counts as a missing URL.
pub(crate) fn url_from_json_body(body: &[u8]) -> Option<String> {
    serde_json::from_slice::<UrlPayload>(body)
        .ok()
        .and_then(|payload| payload.url)
}

pub fn router(state: AppState) -> Result<Router, ApiError> {
    let cors = build_cors_layer(&state.config.allowed_origins)?;

    // `get` also answers HEAD, which would run the whole tool pipeline.
    Ok(Router::new()
        .route("/", get(index))
        .route("/api/health", get(health))
        .route(
            "/api/info",
            post(info::fetch_info).fallback(method_not_allowed),
        )
        .route(
            "/api/download",
            get(download::download_from_query)
                .post(download::download_from_body)
                .head(method_not_allowed)
                .fallback(method_not_allowed),
        )
        .route(
            "/api/preview",
            get(preview::stream_preview)
                .head(method_not_allowed)
                .fallback(method_not_allowed),
        )
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http()))
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn method_not_allowed() -> ApiError {
    ApiError::method_not_allowed()
}

fn build_cors_layer(origins: &[String]) -> Result<CorsLayer, ApiError> {
    let normalized_origins = origins
        .iter()
        .map(|origin| {
            normalize_origin(origin).ok_or_else(|| {
                ApiError::internal(format!(
                    "Invalid origin in ALLOWED_ORIGINS: {origin}. Use values like https://example.com"
                ))
            })
        })
        .collect::<Result<HashSet<_>, _>>()?;
    let allowed_origins = Arc::new(normalized_origins);
    let allow_origin = AllowOrigin::predicate({
        let allowed_origins = Arc::clone(&allowed_origins);
        move |origin: &HeaderValue, _| {
            let normalized = origin.to_str().ok().and_then(normalize_origin);
            let allowed = normalized
                .as_ref()
                .is_some_and(|value| allowed_origins.contains(value));
            debug!(
                "CORS origin check raw={:?} normalized={:?} allowed={}",
                origin, normalized, allowed
            );
            allowed
        }
    });
    info!(
        "CORS allow-list loaded with {} origin(s): {:?}",
        allowed_origins.len(),
        allowed_origins.iter().collect::<Vec<_>>()
    );

    Ok(CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
        .expose_headers([CONTENT_DISPOSITION, CONTENT_LENGTH]))
}

fn normalize_origin(value: &str) -> Option<String> {
    let parsed = Url::parse(value).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let scheme = parsed.scheme();
    let default_port = match scheme {
        "http" => 80,
        "https" => 443,
        _ => return None,
    };

    if parsed.path() != "/" || parsed.query().is_some() || parsed.fragment().is_some() {
        return None;
    }

    match parsed.port() {
        Some(port) if port != default_port => Some(format!("{scheme}://{host}:{port}")),
        _ => Some(format!("{scheme}://{host}")),
    }
}
