use std::sync::Arc;

use tokio::{net::TcpListener, signal};
use tracing::{info, warn};
use vidrelay::{
    app::{AppState, router},
    config::AppConfig,
    error::ApiError,
    job_dir::cleanup_stale_job_dirs,
    tool::YtDlp,
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "vidrelay=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let config = AppConfig::from_env()?;

    tokio::fs::create_dir_all(&config.temp_root)
        .await
        .map_err(|error| {
            ApiError::internal(format!(
                "Could not create temp root {:?}: {error}",
                config.temp_root
            ))
        })?;
    cleanup_stale_job_dirs(&config.temp_root, config.stale_job_seconds).await;

    if config.ffmpeg_location.is_none() {
        warn!("FFMPEG_LOCATION is not set. yt-dlp will look for ffmpeg on PATH.");
    }
    info!(
        "Using {} with {} allowed host(s)",
        config.ytdlp_bin.display(),
        config.allowed_hosts.len()
    );

    let tool = Arc::new(YtDlp::from_config(&config));
    let addr = config.bind_addr.clone();
    let app = router(AppState::new(config, tool))?;

    let listener = TcpListener::bind(&addr).await.map_err(|error| {
        ApiError::internal(format!("Could not bind {addr}: {error}"))
    })?;

    info!("Backend ready at http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|error| ApiError::internal(format!("HTTP server error: {error}")))
}

async fn shutdown_signal() {
    if let Err(error) = signal::ctrl_c().await {
        warn!("Failed to install Ctrl+C handler: {error}");
        std::future::pending::<()>().await;
    }
}
