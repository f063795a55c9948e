#![forbid(unsafe_code)]

//! HTTP surface of the video delivery service.
//!
//! Reads (`/stream`) go through the stream proxy and never start work.
//! Writes (`POST .../download`) go through the download coordinator, whose
//! progress can be followed over server-sent events.

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{Path as AxumPath, Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use clap::Parser;
use feeds_delivery::{
    cache::{CacheStore, spawn_janitor},
    config::{RuntimeOverrides, resolve_runtime_settings},
    coordinator::{DownloadCoordinator, DownloadJob, DownloadOutcome},
    error::{ApiError, ApiResult},
    proxy::StreamProxy,
    quality,
    ytdlp::{self, YtDlp},
};
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::signal;
use tracing_subscriber::EnvFilter;

/// Quality used by download endpoints when the caller does not pick one.
const DEFAULT_DOWNLOAD_QUALITY: &str = "720";
const MAX_VIDEO_ID_LEN: usize = 64;

/// Command line flags. Each one overrides the matching `FEEDS_*` variable.
#[derive(Debug, Parser)]
#[command(name = "backend", about = "Serves, downloads and caches videos")]
struct BackendArgs {
    /// Listen address (IPv4 or IPv6).
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    /// Directory holding finished downloads.
    #[arg(long)]
    cache_dir: Option<PathBuf>,
    /// Path to the yt-dlp executable.
    #[arg(long)]
    ytdlp: Option<PathBuf>,
    /// Netscape cookies file passed to yt-dlp when it exists.
    #[arg(long)]
    cookies: Option<PathBuf>,
    /// Maximum number of downloads running at once.
    #[arg(long)]
    max_downloads: Option<usize>,
    #[arg(long)]
    env_file: Option<PathBuf>,
}

impl BackendArgs {
    fn into_overrides(self) -> RuntimeOverrides {
        RuntimeOverrides {
            host: self.host,
            port: self.port,
            cache_dir: self.cache_dir,
            ytdlp_bin: self.ytdlp,
            cookies_path: self.cookies,
            max_downloads: self.max_downloads,
            env_path: self.env_file,
        }
    }
}

#[derive(Clone)]
struct AppState {
    coordinator: DownloadCoordinator,
    proxy: Arc<StreamProxy>,
    ytdlp: Arc<YtDlp>,
}

#[derive(Debug, Default, Deserialize)]
struct QualityQuery {
    quality: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DownloadResponse {
    status: &'static str,
    video_id: String,
    quality: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    size_bytes: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QualitiesResponse {
    video_id: String,
    qualities: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let settings = resolve_runtime_settings(BackendArgs::parse().into_overrides())?;

    let cache = Arc::new(
        CacheStore::open(&settings.cache_dir, settings.cache_ttl).with_context(|| {
            format!("preparing cache directory {}", settings.cache_dir.display())
        })?,
    );
    let ytdlp = Arc::new(YtDlp::new(
        settings.ytdlp_bin.clone(),
        settings.cookies_path.clone(),
    ));
    let coordinator =
        DownloadCoordinator::new(ytdlp.clone(), Arc::clone(&cache), settings.max_downloads);
    let proxy = StreamProxy::new(ytdlp.clone(), Arc::clone(&cache))
        .context("building upstream http client")?;

    let janitor = spawn_janitor(Arc::clone(&cache), settings.sweep_interval);

    let app = router(AppState {
        coordinator,
        proxy: Arc::new(proxy),
        ytdlp,
    });

    let addr = SocketAddr::new(settings.host, settings.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    tracing::info!(
        %addr,
        cache_dir = %cache.dir().display(),
        max_downloads = settings.max_downloads,
        "video delivery listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    janitor.abort();
    tracing::info!("video delivery stopped");
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/stream/{id}", get(stream_video))
        .route("/videos/{id}/download", post(start_download))
        .route("/videos/{id}/download/status", get(download_status))
        .route("/videos/{id}/downloads", get(list_downloads))
        .route("/videos/{id}/qualities", get(list_qualities))
        .with_state(state)
}

async fn shutdown_signal() {
    // Only graceful shutdown depends on this; Ctrl+C still ends the process.
    if let Err(err) = signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to install Ctrl+C handler");
    }
    tracing::info!("shutdown requested");
}

async fn stream_video(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    Query(query): Query<QualityQuery>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    ensure_valid_video_id(&id)?;
    let quality = parse_quality(query.quality.as_deref(), quality::AUTO)?;
    state.proxy.serve_stream(&id, &quality, &headers).await
}

async fn start_download(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    Query(query): Query<QualityQuery>,
) -> ApiResult<Response> {
    ensure_valid_video_id(&id)?;
    let quality = parse_download_quality(query.quality.as_deref())?;

    // The subscription is not needed here; the job keeps running without it.
    let (_subscription, outcome) = state.coordinator.request_download(&id, &quality);
    let (status, label, size_bytes) = match outcome {
        DownloadOutcome::Cached(entry) => (StatusCode::OK, "complete", Some(entry.size_bytes)),
        DownloadOutcome::Started => (StatusCode::ACCEPTED, "started", None),
        DownloadOutcome::Attached => (StatusCode::ACCEPTED, "downloading", None),
    };
    let body = DownloadResponse {
        status: label,
        video_id: id,
        quality,
        size_bytes,
    };
    Ok((status, Json(body)).into_response())
}

async fn download_status(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    Query(query): Query<QualityQuery>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, axum::Error>>>> {
    ensure_valid_video_id(&id)?;
    let quality = parse_download_quality(query.quality.as_deref())?;

    let subscription = state
        .coordinator
        .subscribe_existing(&id, &quality)
        .ok_or_else(|| ApiError::not_found("no download for this quality"))?;

    let events = subscription
        .into_stream()
        .map(|event| Event::default().event(event.phase.as_str()).json_data(&event));
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

async fn list_downloads(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<Vec<DownloadJob>>> {
    ensure_valid_video_id(&id)?;
    Ok(Json(state.coordinator.active_jobs(&id)))
}

async fn list_qualities(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<QualitiesResponse>> {
    ensure_valid_video_id(&id)?;
    let heights = state
        .ytdlp
        .available_heights(&ytdlp::video_url(&id))
        .await
        .map_err(|err| {
            tracing::warn!(video_id = %id, error = %err, "could not list formats");
            ApiError::bad_gateway("could not list available formats")
        })?;
    Ok(Json(QualitiesResponse {
        qualities: quality::obtainable_qualities(heights),
        video_id: id,
    }))
}

/// Video IDs end up in file names, so only a conservative alphabet passes.
fn ensure_valid_video_id(id: &str) -> ApiResult<()> {
    let valid = !id.is_empty()
        && id.len() <= MAX_VIDEO_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
    if valid {
        Ok(())
    } else {
        Err(ApiError::bad_request("invalid video id"))
    }
}

fn parse_quality(raw: Option<&str>, default: &str) -> ApiResult<String> {
    match raw.map(str::trim).filter(|value| !value.is_empty()) {
        None => Ok(default.to_string()),
        Some(value) => quality::normalize(value)
            .ok_or_else(|| ApiError::bad_request(format!("invalid quality: {value}"))),
    }
}

/// `auto` is a pass-through stream and has nothing to download.
fn parse_download_quality(raw: Option<&str>) -> ApiResult<String> {
    let quality = parse_quality(raw, DEFAULT_DOWNLOAD_QUALITY)?;
    if quality == quality::AUTO {
        return Err(ApiError::bad_request("auto quality cannot be downloaded"));
    }
    Ok(quality)
}
