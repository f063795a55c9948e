#![forbid(unsafe_code)]

//! Read path for video bytes.
//!
//! `auto` is passed straight through from the upstream host, everything else
//! is served from the cache. This module never starts a download.

use std::{path::Path, sync::Arc};

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use mime_guess::{MimeGuess, mime::Mime};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
};
use tokio_util::io::ReaderStream;

use crate::{
    cache::CacheStore,
    error::{ApiError, ApiResult, FetchError},
    quality,
    ytdlp::{self, YtDlp},
};

pub const UPSTREAM_USER_AGENT: &str = "Mozilla/5.0 (compatible; Feeds/1.0)";

/// Connection-level headers that must not be copied from the upstream reply.
const HOP_BY_HOP: [HeaderName; 4] = [
    header::CONNECTION,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::TRAILER,
];

/// Resolves the direct URL of a single combined stream for a video.
#[async_trait]
pub trait StreamSource: Send + Sync {
    async fn upstream_url(&self, video_id: &str) -> Result<String, FetchError>;
}

#[async_trait]
impl StreamSource for YtDlp {
    async fn upstream_url(&self, video_id: &str) -> Result<String, FetchError> {
        self.stream_url(&ytdlp::video_url(video_id), quality::AUTO).await
    }
}

pub struct StreamProxy {
    source: Arc<dyn StreamSource>,
    cache: Arc<CacheStore>,
    client: reqwest::Client,
}

impl StreamProxy {
    pub fn new(source: Arc<dyn StreamSource>, cache: Arc<CacheStore>) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(UPSTREAM_USER_AGENT)
            .build()?;
        Ok(Self {
            source,
            cache,
            client,
        })
    }

    /// Serves `quality` of `video_id`, honouring the caller's `Range` header.
    pub async fn serve_stream(
        &self,
        video_id: &str,
        quality: &str,
        headers: &HeaderMap,
    ) -> ApiResult<Response> {
        if quality == quality::AUTO {
            return self.proxy_upstream(video_id, headers).await;
        }

        let cache = Arc::clone(&self.cache);
        let (id, label) = (video_id.to_string(), quality.to_string());
        let entry = tokio::task::spawn_blocking(move || cache.lookup(&id, &label))
            .await
            .map_err(|err| ApiError::internal(format!("cache lookup failed: {err}")))?
            .ok_or_else(|| ApiError::not_found(format!("quality {quality} is not cached")))?;
        let mime = MimeGuess::from_path(&entry.file_path).first_or_octet_stream();
        stream_file(&entry.file_path, &mime, headers).await
    }

    async fn proxy_upstream(&self, video_id: &str, headers: &HeaderMap) -> ApiResult<Response> {
        let url = self.source.upstream_url(video_id).await.map_err(|err| {
            tracing::warn!(video_id, error = %err, "could not resolve upstream stream");
            ApiError::bad_gateway("could not resolve upstream stream")
        })?;

        let mut request = self.client.get(&url);
        if let Some(range) = headers.get(header::RANGE) {
            request = request.header(header::RANGE, range.clone());
        }
        let upstream = request.send().await.map_err(|err| {
            tracing::warn!(video_id, error = %err, "upstream request failed");
            ApiError::bad_gateway("upstream request failed")
        })?;

        let status = upstream.status();
        if !status.is_success() {
            tracing::warn!(video_id, %status, "upstream answered with an error status");
        }

        let mut mirrored = upstream.headers().clone();
        for name in &HOP_BY_HOP {
            mirrored.remove(name);
        }

        let mut response = Body::from_stream(upstream.bytes_stream()).into_response();
        *response.status_mut() = status;
        *response.headers_mut() = mirrored;
        Ok(response)
    }
}

/// Streams a file from disk with single-range support.
pub async fn stream_file(
    path: &Path,
    mime: &Mime,
    headers: &HeaderMap,
) -> ApiResult<Response> {
    // The janitor may remove the file between lookup and open.
    let mut file = File::open(path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let size = file
        .metadata()
        .await
        .map_err(|_| ApiError::not_found("file not found"))?
        .len();

    let range = headers
        .get(header::RANGE)
        .and_then(|value| parse_range_header(value, size));

    let mut response = match range {
        Some((start, _)) if start >= size => {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::RANGE_NOT_SATISFIABLE;
            response
                .headers_mut()
                .insert(header::CONTENT_RANGE, header_value(format!("bytes */{size}"))?);
            response
        }
        Some((start, end)) => {
            let end = end.min(size.saturating_sub(1));
            let length = end - start + 1;
            file.seek(std::io::SeekFrom::Start(start))
                .await
                .map_err(|err| ApiError::internal(format!("seek failed: {err}")))?;
            let mut response = Body::from_stream(ReaderStream::new(file.take(length))).into_response();
            *response.status_mut() = StatusCode::PARTIAL_CONTENT;
            response.headers_mut().insert(
                header::CONTENT_RANGE,
                header_value(format!("bytes {start}-{end}/{size}"))?,
            );
            response
                .headers_mut()
                .insert(header::CONTENT_LENGTH, HeaderValue::from(length));
            response
        }
        None => {
            let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
            response
                .headers_mut()
                .insert(header::CONTENT_LENGTH, HeaderValue::from(size));
            response
        }
    };

    response
        .headers_mut()
        .insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if let Ok(value) = HeaderValue::from_str(mime.as_ref()) {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }

    Ok(response)
}

fn header_value(value: String) -> ApiResult<HeaderValue> {
    HeaderValue::try_from(value).map_err(|err| ApiError::internal(err.to_string()))
}

/// Parses a single `bytes=` range. Returns inclusive `(start, end)`; `end`
/// may exceed the file size and is clamped by the caller.
pub fn parse_range_header(value: &HeaderValue, size: u64) -> Option<(u64, u64)> {
    let value = value.to_str().ok()?.trim();
    let (unit, range) = value.split_once('=')?;
    if unit.trim() != "bytes" {
        return None;
    }
    let range = range.trim();
    // Multipart ranges are not supported; serve the whole file instead.
    if range.is_empty() || range.contains(',') {
        return None;
    }
    let (start_str, end_str) = range.split_once('-')?;

    if start_str.is_empty() {
        // "-N" is the last N bytes.
        let suffix_len: u64 = end_str.parse().ok()?;
        if suffix_len == 0 {
            return None;
        }
        return Some((size.saturating_sub(suffix_len), size.saturating_sub(1)));
    }

    let start: u64 = start_str.parse().ok()?;
    // An open range past the end stays past the end so the caller answers 416.
    let end = if end_str.is_empty() {
        size.saturating_sub(1).max(start)
    } else {
        end_str.parse().ok()?
    };
    if end < start {
        return None;
    }
    Some((start, end))
}
