//! HTTP delivery layer.

use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::{Path as AxumPath, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use mime_guess::MimeGuess;
use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::{error, warn};

use crate::capability::ProviderState;
use crate::error::AcquireError;
use crate::metadata::VideoMetadata;
use crate::pipeline::{Acquirer, DownloadRequest, DownloadSummary};

#[derive(Clone)]
pub struct AppState {
    pub acquirer: Arc<Acquirer>,
}

impl AppState {
    pub fn new(acquirer: Acquirer) -> Self {
        Self {
            acquirer: Arc::new(acquirer),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/info", post(info))
        .route("/api/download", post(download))
        .route("/api/files/{filename}", get(download_file))
        .route("/api/health", get(health))
        .with_state(state)
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    details: Vec<String>,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
            details: Vec::new(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
            details: Vec::new(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<AcquireError> for ApiError {
    fn from(err: AcquireError) -> Self {
        let status = match &err {
            AcquireError::Validation(_) => StatusCode::BAD_REQUEST,
            AcquireError::CapabilityUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(attempts = ?err.attempts(), "request failed: {err}");
        }
        Self {
            status,
            message: err.to_string(),
            details: err.attempts().to_vec(),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    details: &'a [String],
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: &self.message,
            details: &self.details,
        };
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Default, Deserialize)]
pub struct InfoRequest {
    #[serde(default)]
    pub url: String,
}

async fn info(
    State(state): State<AppState>,
    Json(request): Json<InfoRequest>,
) -> ApiResult<Json<VideoMetadata>> {
    let metadata = state.acquirer.describe(&request.url).await?;
    Ok(Json(metadata))
}

async fn download(
    State(state): State<AppState>,
    Json(request): Json<DownloadRequest>,
) -> ApiResult<Json<DownloadSummary>> {
    let summary = state.acquirer.acquire(&request).await?;
    Ok(Json(summary))
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    capability: ProviderState,
}

async fn health(State(state): State<AppState>) -> Json<Health> {
    Json(Health {
        status: "ok",
        capability: state.acquirer.capability_state(),
    })
}

async fn download_file(
    State(state): State<AppState>,
    AxumPath(filename): AxumPath<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let path = state
        .acquirer
        .store()
        .resolve_download(&filename)
        .ok_or_else(|| ApiError::not_found("file not found"))?;
    let range = headers.get(header::RANGE).and_then(|value| value.to_str().ok());
    stream_file(&path, range).await
}

/// Result of interpreting a `Range` header against a file length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeOutcome {
    Full,
    /// Inclusive byte bounds.
    Partial(u64, u64),
    Unsatisfiable,
}

/// Single-range `bytes=` parsing. Malformed or multi-range headers are
/// ignored and the whole file is served.
pub fn parse_range(header: Option<&str>, len: u64) -> RangeOutcome {
    let Some(spec) = header.and_then(|value| value.trim().strip_prefix("bytes=")) else {
        return RangeOutcome::Full;
    };
    if spec.contains(',') {
        return RangeOutcome::Full;
    }
    let Some((start, end)) = spec.split_once('-') else {
        return RangeOutcome::Full;
    };
    let (start, end) = (start.trim(), end.trim());

    if start.is_empty() {
        return match end.parse::<u64>() {
            Ok(0) => RangeOutcome::Unsatisfiable,
            Ok(_) if len == 0 => RangeOutcome::Unsatisfiable,
            Ok(suffix) => RangeOutcome::Partial(len.saturating_sub(suffix), len - 1),
            Err(_) => RangeOutcome::Full,
        };
    }

    let Ok(start) = start.parse::<u64>() else {
        return RangeOutcome::Full;
    };
    let end = if end.is_empty() {
        len.saturating_sub(1)
    } else {
        match end.parse::<u64>() {
            Ok(end) if end < start => return RangeOutcome::Full,
            Ok(end) => end.min(len.saturating_sub(1)),
            Err(_) => return RangeOutcome::Full,
        }
    };
    if start >= len {
        RangeOutcome::Unsatisfiable
    } else {
        RangeOutcome::Partial(start, end)
    }
}

fn attachment_header(path: &Path) -> Option<HeaderValue> {
    let name = path.file_name()?.to_str()?.replace(['"', '\\'], "_");
    HeaderValue::from_str(&format!("attachment; filename=\"{name}\"")).ok()
}

async fn stream_file(path: &Path, range: Option<&str>) -> ApiResult<Response> {
    let mut file = File::open(path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let len = file
        .metadata()
        .await
        .map_err(|err| ApiError::internal(format!("reading file metadata: {err}")))?
        .len();

    let mut builder = Response::builder()
        .header(header::ACCEPT_RANGES, "bytes")
        .header(
            header::CONTENT_TYPE,
            MimeGuess::from_path(path)
                .first_or_octet_stream()
                .essence_str(),
        );
    if let Some(disposition) = attachment_header(path) {
        builder = builder.header(header::CONTENT_DISPOSITION, disposition);
    }

    let response = match parse_range(range, len) {
        RangeOutcome::Full => builder
            .status(StatusCode::OK)
            .header(header::CONTENT_LENGTH, len)
            .body(Body::from_stream(ReaderStream::new(file))),
        RangeOutcome::Partial(start, end) => {
            file.seek(SeekFrom::Start(start))
                .await
                .map_err(|err| ApiError::internal(format!("seeking file: {err}")))?;
            let count = end - start + 1;
            builder
                .status(StatusCode::PARTIAL_CONTENT)
                .header(header::CONTENT_LENGTH, count)
                .header(header::CONTENT_RANGE, format!("bytes {start}-{end}/{len}"))
                .body(Body::from_stream(ReaderStream::new(file.take(count))))
        }
        RangeOutcome::Unsatisfiable => {
            warn!(path = %path.display(), ?range, "unsatisfiable range requested");
            builder
                .status(StatusCode::RANGE_NOT_SATISFIABLE)
                .header(header::CONTENT_RANGE, format!("bytes */{len}"))
                .body(Body::empty())
        }
    };
    response.map_err(|err| ApiError::internal(format!("building response: {err}")))
}
