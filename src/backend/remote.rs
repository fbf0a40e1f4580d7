//! Delegation to another vidrelay instance (`BACKEND_URL`).
//!
//! The remote service does the heavy lifting; this side only asks it to
//! download, then pulls the finished file through `/api/files/{name}` into the
//! local staging directory so the rest of the pipeline is unchanged.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::task;
use tracing::info;
use url::Url;

use super::transfer::AttemptBudget;
use super::{AcquisitionBackend, BackendInfo, FetchRequest, FormatSelection, RawThumbnail};
use crate::error::{AcquireError, Result};

const HEALTH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct RemoteBackend {
    base_url: String,
}

impl RemoteBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// `/api/files/{name}` with `name` percent-encoded as a single segment.
    fn file_url(&self, name: &str) -> Result<Url> {
        let mut url = Url::parse(&self.endpoint("/api/files"))
            .map_err(|err| AcquireError::Backend(format!("remote base URL: {err}")))?;
        url.path_segments_mut()
            .map_err(|()| AcquireError::Backend(format!("{} cannot carry a path", self.base_url)))?
            .pop_if_empty()
            .push(name);
        Ok(url)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RemoteMetadata {
    title: Option<String>,
    thumbnail_url: Option<String>,
    thumbnails: Vec<RawThumbnail>,
    duration_seconds: Option<f64>,
    uploader_name: Option<String>,
    channel_name: Option<String>,
    view_count: Option<u64>,
}

impl From<RemoteMetadata> for BackendInfo {
    fn from(remote: RemoteMetadata) -> Self {
        BackendInfo {
            title: remote.title,
            thumbnail: remote.thumbnail_url,
            thumbnails: remote.thumbnails,
            duration: remote.duration_seconds,
            uploader: remote.uploader_name,
            channel: remote.channel_name,
            view_count: remote.view_count,
            ..BackendInfo::default()
        }
    }
}

#[derive(Debug, Deserialize)]
struct RemoteSummary {
    filename: String,
}

#[derive(Debug, Default, Deserialize)]
struct RemoteError {
    error: Option<String>,
}

fn agent(timeout: Duration) -> ureq::Agent {
    ureq::AgentBuilder::new().timeout(timeout).build()
}

/// 4xx answers are the remote telling us the request itself is bad; they are
/// not worth retrying with another strategy.
fn remote_error(context: &str, err: ureq::Error) -> AcquireError {
    match err {
        ureq::Error::Status(code, response) => {
            let message = response
                .into_json::<RemoteError>()
                .ok()
                .and_then(|body| body.error)
                .unwrap_or_else(|| format!("HTTP {code}"));
            if (400..500).contains(&code) {
                AcquireError::Validation(message)
            } else {
                AcquireError::Backend(format!("{context}: {message}"))
            }
        }
        ureq::Error::Transport(transport) => {
            AcquireError::Backend(format!("{context}: {transport}"))
        }
    }
}

fn selection_fields(selection: FormatSelection) -> (String, Option<&'static str>) {
    match selection {
        FormatSelection::Preferred { ceiling, container } => {
            (ceiling.to_string(), Some(container.extension()))
        }
        FormatSelection::AnyContainer { ceiling } => (ceiling.to_string(), None),
        FormatSelection::Unconstrained => ("best".to_string(), None),
    }
}

fn extension_of(name: &str) -> &str {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("mp4")
}

#[async_trait]
impl AcquisitionBackend for RemoteBackend {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn smoke_test(&self) -> Result<String> {
        let url = self.endpoint("/api/health");
        task::spawn_blocking(move || {
            agent(HEALTH_TIMEOUT)
                .get(&url)
                .call()
                .map(|_| format!("healthy: {url}"))
                .map_err(|err| AcquireError::capability(format!("{url}: {err}")))
        })
        .await
        .map_err(|err| AcquireError::Backend(format!("task join error: {err}")))?
    }

    async fn fetch_metadata(&self, url: &str, timeout: Duration) -> Result<BackendInfo> {
        let endpoint = self.endpoint("/api/info");
        let body = json!({ "url": url });
        task::spawn_blocking(move || {
            let remote: RemoteMetadata = agent(timeout)
                .post(&endpoint)
                .send_json(body)
                .map_err(|err| remote_error("info", err))?
                .into_json()
                .map_err(|err| AcquireError::Backend(format!("info body: {err}")))?;
            Ok(BackendInfo::from(remote))
        })
        .await
        .map_err(|err| AcquireError::Backend(format!("task join error: {err}")))?
    }

    async fn fetch_media(&self, request: &FetchRequest) -> Result<()> {
        let (quality, format) = selection_fields(request.selection);
        let body = json!({
            "url": request.url,
            "quality": quality,
            "format": format,
            "cookie": request.cookie,
        });
        let download = self.endpoint("/api/download");
        let backend = self.clone();
        let request = request.clone();
        task::spawn_blocking(move || {
            let budget = AttemptBudget::start(&request);
            let summary: RemoteSummary = agent(budget.remaining()?)
                .post(&download)
                .send_json(body)
                .map_err(|err| remote_error("download", err))?
                .into_json()
                .map_err(|err| AcquireError::Backend(format!("download body: {err}")))?;

            let target = request.output_dir.join(format!(
                "{}.{}",
                request.base_name,
                extension_of(&summary.filename)
            ));
            let file_url = backend.file_url(&summary.filename)?;
            let reader = agent(budget.remaining()?)
                .get(file_url.as_str())
                .call()
                .map_err(|err| remote_error("files", err))?
                .into_reader();
            let written = budget.stream_to_file(reader, &target)?;
            info!(remote = %summary.filename, bytes = written, "pulled file from remote backend");
            Ok(())
        })
        .await
        .map_err(|err| AcquireError::Backend(format!("task join error: {err}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::serve;
    use crate::backend::{Container, Quality};
    use anyhow::Result;
    use axum::http::StatusCode;
    use axum::{Json, Router, routing::get, routing::post};
    use axum::extract::Path as UrlPath;
    use serde_json::Value;
    use std::fs;
    use tempfile::tempdir;
    use tokio_util::sync::CancellationToken;

    fn remote_router() -> Router {
        Router::new()
            .route("/api/health", get(|| async { Json(json!({"status": "ok"})) }))
            .route(
                "/api/info",
                post(|| async {
                    Json(json!({
                        "title": "Remote Title",
                        "thumbnailUrl": "https://i/max.jpg",
                        "thumbnails": [],
                        "durationSeconds": 61,
                        "uploaderName": "Remote",
                        "synthetic": false
                    }))
                }),
            )
            .route(
                "/api/download",
                post(|Json(body): Json<Value>| async move {
                    if body["quality"] != "720p" || body["format"] != "webm" {
                        let error = Json(json!({"error": "bad selection"}));
                        return Err((StatusCode::BAD_REQUEST, error));
                    }
                    Ok(Json(json!({"filename": "Remote_Title_1.webm", "fileSize": "0.00 MB"})))
                }),
            )
            .route("/api/files/{name}", get(|| async { vec![1u8; 300] }))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn delegates_and_pulls_the_file() -> Result<()> {
        let base = serve(|_| remote_router()).await;
        let backend = RemoteBackend::new(format!("{base}/"));
        assert!(backend.smoke_test().await?.starts_with("healthy"));

        let info = backend
            .fetch_metadata("https://youtu.be/dQw4w9WgXcQ", Duration::from_secs(5))
            .await?;
        assert_eq!(info.title.as_deref(), Some("Remote Title"));
        assert_eq!(info.duration, Some(61.0));

        let dir = tempdir()?;
        backend
            .fetch_media(&FetchRequest {
                url: "https://youtu.be/dQw4w9WgXcQ".into(),
                output_dir: dir.path().to_path_buf(),
                base_name: "Local_2".into(),
                selection: FormatSelection::Preferred {
                    ceiling: Quality::P720,
                    container: Container::Webm,
                },
                cookie: None,
                timeout: Duration::from_secs(5),
                cancel: CancellationToken::new(),
            })
            .await?;
        assert_eq!(fs::metadata(dir.path().join("Local_2.webm"))?.len(), 300);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn remote_client_errors_are_not_retried() -> Result<()> {
        let base = serve(|_| remote_router()).await;
        let dir = tempdir()?;
        let err = RemoteBackend::new(base)
            .fetch_media(&FetchRequest {
                url: "https://youtu.be/dQw4w9WgXcQ".into(),
                output_dir: dir.path().to_path_buf(),
                base_name: "Local_3".into(),
                selection: FormatSelection::Unconstrained,
                cookie: None,
                timeout: Duration::from_secs(5),
                cancel: CancellationToken::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AcquireError::Validation(ref msg) if msg == "bad selection"));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn remote_filenames_are_sent_as_one_encoded_segment() -> Result<()> {
        let base = serve(|_| {
            Router::new()
                .route(
                    "/api/download",
                    post(|| async {
                        Json(json!({"filename": "Q&A #3 50%.mp4", "fileSize": "0.00 MB"}))
                    }),
                )
                .route(
                    "/api/files/{name}",
                    get(|UrlPath(name): UrlPath<String>| async move {
                        if name == "Q&A #3 50%.mp4" {
                            Ok(vec![2u8; 64])
                        } else {
                            Err(StatusCode::NOT_FOUND)
                        }
                    }),
                )
        })
        .await;
        let dir = tempdir()?;
        RemoteBackend::new(base)
            .fetch_media(&FetchRequest {
                url: "https://youtu.be/dQw4w9WgXcQ".into(),
                output_dir: dir.path().to_path_buf(),
                base_name: "Local_4".into(),
                selection: FormatSelection::Unconstrained,
                cookie: None,
                timeout: Duration::from_secs(5),
                cancel: CancellationToken::new(),
            })
            .await?;
        assert_eq!(fs::metadata(dir.path().join("Local_4.mp4"))?.len(), 64);
        Ok(())
    }

    #[test]
    fn file_url_keeps_the_base_path() -> Result<()> {
        let backend = RemoteBackend::new("http://relay.local/vidrelay/");
        let url = backend.file_url("a/b c.mp4")?;
        assert_eq!(url.as_str(), "http://relay.local/vidrelay/api/files/a%2Fb%20c.mp4");
        Ok(())
    }
}
