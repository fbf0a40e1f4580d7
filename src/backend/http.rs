//! Minimal in-process backend for hosts where no yt-dlp can be provisioned.
//!
//! Metadata comes from the public oEmbed endpoint; media from the player API's
//! progressive (pre-muxed) formats, which top out around 720p and need no
//! signature deciphering. Anything fancier belongs to yt-dlp.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::task;
use tracing::{debug, info};

use super::transfer::AttemptBudget;
use super::{
    AcquisitionBackend, BackendInfo, Container, FetchRequest, FormatSelection, RawThumbnail,
};
use crate::error::{AcquireError, Result};
use crate::identifier::extract_identifier;

pub const OEMBED_ENDPOINT: &str = "https://www.youtube.com/oembed";
pub const PLAYER_ENDPOINT: &str = "https://youtubei.googleapis.com/youtubei/v1/player";
pub const PROBE_URL: &str = "https://www.youtube.com/generate_204";

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const ANDROID_CLIENT_VERSION: &str = "19.09.37";

#[derive(Debug, Clone)]
pub struct HttpBackend {
    oembed_endpoint: String,
    player_endpoint: String,
    probe_url: String,
}

impl Default for HttpBackend {
    fn default() -> Self {
        Self::with_endpoints(OEMBED_ENDPOINT, PLAYER_ENDPOINT, PROBE_URL)
    }
}

impl HttpBackend {
    pub fn with_endpoints(
        oembed_endpoint: impl Into<String>,
        player_endpoint: impl Into<String>,
        probe_url: impl Into<String>,
    ) -> Self {
        Self {
            oembed_endpoint: oembed_endpoint.into(),
            player_endpoint: player_endpoint.into(),
            probe_url: probe_url.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct OEmbed {
    title: Option<String>,
    author_name: Option<String>,
    thumbnail_url: Option<String>,
    thumbnail_width: Option<u32>,
    thumbnail_height: Option<u32>,
}

impl From<OEmbed> for BackendInfo {
    fn from(embed: OEmbed) -> Self {
        let thumbnails = embed
            .thumbnail_url
            .clone()
            .map(|url| {
                vec![RawThumbnail {
                    url: Some(url),
                    width: embed.thumbnail_width,
                    height: embed.thumbnail_height,
                }]
            })
            .unwrap_or_default();
        BackendInfo {
            title: embed.title,
            author_name: embed.author_name,
            thumbnail: embed.thumbnail_url,
            thumbnails,
            ..BackendInfo::default()
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct PlayerResponse {
    playability_status: Option<Playability>,
    streaming_data: Option<StreamingData>,
}

#[derive(Debug, Deserialize)]
struct Playability {
    status: Option<String>,
    reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StreamingData {
    formats: Vec<ProgressiveFormat>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProgressiveFormat {
    pub url: Option<String>,
    pub mime_type: Option<String>,
    pub height: Option<u32>,
    pub bitrate: Option<u64>,
}

impl ProgressiveFormat {
    fn mime(&self) -> &str {
        self.mime_type.as_deref().unwrap_or_default()
    }

    fn extension(&self) -> &'static str {
        if self.mime().starts_with("video/webm") {
            "webm"
        } else {
            "mp4"
        }
    }

    fn fits(&self, selection: FormatSelection) -> bool {
        if self.url.is_none() || !self.mime().starts_with("video/") {
            return false;
        }
        if let (Some(limit), Some(height)) = (selection.ceiling().height(), self.height)
            && height > limit
        {
            return false;
        }
        match selection.container() {
            Some(Container::Mp4) => self.mime().starts_with("video/mp4"),
            Some(Container::Webm) => self.mime().starts_with("video/webm"),
            Some(Container::Mkv) | None => true,
        }
    }
}

/// Highest progressive format the selection allows; bitrate breaks ties.
pub fn pick_progressive(
    formats: &[ProgressiveFormat],
    selection: FormatSelection,
) -> Option<&ProgressiveFormat> {
    formats
        .iter()
        .filter(|format| format.fits(selection))
        .max_by_key(|format| (format.height.unwrap_or(0), format.bitrate.unwrap_or(0)))
}

fn agent(timeout: Duration) -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout(timeout)
        .user_agent(concat!("vidrelay/", env!("CARGO_PKG_VERSION")))
        .build()
}

fn http_error(context: &str, err: ureq::Error) -> AcquireError {
    match err {
        ureq::Error::Status(code, _) => AcquireError::Backend(format!("{context}: HTTP {code}")),
        ureq::Error::Transport(transport) => {
            AcquireError::Backend(format!("{context}: {transport}"))
        }
    }
}

/// Runs blocking HTTP work off the async runtime.
async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    task::spawn_blocking(work)
        .await
        .map_err(|err| AcquireError::Backend(format!("task join error: {err}")))?
}

#[async_trait]
impl AcquisitionBackend for HttpBackend {
    fn name(&self) -> &'static str {
        "in-process"
    }

    async fn smoke_test(&self) -> Result<String> {
        let url = self.probe_url.clone();
        blocking(move || {
            agent(PROBE_TIMEOUT)
                .get(&url)
                .call()
                .map_err(|err| AcquireError::capability(format!("{url} unreachable: {err}")))?;
            Ok(format!("reachable: {url}"))
        })
        .await
    }

    async fn fetch_metadata(&self, url: &str, timeout: Duration) -> Result<BackendInfo> {
        let endpoint = self.oembed_endpoint.clone();
        let video_url = url.to_string();
        blocking(move || {
            let embed: OEmbed = agent(timeout)
                .get(&endpoint)
                .query("url", &video_url)
                .query("format", "json")
                .call()
                .map_err(|err| http_error("oembed", err))?
                .into_json()
                .map_err(|err| AcquireError::Backend(format!("oembed body: {err}")))?;
            let mut info = BackendInfo::from(embed);
            info.id = extract_identifier(&video_url).map(|id| id.to_string());
            Ok(info)
        })
        .await
    }

    async fn fetch_media(&self, request: &FetchRequest) -> Result<()> {
        let id = extract_identifier(&request.url).ok_or_else(|| {
            AcquireError::Validation(format!("{} is not a supported video URL", request.url))
        })?;
        let endpoint = self.player_endpoint.clone();
        let request = request.clone();
        blocking(move || {
            let budget = AttemptBudget::start(&request);
            let player: PlayerResponse = agent(budget.remaining()?)
                .post(&endpoint)
                .send_json(json!({
                    "videoId": id.as_str(),
                    "context": {
                        "client": {
                            "clientName": "ANDROID",
                            "clientVersion": ANDROID_CLIENT_VERSION,
                        }
                    }
                }))
                .map_err(|err| http_error("player", err))?
                .into_json()
                .map_err(|err| AcquireError::Backend(format!("player body: {err}")))?;

            if let Some(playability) = &player.playability_status {
                let status = playability.status.as_deref().unwrap_or("OK");
                let reason = playability.reason.clone().unwrap_or_else(|| status.to_string());
                match status {
                    "OK" => {}
                    "ERROR" | "UNPLAYABLE" => return Err(AcquireError::Validation(reason)),
                    _ => return Err(AcquireError::Backend(reason)),
                }
            }

            let formats = player.streaming_data.map(|data| data.formats).unwrap_or_default();
            let chosen = pick_progressive(&formats, request.selection).ok_or_else(|| {
                AcquireError::Backend(format!(
                    "no progressive format matches {:?}",
                    request.selection
                ))
            })?;
            let media_url = chosen.url.clone().unwrap_or_default();
            let target = request
                .output_dir
                .join(format!("{}.{}", request.base_name, chosen.extension()));
            debug!(
                height = ?chosen.height,
                target = %target.display(),
                "fetching progressive stream"
            );

            let reader = agent(budget.remaining()?)
                .get(&media_url)
                .call()
                .map_err(|err| http_error("media", err))?
                .into_reader();
            let written = budget.stream_to_file(reader, &target)?;
            info!(bytes = written, target = %target.display(), "in-process download finished");
            Ok(())
        })
        .await
    }
}
