//! Video metadata as the rest of vidrelay sees it.
//!
//! Backends report metadata in whatever shape they have ([`BackendInfo`]);
//! this module normalizes it into [`VideoMetadata`], the record the API
//! returns and the companion files store. Fetching never fails: when the
//! backend is missing, slow or confused, callers get a synthetic record built
//! from the identifier alone, flagged with `synthetic: true` so the UI can
//! tell the difference.

use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::time;
use tracing::{debug, warn};

use crate::backend::{AcquisitionBackend, BackendInfo, RawThumbnail};
use crate::identifier::{canonical_watch_url, extract_identifier};

/// Upper bound on a metadata lookup before the synthetic record is used.
pub const METADATA_TIMEOUT: Duration = Duration::from_secs(45);

pub const UNKNOWN_UPLOADER: &str = "Unknown";

/// A thumbnail candidate. Dimensions are optional because several sources
/// only publish a URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thumbnail {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

impl Thumbnail {
    fn area(&self) -> u64 {
        u64::from(self.width.unwrap_or(0)) * u64::from(self.height.unwrap_or(0))
    }
}

/// Normalized description of one video.
///
/// `thumbnail_url` is always the highest-resolution entry of `thumbnails` (or
/// the backend's single thumbnail when it reported no list). Optional fields
/// are omitted from JSON when unknown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoMetadata {
    pub title: String,
    pub thumbnail_url: String,
    #[serde(default)]
    pub thumbnails: Vec<Thumbnail>,
    pub duration_seconds: u64,
    pub uploader_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_name: Option<String>,
    #[serde(default)]
    pub synthetic: bool,
}

/// Describes `input` through `backend`, falling back to the synthetic record
/// on any failure (including having no backend at all).
pub async fn fetch_metadata(
    backend: Option<&dyn AcquisitionBackend>,
    input: &str,
) -> VideoMetadata {
    let Some(backend) = backend else {
        debug!("no acquisition backend; using synthetic metadata");
        return synthetic_metadata(input);
    };

    let url = extract_identifier(input)
        .map(|id| canonical_watch_url(&id))
        .unwrap_or_else(|| input.trim().to_string());

    match time::timeout(METADATA_TIMEOUT, backend.fetch_metadata(&url, METADATA_TIMEOUT)).await {
        Ok(Ok(info)) => normalize(info, input),
        Ok(Err(err)) => {
            warn!(backend = backend.name(), %url, "metadata lookup failed: {err}");
            synthetic_metadata(input)
        }
        Err(_) => {
            warn!(backend = backend.name(), %url, "metadata lookup timed out");
            synthetic_metadata(input)
        }
    }
}

/// Record used when nothing better is available. The identifier is the
/// extracted video ID, or the trimmed input when extraction fails.
pub fn synthetic_metadata(input: &str) -> VideoMetadata {
    let id = extract_identifier(input);
    let label = id
        .as_ref()
        .map(|id| id.to_string())
        .unwrap_or_else(|| input.trim().to_string());
    let thumbnail_url = id
        .map(|id| format!("https://img.youtube.com/vi/{id}/maxresdefault.jpg"))
        .unwrap_or_default();
    VideoMetadata {
        title: format!("Video {label}"),
        thumbnail_url,
        thumbnails: Vec::new(),
        duration_seconds: 0,
        uploader_name: UNKNOWN_UPLOADER.to_string(),
        view_count: None,
        publish_date: None,
        channel_name: None,
        synthetic: true,
    }
}

/// Converts raw backend output into [`VideoMetadata`]. A missing title falls
/// back to the synthetic title so the record is always presentable.
pub fn normalize(info: BackendInfo, input: &str) -> VideoMetadata {
    let mut thumbnails: Vec<Thumbnail> = info
        .thumbnails
        .into_iter()
        .filter_map(|RawThumbnail { url, width, height }| {
            url.filter(|url| !url.is_empty())
                .map(|url| Thumbnail { url, width, height })
        })
        .collect();
    let thumbnail_url = select_best_thumbnail(&thumbnails)
        .map(|thumb| thumb.url.clone())
        .or_else(|| info.thumbnail.clone().filter(|url| !url.is_empty()))
        .unwrap_or_else(|| synthetic_metadata(input).thumbnail_url);
    sort_by_resolution(&mut thumbnails);

    let title = non_empty(info.fulltitle)
        .or_else(|| non_empty(info.title))
        .unwrap_or_else(|| synthetic_metadata(input).title);
    let uploader_name = non_empty(info.uploader.clone())
        .or_else(|| non_empty(info.channel.clone()))
        .or_else(|| non_empty(info.author_name.clone()))
        .unwrap_or_else(|| UNKNOWN_UPLOADER.to_string());
    let channel_name = non_empty(info.channel).or_else(|| non_empty(info.uploader));
    let publish_date = info
        .upload_date
        .as_deref()
        .and_then(upload_date_to_iso)
        .or_else(|| info.release_timestamp.and_then(timestamp_to_iso));
    let duration_seconds = info
        .duration
        .filter(|secs| secs.is_finite() && *secs > 0.0)
        .map(|secs| secs.floor() as u64)
        .unwrap_or(0);

    VideoMetadata {
        title,
        thumbnail_url,
        thumbnails,
        duration_seconds,
        uploader_name,
        view_count: info.view_count,
        publish_date,
        channel_name,
        synthetic: false,
    }
}

/// Highest width×height wins; missing dimensions count as zero and ties keep
/// the earlier entry.
pub fn select_best_thumbnail(thumbnails: &[Thumbnail]) -> Option<&Thumbnail> {
    thumbnails
        .iter()
        .enumerate()
        .max_by(|(ia, a), (ib, b)| a.area().cmp(&b.area()).then(ib.cmp(ia)))
        .map(|(_, thumb)| thumb)
}

fn sort_by_resolution(thumbnails: &mut [Thumbnail]) {
    thumbnails.sort_by_key(|thumb| std::cmp::Reverse(thumb.area()));
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// `YYYYMMDD` as reported by yt-dlp, to an ISO-8601 date.
fn upload_date_to_iso(value: &str) -> Option<String> {
    NaiveDate::parse_from_str(value, "%Y%m%d")
        .ok()
        .map(|date| date.format("%Y-%m-%d").to_string())
}

fn timestamp_to_iso(timestamp: i64) -> Option<String> {
    DateTime::<Utc>::from_timestamp(timestamp, 0).map(|datetime| datetime.to_rfc3339())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::{MediaStep, ScriptedBackend};

    const URL: &str = "https://youtu.be/dQw4w9WgXcQ";

    fn thumb(url: &str, width: Option<u32>, height: Option<u32>) -> Thumbnail {
        Thumbnail {
            url: url.into(),
            width,
            height,
        }
    }

    #[test]
    fn best_thumbnail_is_the_largest() {
        let thumbs = vec![
            thumb("small", Some(120), Some(90)),
            thumb("large", Some(640), Some(480)),
            thumb("medium", Some(320), Some(240)),
        ];
        assert_eq!(select_best_thumbnail(&thumbs).unwrap().url, "large");
    }

    #[test]
    fn thumbnail_ties_keep_original_order() {
        let thumbs = vec![
            thumb("unknown", None, None),
            thumb("first", Some(100), Some(100)),
            thumb("second", Some(100), Some(100)),
        ];
        assert_eq!(select_best_thumbnail(&thumbs).unwrap().url, "first");
        assert!(select_best_thumbnail(&[]).is_none());
    }

    #[test]
    fn synthetic_record_uses_identifier() {
        let meta = synthetic_metadata(URL);
        assert_eq!(meta.title, "Video dQw4w9WgXcQ");
        assert_eq!(
            meta.thumbnail_url,
            "https://img.youtube.com/vi/dQw4w9WgXcQ/maxresdefault.jpg"
        );
        assert_eq!(meta.duration_seconds, 0);
        assert_eq!(meta.uploader_name, "Unknown");
        assert!(meta.synthetic);

        let odd = synthetic_metadata(" something else ");
        assert_eq!(odd.title, "Video something else");
        assert!(odd.thumbnail_url.is_empty());
    }

    #[test]
    fn normalize_fills_fallbacks() {
        let info = BackendInfo {
            title: Some("  ".into()),
            fulltitle: None,
            channel: Some("Channel".into()),
            duration: Some(-3.0),
            upload_date: Some("20240102".into()),
            thumbnail: Some("https://i/only.jpg".into()),
            ..BackendInfo::default()
        };
        let meta = normalize(info, URL);
        assert_eq!(meta.title, "Video dQw4w9WgXcQ");
        assert_eq!(meta.uploader_name, "Channel");
        assert_eq!(meta.channel_name.as_deref(), Some("Channel"));
        assert_eq!(meta.duration_seconds, 0);
        assert_eq!(meta.publish_date.as_deref(), Some("2024-01-02"));
        assert_eq!(meta.thumbnail_url, "https://i/only.jpg");
        assert!(!meta.synthetic);
    }

    #[test]
    fn normalize_prefers_thumbnail_list_and_floors_duration() {
        let info = BackendInfo {
            title: Some("Title".into()),
            uploader: Some("Up".into()),
            duration: Some(212.9),
            release_timestamp: Some(0),
            thumbnail: Some("https://i/fallback.jpg".into()),
            thumbnails: vec![
                RawThumbnail {
                    url: Some("https://i/90.jpg".into()),
                    width: Some(120),
                    height: Some(90),
                },
                RawThumbnail {
                    url: Some("https://i/480.jpg".into()),
                    width: Some(640),
                    height: Some(480),
                },
                RawThumbnail {
                    url: None,
                    width: Some(9999),
                    height: Some(9999),
                },
            ],
            ..BackendInfo::default()
        };
        let meta = normalize(info, URL);
        assert_eq!(meta.thumbnail_url, "https://i/480.jpg");
        assert_eq!(meta.thumbnails.len(), 2);
        assert_eq!(meta.thumbnails[0].url, "https://i/480.jpg");
        assert_eq!(meta.duration_seconds, 212);
        assert_eq!(meta.publish_date.as_deref(), Some("1970-01-01T00:00:00+00:00"));
    }

    #[tokio::test]
    async fn fetch_never_fails() {
        let broken = ScriptedBackend::new(None, Vec::<MediaStep>::new());
        let meta = fetch_metadata(Some(&broken as &dyn AcquisitionBackend), URL).await;
        assert!(meta.synthetic);
        assert_eq!(meta.title, "Video dQw4w9WgXcQ");

        let missing = fetch_metadata(None, URL).await;
        assert_eq!(missing, meta);

        let working = ScriptedBackend::titled("Test Video", Vec::new());
        let meta = fetch_metadata(Some(&working as &dyn AcquisitionBackend), URL).await;
        assert_eq!(meta.title, "Test Video");
        assert_eq!(meta.duration_seconds, 212);
    }

    #[test]
    fn json_shape_is_camel_case() {
        let json = serde_json::to_value(synthetic_metadata(URL)).unwrap();
        assert!(json.get("thumbnailUrl").is_some());
        assert!(json.get("durationSeconds").is_some());
        assert!(json.get("viewCount").is_none());
    }
}
