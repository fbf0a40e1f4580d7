//! Acquisition backends: the black boxes that can describe a video and write
//! its media to disk.
//!
//! Three implementations exist: the yt-dlp command-line tool, a minimal
//! in-process HTTP fetcher used when no binary can be provisioned, and a
//! remote vidrelay instance the server can delegate to. Everything above this
//! module talks to them through [`AcquisitionBackend`] only.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::Result;

pub mod http;
pub mod remote;
pub(crate) mod transfer;
pub mod ytdlp;

pub use http::HttpBackend;
pub use remote::RemoteBackend;
pub use ytdlp::YtDlpBackend;

/// Vertical resolution ceiling. Ordered from lowest to highest so that
/// `min` picks the stricter of two ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize)]
pub enum Quality {
    #[serde(rename = "360p")]
    P360,
    #[serde(rename = "480p")]
    P480,
    #[serde(rename = "720p")]
    P720,
    #[default]
    #[serde(rename = "1080p")]
    P1080,
    #[serde(rename = "1440p")]
    P1440,
    #[serde(rename = "2160p")]
    P2160,
    #[serde(rename = "best")]
    Best,
}

impl Quality {
    pub fn height(self) -> Option<u32> {
        match self {
            Self::P360 => Some(360),
            Self::P480 => Some(480),
            Self::P720 => Some(720),
            Self::P1080 => Some(1080),
            Self::P1440 => Some(1440),
            Self::P2160 => Some(2160),
            Self::Best => None,
        }
    }

    /// The requested quality, never above `ceiling`.
    pub fn clamp_to(self, ceiling: Quality) -> Quality {
        self.min(ceiling)
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.height() {
            Some(height) => write!(f, "{height}p"),
            None => f.write_str("best"),
        }
    }
}

impl FromStr for Quality {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        let lower = value.trim().to_ascii_lowercase();
        let numeric = lower.trim_end_matches('p');
        match (lower.as_str(), numeric) {
            ("best" | "max" | "highest", _) => Ok(Self::Best),
            ("4k" | "uhd", _) | (_, "2160") => Ok(Self::P2160),
            ("2k", _) | (_, "1440") => Ok(Self::P1440),
            ("fhd", _) | (_, "1080") => Ok(Self::P1080),
            ("hd", _) | (_, "720") => Ok(Self::P720),
            (_, "480") => Ok(Self::P480),
            (_, "360") => Ok(Self::P360),
            _ => Err(format!("unsupported quality '{value}'")),
        }
    }
}

/// Container the caller would like to receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Container {
    #[default]
    Mp4,
    Webm,
    Mkv,
}

impl Container {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::Webm => "webm",
            Self::Mkv => "mkv",
        }
    }
}

impl FromStr for Container {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mp4" | "m4v" => Ok(Self::Mp4),
            "webm" => Ok(Self::Webm),
            "mkv" | "matroska" => Ok(Self::Mkv),
            other => Err(format!("unsupported format '{other}'")),
        }
    }
}

/// How permissive a download attempt may be about formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatSelection {
    /// Best video within the ceiling, muxed with best audio, in `container`.
    Preferred { ceiling: Quality, container: Container },
    /// Best within the ceiling, whatever container the source offers.
    AnyContainer { ceiling: Quality },
    /// Best available, no constraints.
    Unconstrained,
}

impl FormatSelection {
    pub fn ceiling(&self) -> Quality {
        match self {
            Self::Preferred { ceiling, .. } | Self::AnyContainer { ceiling } => *ceiling,
            Self::Unconstrained => Quality::Best,
        }
    }

    pub fn container(&self) -> Option<Container> {
        match self {
            Self::Preferred { container, .. } => Some(*container),
            _ => None,
        }
    }
}

/// One media download handed to a backend. The backend writes
/// `output_dir/base_name.<ext>`, picking `<ext>` itself if it must.
///
/// `cancel` fires when the caller gives up on the attempt. Backends doing
/// blocking work must stop writing once it has fired.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    pub output_dir: PathBuf,
    pub base_name: String,
    pub selection: FormatSelection,
    pub cookie: Option<String>,
    pub timeout: Duration,
    pub cancel: CancellationToken,
}

/// A thumbnail candidate as reported by a backend.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawThumbnail {
    pub url: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// Metadata in the loose shape backends report it. Field names follow
/// yt-dlp's `--dump-single-json` output; the other backends map into it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BackendInfo {
    pub id: Option<String>,
    pub title: Option<String>,
    pub fulltitle: Option<String>,
    pub thumbnail: Option<String>,
    pub thumbnails: Vec<RawThumbnail>,
    pub duration: Option<f64>,
    pub uploader: Option<String>,
    pub channel: Option<String>,
    pub author_name: Option<String>,
    pub view_count: Option<u64>,
    pub upload_date: Option<String>,
    pub release_timestamp: Option<i64>,
}

#[async_trait]
pub trait AcquisitionBackend: Send + Sync {
    /// Short name used in logs and diagnostics.
    fn name(&self) -> &'static str;

    /// Cheap invocation proving the backend works; returns a version or
    /// description string.
    async fn smoke_test(&self) -> Result<String>;

    async fn fetch_metadata(&self, url: &str, timeout: Duration) -> Result<BackendInfo>;

    async fn fetch_media(&self, request: &FetchRequest) -> Result<()>;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_parses_common_spellings() {
        assert_eq!("1080p".parse::<Quality>().unwrap(), Quality::P1080);
        assert_eq!("720".parse::<Quality>().unwrap(), Quality::P720);
        assert_eq!("4K".parse::<Quality>().unwrap(), Quality::P2160);
        assert_eq!("best".parse::<Quality>().unwrap(), Quality::Best);
        assert!("1081p".parse::<Quality>().is_err());
    }

    #[test]
    fn quality_clamps_to_ceiling() {
        assert_eq!(Quality::Best.clamp_to(Quality::P1440), Quality::P1440);
        assert_eq!(Quality::P720.clamp_to(Quality::P1440), Quality::P720);
        assert_eq!(Quality::P2160.to_string(), "2160p");
        assert_eq!(Quality::Best.to_string(), "best");
    }

    #[test]
    fn container_parsing_is_case_insensitive() {
        assert_eq!("WebM".parse::<Container>().unwrap(), Container::Webm);
        assert_eq!(Container::default().extension(), "mp4");
        assert!("avi".parse::<Container>().is_err());
    }

    #[test]
    fn backend_info_accepts_partial_documents() {
        let info: BackendInfo = serde_json::from_str(
            r#"{"title":"T","duration":12.7,"thumbnails":[{"url":"u","width":1}],"extra":true}"#,
        )
        .unwrap();
        assert_eq!(info.title.as_deref(), Some("T"));
        assert_eq!(info.thumbnails.len(), 1);
        assert!(info.uploader.is_none());
    }
}
