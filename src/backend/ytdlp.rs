//! yt-dlp as an acquisition backend.
//!
//! The binary path is part of the value: whichever provisioning strategy found
//! or installed yt-dlp hands its path over here, and nothing else needs to know
//! where it lives.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{AcquisitionBackend, BackendInfo, Container, FetchRequest, FormatSelection};
use crate::error::{AcquireError, Result};
use crate::process::{run_with_timeout, stderr_summary};

const VERSION_TIMEOUT: Duration = Duration::from_secs(15);

/// stderr fragments meaning no strategy will ever succeed for this URL.
const FATAL_MARKERS: &[&str] = &[
    "Private video",
    "Video unavailable",
    "This video has been removed",
    "This video is no longer available",
    "account associated with this video has been terminated",
    "Unsupported URL",
    "is not a valid URL",
];

#[derive(Debug, Clone)]
pub struct YtDlpBackend {
    binary: PathBuf,
    cookies_file: Option<PathBuf>,
}

impl YtDlpBackend {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            cookies_file: None,
        }
    }

    /// Netscape cookie jar passed with `--cookies` when it exists.
    pub fn with_cookies_file(mut self, cookies_file: Option<PathBuf>) -> Self {
        self.cookies_file = cookies_file;
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    fn common_args(&self, args: &mut Vec<String>) {
        args.extend(
            ["--no-warnings", "--no-progress", "--no-playlist"]
                .into_iter()
                .map(String::from),
        );
        if let Some(cookies) = self.cookies_file.as_ref().filter(|path| path.exists()) {
            args.push("--cookies".into());
            args.push(cookies.to_string_lossy().into_owned());
        }
    }

    fn metadata_args(&self, url: &str) -> Vec<String> {
        let mut args = vec!["--dump-single-json".into(), "--skip-download".into()];
        self.common_args(&mut args);
        args.push(url.into());
        args
    }

    fn download_args(&self, request: &FetchRequest) -> Vec<String> {
        let (format, merge) = format_spec(request.selection);
        let template = request
            .output_dir
            .join(format!("{}.%(ext)s", request.base_name));
        let mut args = vec![
            "--format".into(),
            format,
            "--output".into(),
            template.to_string_lossy().into_owned(),
            // Keep the file's mtime at download time; the recovery scan and
            // the age sweep both rely on it.
            "--no-mtime".into(),
            "--socket-timeout".into(),
            "30".into(),
            "--retries".into(),
            "3".into(),
        ];
        if let Some(container) = merge {
            args.push("--merge-output-format".into());
            args.push(container.extension().into());
        }
        if let Some(cookie) = request.cookie.as_deref().filter(|value| !value.trim().is_empty()) {
            args.push("--add-header".into());
            args.push(format!("Cookie:{}", cookie.trim()));
        }
        self.common_args(&mut args);
        args.push(request.url.clone());
        args
    }
}

/// yt-dlp `--format` expression for a selection, plus the container to merge
/// into when the selection insists on one.
pub fn format_spec(selection: FormatSelection) -> (String, Option<Container>) {
    let height = |ceiling: super::Quality| {
        ceiling
            .height()
            .map(|h| format!("[height<={h}]"))
            .unwrap_or_default()
    };
    match selection {
        FormatSelection::Preferred { ceiling, container } => {
            let h = height(ceiling);
            let spec = match container {
                Container::Mp4 => format!("bv*{h}[ext=mp4]+ba[ext=m4a]/b{h}[ext=mp4]"),
                Container::Webm => format!("bv*{h}[ext=webm]+ba[ext=webm]/b{h}[ext=webm]"),
                Container::Mkv => format!("bv*{h}+ba/b{h}"),
            };
            (spec, Some(container))
        }
        FormatSelection::AnyContainer { ceiling } => {
            let h = height(ceiling);
            (format!("bv*{h}+ba/b{h}"), None)
        }
        FormatSelection::Unconstrained => ("bv*+ba/b".into(), None),
    }
}

/// Turns a failed run into the error kind the orchestrator acts on.
fn classify_failure(summary: String) -> AcquireError {
    if FATAL_MARKERS.iter().any(|marker| summary.contains(marker)) {
        AcquireError::Validation(summary)
    } else {
        AcquireError::Backend(summary)
    }
}

#[async_trait]
impl AcquisitionBackend for YtDlpBackend {
    fn name(&self) -> &'static str {
        "yt-dlp"
    }

    async fn smoke_test(&self) -> Result<String> {
        let output =
            run_with_timeout(&self.binary, &["--version".to_string()], VERSION_TIMEOUT).await?;
        if !output.status.success() {
            return Err(AcquireError::capability(format!(
                "{} --version failed: {}",
                self.binary.display(),
                stderr_summary(&output)
            )));
        }
        let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!(binary = %self.binary.display(), %version, "yt-dlp responded");
        Ok(version)
    }

    async fn fetch_metadata(&self, url: &str, timeout: Duration) -> Result<BackendInfo> {
        let output = run_with_timeout(&self.binary, &self.metadata_args(url), timeout).await?;
        if !output.status.success() {
            return Err(classify_failure(stderr_summary(&output)));
        }
        serde_json::from_slice(&output.stdout)
            .map_err(|err| AcquireError::Backend(format!("unparseable metadata JSON: {err}")))
    }

    async fn fetch_media(&self, request: &FetchRequest) -> Result<()> {
        let args = self.download_args(request);
        let output = run_with_timeout(&self.binary, &args, request.timeout).await?;
        if !output.status.success() {
            return Err(classify_failure(stderr_summary(&output)));
        }
        debug!(base = %request.base_name, "yt-dlp exited cleanly");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Quality;
    use anyhow::Result;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    fn install_ytdlp_stub(dir: &Path, body: &str) -> Result<PathBuf> {
        let script_path = dir.join("yt-dlp");
        let script = format!(
            r##"#!/usr/bin/env bash
set -euo pipefail
prev=""
output=""
for arg in "$@"; do
    if [[ "$prev" == "--output" ]]; then
        output="$arg"
    fi
    prev="$arg"
done
printf '%s\n' "$@" > "$(dirname "$0")/last-args"
{body}
"##
        );
        fs::write(&script_path, script)?;
        let mut perms = fs::metadata(&script_path)?.permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&script_path, perms)?;
        Ok(script_path)
    }

    const WORKING: &str = r##"
if [[ " $* " == *" --version "* ]]; then
    echo "2024.12.13"
    exit 0
fi
if [[ " $* " == *" --dump-single-json "* ]]; then
cat <<'JSON'
{"id":"dQw4w9WgXcQ","title":"Stub Title","duration":212.4,"uploader":"Stub",
 "thumbnails":[{"url":"https://i/1.jpg","width":120,"height":90}]}
JSON
exit 0
fi
target=$(printf '%s' "$output" | sed 's/%(ext)s/webm/')
printf 'media' > "$target"
"##;

    fn request(dir: &Path, selection: FormatSelection) -> FetchRequest {
        FetchRequest {
            url: "https://www.youtube.com/watch?v=dQw4w9WgXcQ".into(),
            output_dir: dir.to_path_buf(),
            base_name: "Stub_Title_1".into(),
            selection,
            cookie: Some("SID=abc".into()),
            timeout: Duration::from_secs(10),
            cancel: tokio_util::sync::CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn smoke_test_reports_version() -> Result<()> {
        let dir = tempdir()?;
        let backend = YtDlpBackend::new(install_ytdlp_stub(dir.path(), WORKING)?);
        assert_eq!(backend.smoke_test().await?, "2024.12.13");
        Ok(())
    }

    #[tokio::test]
    async fn metadata_is_parsed_from_dump_json() -> Result<()> {
        let dir = tempdir()?;
        let backend = YtDlpBackend::new(install_ytdlp_stub(dir.path(), WORKING)?);
        let info = backend
            .fetch_metadata("https://youtu.be/dQw4w9WgXcQ", Duration::from_secs(10))
            .await?;
        assert_eq!(info.title.as_deref(), Some("Stub Title"));
        assert_eq!(info.thumbnails.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn download_passes_template_format_and_cookie() -> Result<()> {
        let dir = tempdir()?;
        let work = tempdir()?;
        let backend = YtDlpBackend::new(install_ytdlp_stub(dir.path(), WORKING)?);
        let selection = FormatSelection::Preferred {
            ceiling: Quality::P720,
            container: Container::Mp4,
        };
        backend.fetch_media(&request(work.path(), selection)).await?;

        assert!(work.path().join("Stub_Title_1.webm").exists());
        let args = fs::read_to_string(dir.path().join("last-args"))?;
        let args: Vec<&str> = args.lines().collect();
        let after = |flag: &str| {
            args.iter()
                .position(|arg| *arg == flag)
                .map(|idx| args[idx + 1].to_string())
        };
        assert_eq!(
            after("--format").as_deref(),
            Some("bv*[height<=720][ext=mp4]+ba[ext=m4a]/b[height<=720][ext=mp4]")
        );
        assert_eq!(after("--merge-output-format").as_deref(), Some("mp4"));
        assert_eq!(after("--add-header").as_deref(), Some("Cookie:SID=abc"));
        assert!(args.contains(&"--no-mtime"));
        assert_eq!(args.last(), Some(&"https://www.youtube.com/watch?v=dQw4w9WgXcQ"));
        Ok(())
    }

    #[tokio::test]
    async fn private_video_is_a_validation_error() -> Result<()> {
        let dir = tempdir()?;
        let stub = install_ytdlp_stub(
            dir.path(),
            "echo 'ERROR: [youtube] dQw4w9WgXcQ: Private video. Sign in' >&2\nexit 1",
        )?;
        let err = YtDlpBackend::new(stub)
            .fetch_media(&request(dir.path(), FormatSelection::Unconstrained))
            .await
            .unwrap_err();
        assert!(err.is_validation(), "{err}");
        Ok(())
    }

    #[tokio::test]
    async fn network_failure_is_recoverable() -> Result<()> {
        let dir = tempdir()?;
        let stub = install_ytdlp_stub(
            dir.path(),
            "echo 'ERROR: unable to download video data: HTTP Error 403: Forbidden' >&2\nexit 1",
        )?;
        let err = YtDlpBackend::new(stub)
            .fetch_media(&request(dir.path(), FormatSelection::Unconstrained))
            .await
            .unwrap_err();
        assert!(matches!(err, AcquireError::Backend(ref msg) if msg.contains("403")));
        Ok(())
    }

    #[test]
    fn format_specs_relax_per_selection() {
        let (any, merge) = format_spec(FormatSelection::AnyContainer {
            ceiling: Quality::P1080,
        });
        assert_eq!(any, "bv*[height<=1080]+ba/b[height<=1080]");
        assert!(merge.is_none());

        let (best, _) = format_spec(FormatSelection::Preferred {
            ceiling: Quality::Best,
            container: Container::Webm,
        });
        assert_eq!(best, "bv*[ext=webm]+ba[ext=webm]/b[ext=webm]");
        assert_eq!(format_spec(FormatSelection::Unconstrained).0, "bv*+ba/b");
    }
}
