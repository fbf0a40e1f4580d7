//! Scratch-directory bookkeeping: staging areas, promotion, companion files,
//! the age sweep and the filename rules shared by everything that writes here.
//!
//! Layout under the root:
//!
//! ```text
//! <root>/Title_1700000000.mp4             finished artifact
//! <root>/Title_1700000000.mp4.meta.json   companion record
//! <root>/.staging/<unix>-<uuid>/          one per in-flight request
//! <root>/.bin/                            managed yt-dlp binary, never swept
//! ```

use std::fmt::Display;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::error::Result;
use crate::metadata::VideoMetadata;

pub const STAGING_SUBDIR: &str = ".staging";
pub const COMPANION_SUFFIX: &str = ".meta.json";
pub const MAX_TITLE_CHARS: usize = 80;
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(60 * 60);

/// Suffixes yt-dlp (and our own HTTP backends) use for unfinished files.
const PARTIAL_SUFFIXES: &[&str] = &[".part", ".ytdl", ".temp", ".tmp"];

/// Companion record written next to every promoted artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRecord {
    pub filename: String,
    pub source_url: String,
    pub identifier: Option<String>,
    pub backend: String,
    pub strategy: String,
    pub size_bytes: u64,
    pub created_at: String,
    pub metadata: VideoMetadata,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub removed_files: usize,
    pub removed_dirs: usize,
    pub failures: usize,
}

#[derive(Debug, Clone)]
pub struct ScratchStore {
    root: PathBuf,
    bin_dir: PathBuf,
}

impl ScratchStore {
    pub fn new(root: impl Into<PathBuf>, bin_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            bin_dir: bin_dir.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn staging_root(&self) -> PathBuf {
        self.root.join(STAGING_SUBDIR)
    }

    pub fn ensure_directory(&self) -> anyhow::Result<()> {
        let staging = self.staging_root();
        fs::create_dir_all(&staging)
            .with_context(|| format!("creating scratch directory {}", staging.display()))?;
        Ok(())
    }

    /// Creates a fresh staging directory for one request. The creation time
    /// is encoded in the name so the sweep can age it without trusting mtimes
    /// that change as files come and go.
    pub fn staging_dir(&self) -> Result<PathBuf> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let dir = self.staging_root().join(format!("{now}-{}", Uuid::new_v4()));
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Best-effort removal of a staging directory and whatever is left in it.
    pub fn discard_staging(&self, dir: &Path) {
        match fs::remove_dir_all(dir) {
            Ok(()) => debug!(dir = %dir.display(), "staging directory removed"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(dir = %dir.display(), "could not remove staging directory: {err}"),
        }
    }

    /// Moves a confirmed artifact from staging into the root as
    /// `base_name.<ext>`, keeping only the staged file's extension. A taken
    /// name gets `-N` appended. Each candidate is claimed with `create_new`
    /// before the rename, so two promotions never land on the same path.
    pub fn promote(&self, staged: &Path, base_name: &str) -> Result<PathBuf> {
        let ext = staged
            .extension()
            .and_then(|ext| ext.to_str())
            .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()));
        let candidate = |counter: u32| {
            let stem = match counter {
                0 => base_name.to_string(),
                n => format!("{base_name}-{n}"),
            };
            match ext {
                Some(ext) => self.root.join(format!("{stem}.{ext}")),
                None => self.root.join(stem),
            }
        };

        let mut counter = 0;
        let target = loop {
            let target = candidate(counter);
            match OpenOptions::new().write(true).create_new(true).open(&target) {
                Ok(_) => break target,
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => counter += 1,
                Err(err) => return Err(err.into()),
            }
        };
        if let Err(err) = fs::rename(staged, &target) {
            if let Err(cleanup) = fs::remove_file(&target) {
                warn!(target = %target.display(), "could not release reserved name: {cleanup}");
            }
            return Err(err.into());
        }
        info!(artifact = %target.display(), "artifact promoted");
        Ok(target)
    }

    pub fn write_companion(&self, artifact: &Path, record: &ArtifactRecord) -> Result<PathBuf> {
        let path = companion_path(artifact);
        let json = serde_json::to_vec_pretty(record).map_err(io::Error::other)?;
        fs::write(&path, json)?;
        Ok(path)
    }

    pub fn read_companion(&self, artifact: &Path) -> Option<ArtifactRecord> {
        let raw = fs::read(companion_path(artifact)).ok()?;
        serde_json::from_slice(&raw).ok()
    }

    /// Maps a client-supplied name onto a servable file. Only the final path
    /// component is honoured, so `../../etc/passwd` becomes `passwd` inside the
    /// root. Hidden, partial and companion files are never served.
    pub fn resolve_download(&self, requested: &str) -> Option<PathBuf> {
        let name = Path::new(requested).file_name()?.to_str()?;
        if name.is_empty() || name.starts_with('.') || is_partial(name) || is_companion(name) {
            return None;
        }
        let path = self.root.join(name);
        path.is_file().then_some(path)
    }

    /// Deletes artifacts and expired staging directories older than
    /// `max_age`. Never fails: a file that vanished mid-sweep is fine, any
    /// other error is logged and counted.
    pub fn sweep_older_than(&self, max_age: Duration) -> SweepReport {
        let mut report = SweepReport::default();
        if !self.root.is_dir() {
            return report;
        }
        let now = SystemTime::now();
        let staging_root = self.staging_root();

        let walker = WalkDir::new(&self.root)
            .min_depth(1)
            .max_depth(2)
            .into_iter()
            .filter_entry(|entry| entry.path() != self.bin_dir);

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    debug!("skipping unreadable scratch entry: {err}");
                    continue;
                }
            };
            let path = entry.path();

            if entry.file_type().is_dir() {
                if path.parent() == Some(staging_root.as_path())
                    && staging_age(path, now) > max_age
                {
                    record_removal(
                        fs::remove_dir_all(path),
                        path,
                        &mut report.removed_dirs,
                        &mut report.failures,
                    );
                }
                continue;
            }

            if entry.depth() != 1 || !entry.file_type().is_file() {
                continue;
            }
            let Some(modified) = entry.metadata().ok().and_then(|meta| meta.modified().ok()) else {
                continue;
            };
            if now.duration_since(modified).unwrap_or_default() > max_age {
                record_removal(
                    fs::remove_file(path),
                    path,
                    &mut report.removed_files,
                    &mut report.failures,
                );
            }
        }

        if report != SweepReport::default() {
            info!(
                removed_files = report.removed_files,
                removed_dirs = report.removed_dirs,
                failures = report.failures,
                "scratch sweep finished"
            );
        }
        report
    }
}

fn record_removal(result: io::Result<()>, path: &Path, removed: &mut usize, failures: &mut usize) {
    match result {
        Ok(()) => {
            debug!(path = %path.display(), "swept");
            *removed += 1;
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => {
            warn!(path = %path.display(), "sweep could not remove entry: {err}");
            *failures += 1;
        }
    }
}

/// Age of a staging directory from the timestamp in its name, falling back to
/// its mtime for directories we did not name.
fn staging_age(dir: &Path, now: SystemTime) -> Duration {
    let from_name = dir
        .file_name()
        .and_then(|name| name.to_str())
        .and_then(|name| name.split_once('-'))
        .and_then(|(secs, _)| secs.parse::<u64>().ok())
        .map(|secs| UNIX_EPOCH + Duration::from_secs(secs));
    let created = from_name.or_else(|| fs::metadata(dir).and_then(|meta| meta.modified()).ok());
    created
        .and_then(|created| now.duration_since(created).ok())
        .unwrap_or_default()
}

pub fn companion_path(artifact: &Path) -> PathBuf {
    let mut name = artifact.as_os_str().to_os_string();
    name.push(COMPANION_SUFFIX);
    PathBuf::from(name)
}

pub fn is_companion(name: &str) -> bool {
    name.ends_with(COMPANION_SUFFIX)
}

pub fn is_partial(name: &str) -> bool {
    PARTIAL_SUFFIXES.iter().any(|suffix| name.ends_with(suffix)) || name.contains(".part-Frag")
}

/// True when `name` is `base` itself or `base.<anything>`.
pub fn shares_base_name(name: &str, base_name: &str) -> bool {
    name.strip_prefix(base_name)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('.'))
}

/// Filesystem-safe base name: ASCII alphanumerics, `-` and `_` survive,
/// whitespace runs collapse to `_`, everything else is dropped. The result is
/// capped, never empty, and suffixed with `_{disambiguator}`.
pub fn sanitize_and_unique_filename(title: &str, disambiguator: impl Display) -> String {
    let mut cleaned = String::with_capacity(title.len());
    for ch in title.trim().chars() {
        if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
            cleaned.push(ch);
        } else if ch.is_whitespace() && !cleaned.ends_with('_') {
            cleaned.push('_');
        }
    }
    let mut cleaned: String = cleaned.trim_matches('_').chars().take(MAX_TITLE_CHARS).collect();
    if cleaned.is_empty() {
        cleaned.push_str("video");
    }
    format!("{cleaned}_{disambiguator}")
}

/// Deletes every file in `dir` sharing `base_name` (other than `keep`) plus
/// any partial download. Returns how many files went away.
pub fn remove_sibling_artifacts(dir: &Path, base_name: &str, keep: &Path) -> usize {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(dir = %dir.display(), "cannot list directory for cleanup: {err}");
            return 0;
        }
    };
    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if path == keep || !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        if !(shares_base_name(name, base_name) || is_partial(name)) {
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "removed residual artifact");
                removed += 1;
            }
            Err(err) => warn!(path = %path.display(), "could not remove residual artifact: {err}"),
        }
    }
    removed
}

/// Size rendered the way the download summary reports it, e.g. `0.01 MB`.
pub fn human_size(bytes: u64) -> String {
    format!("{:.2} MB", bytes as f64 / (1024.0 * 1024.0))
}
