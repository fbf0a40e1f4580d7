//! The fallback chain that turns a URL into exactly one file on disk.
//!
//! Strategies run in a fixed order, each progressively less picky about
//! formats. A strategy only counts as successful once a file is actually
//! found in the staging directory: first under the expected name, then any
//! file sharing the base name, then (last resort) whatever landed in the
//! staging directory during the last few seconds. After a success every other
//! file sharing the base name is removed.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tokio::{task, time};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backend::{AcquisitionBackend, Container, FetchRequest, FormatSelection, Quality};
use crate::error::{AcquireError, Result};
use crate::storage::{is_companion, is_partial, remove_sibling_artifacts, shares_base_name};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    Primary,
    Secondary,
    Tertiary,
}

impl StrategyKind {
    pub const ORDER: [StrategyKind; 3] = [Self::Primary, Self::Secondary, Self::Tertiary];

    pub fn selection(self, ceiling: Quality, container: Container) -> FormatSelection {
        match self {
            Self::Primary => FormatSelection::Preferred { ceiling, container },
            Self::Secondary => FormatSelection::AnyContainer { ceiling },
            Self::Tertiary => FormatSelection::Unconstrained,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
            Self::Tertiary => "tertiary",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Per-strategy deadlines and the last-resort recency window.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub primary_timeout: Duration,
    pub secondary_timeout: Duration,
    pub tertiary_timeout: Duration,
    pub recent_window: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            primary_timeout: Duration::from_secs(300),
            secondary_timeout: Duration::from_secs(180),
            tertiary_timeout: Duration::from_secs(120),
            recent_window: Duration::from_secs(30),
        }
    }
}

impl OrchestratorConfig {
    fn timeout_for(&self, kind: StrategyKind) -> Duration {
        match kind {
            StrategyKind::Primary => self.primary_timeout,
            StrategyKind::Secondary => self.secondary_timeout,
            StrategyKind::Tertiary => self.tertiary_timeout,
        }
    }
}

/// Everything one acquisition needs to know.
#[derive(Debug, Clone)]
pub struct DownloadPlan {
    pub url: String,
    pub staging_dir: PathBuf,
    pub base_name: String,
    pub ceiling: Quality,
    pub container: Container,
    pub cookie: Option<String>,
}

#[derive(Debug)]
pub enum AttemptOutcome {
    Success(PathBuf),
    /// The stage failed but a later one may still work. `file_missing` marks
    /// the "reported success, produced nothing" kind.
    Recoverable { message: String, file_missing: bool },
    Fatal(AcquireError),
}

#[derive(Debug)]
pub struct DownloadAttemptResult {
    pub strategy: StrategyKind,
    pub outcome: AttemptOutcome,
}

impl DownloadAttemptResult {
    fn diagnostic(&self) -> String {
        let detail = match &self.outcome {
            AttemptOutcome::Success(path) => format!("ok ({})", path.display()),
            AttemptOutcome::Recoverable { message, .. } => message.clone(),
            AttemptOutcome::Fatal(err) => err.to_string(),
        };
        format!("{}: {detail}", self.strategy)
    }
}

/// A confirmed artifact and how it was obtained.
#[derive(Debug)]
pub struct Acquisition {
    pub path: PathBuf,
    pub strategy: StrategyKind,
    pub attempts: Vec<DownloadAttemptResult>,
}

#[derive(Debug, Clone, Default)]
pub struct DownloadOrchestrator {
    config: OrchestratorConfig,
}

impl DownloadOrchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self { config }
    }

    pub async fn run(
        &self,
        backend: &dyn AcquisitionBackend,
        plan: &DownloadPlan,
    ) -> Result<Acquisition> {
        let mut attempts: Vec<DownloadAttemptResult> =
            Vec::with_capacity(StrategyKind::ORDER.len());

        for kind in StrategyKind::ORDER {
            info!(
                strategy = %kind,
                backend = backend.name(),
                base = %plan.base_name,
                "starting download stage"
            );
            let outcome = self.attempt(backend, plan, kind).await;
            match outcome {
                AttemptOutcome::Success(path) => {
                    info!(strategy = %kind, path = %path.display(), "download stage succeeded");
                    attempts.push(DownloadAttemptResult {
                        strategy: kind,
                        outcome: AttemptOutcome::Success(path.clone()),
                    });
                    return Ok(Acquisition {
                        path,
                        strategy: kind,
                        attempts,
                    });
                }
                AttemptOutcome::Fatal(err) => {
                    warn!(strategy = %kind, "download stage failed fatally: {err}");
                    return Err(err);
                }
                AttemptOutcome::Recoverable { message, file_missing } => {
                    warn!(strategy = %kind, "download stage failed: {message}");
                    attempts.push(DownloadAttemptResult {
                        strategy: kind,
                        outcome: AttemptOutcome::Recoverable { message, file_missing },
                    });
                }
            }
        }

        let diagnostics: Vec<String> =
            attempts.iter().map(DownloadAttemptResult::diagnostic).collect();
        match attempts.pop().map(|attempt| attempt.outcome) {
            Some(AttemptOutcome::Recoverable { file_missing: true, .. }) => {
                Err(AcquireError::FileNotFoundAfterDownload {
                    base_name: plan.base_name.clone(),
                    attempts: diagnostics,
                })
            }
            Some(AttemptOutcome::Recoverable { message, .. }) => {
                Err(AcquireError::AcquisitionFailed {
                    last_error: message,
                    attempts: diagnostics,
                })
            }
            _ => Err(AcquireError::AcquisitionFailed {
                last_error: "no download strategy ran".into(),
                attempts: diagnostics,
            }),
        }
    }

    async fn attempt(
        &self,
        backend: &dyn AcquisitionBackend,
        plan: &DownloadPlan,
        kind: StrategyKind,
    ) -> AttemptOutcome {
        let timeout = self.config.timeout_for(kind);
        let cancel = CancellationToken::new();
        // Anything still running for this stage stops once the stage is over,
        // however it ends.
        let _abandon = cancel.clone().drop_guard();
        let request = FetchRequest {
            url: plan.url.clone(),
            output_dir: plan.staging_dir.clone(),
            base_name: plan.base_name.clone(),
            selection: kind.selection(plan.ceiling, plan.container),
            cookie: plan.cookie.clone(),
            timeout,
            cancel: cancel.clone(),
        };

        // The backend enforces the deadline itself; this outer bound covers
        // backends that do not.
        let fetched = match time::timeout(timeout, backend.fetch_media(&request)).await {
            Ok(result) => result,
            Err(_) => {
                cancel.cancel();
                Err(AcquireError::Timeout(timeout.as_secs()))
            }
        };
        match fetched {
            Ok(()) => {}
            Err(
                err @ (AcquireError::Validation(_) | AcquireError::CapabilityUnavailable { .. }),
            ) => {
                return AttemptOutcome::Fatal(err);
            }
            Err(err) => {
                return AttemptOutcome::Recoverable {
                    message: err.to_string(),
                    file_missing: false,
                };
            }
        }

        let dir = plan.staging_dir.clone();
        let base = plan.base_name.clone();
        let ext = plan.container.extension();
        let window = self.config.recent_window;
        let located = task::spawn_blocking(move || {
            let found = locate_artifact(&dir, &base, ext, window)?;
            remove_sibling_artifacts(&dir, &base, &found);
            Some(found)
        })
        .await;

        match located {
            Ok(Some(path)) => AttemptOutcome::Success(path),
            Ok(None) => AttemptOutcome::Recoverable {
                message: format!("no file named {}.* was produced", plan.base_name),
                file_missing: true,
            },
            Err(err) => AttemptOutcome::Recoverable {
                message: format!("artifact scan failed: {err}"),
                file_missing: true,
            },
        }
    }
}

/// Finds the file a successful stage produced.
///
/// 1. `base_name.preferred_ext` when present.
/// 2. Otherwise files starting with the base name (partials and companions
///    excluded), newest first.
/// 3. Otherwise the newest file in `dir` modified within `recent_window`.
pub fn locate_artifact(
    dir: &Path,
    base_name: &str,
    preferred_ext: &str,
    recent_window: Duration,
) -> Option<PathBuf> {
    let expected = dir.join(format!("{base_name}.{preferred_ext}"));
    if expected.is_file() {
        return Some(expected);
    }

    let mut files: Vec<(String, PathBuf, SystemTime)> = fs::read_dir(dir)
        .ok()?
        .flatten()
        .filter_map(|entry| {
            let path = entry.path();
            let name = path.file_name()?.to_str()?.to_owned();
            let meta = entry.metadata().ok()?;
            if !meta.is_file() || is_partial(&name) || is_companion(&name) {
                return None;
            }
            Some((name, path, meta.modified().ok()?))
        })
        .collect();
    files.sort_by(|a, b| b.2.cmp(&a.2));

    let named = files.iter().find(|(name, ..)| shares_base_name(name, base_name));
    if let Some((name, path, _)) = named {
        info!(file = %name, "recovered artifact under an unexpected name");
        return Some(path.clone());
    }

    let now = SystemTime::now();
    let recent = files.into_iter().find(|(_, _, modified)| {
        now.duration_since(*modified)
            .map(|age| age <= recent_window)
            .unwrap_or(true)
    });
    if let Some((name, path, _)) = recent {
        warn!(file = %name, "adopting most recent file in staging directory");
        return Some(path);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::{MediaStep, ScriptedBackend, serve};
    use crate::backend::{BackendInfo, HttpBackend};
    use anyhow::Result;
    use axum::{Json, Router, routing::get, routing::post};
    use serde_json::json;
    use std::fs::File;
    use tempfile::tempdir;

    fn plan(dir: &Path) -> DownloadPlan {
        DownloadPlan {
            url: "https://www.youtube.com/watch?v=dQw4w9WgXcQ".into(),
            staging_dir: dir.to_path_buf(),
            base_name: "Title_12345".into(),
            ceiling: Quality::P1080,
            container: Container::Mp4,
            cookie: None,
        }
    }

    fn file_names(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .flatten()
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn primary_success_leaves_one_artifact() -> Result<()> {
        let dir = tempdir()?;
        fs::write(dir.path().join("Title_12345.f251.webm"), b"audio")?;
        let backend =
            ScriptedBackend::titled("Title", vec![MediaStep::Write { ext: "mp4", bytes: 64 }]);

        let acquisition = DownloadOrchestrator::default().run(&backend, &plan(dir.path())).await?;
        assert_eq!(acquisition.strategy, StrategyKind::Primary);
        assert_eq!(acquisition.path, dir.path().join("Title_12345.mp4"));
        assert_eq!(file_names(dir.path()), vec!["Title_12345.mp4"]);
        Ok(())
    }

    #[tokio::test]
    async fn falls_back_and_removes_primary_residue() -> Result<()> {
        let dir = tempdir()?;
        let backend = ScriptedBackend::titled(
            "Title",
            vec![
                MediaStep::Partial { message: "HTTP Error 403" },
                MediaStep::Write { ext: "mp4", bytes: 64 },
            ],
        );

        let acquisition = DownloadOrchestrator::default().run(&backend, &plan(dir.path())).await?;
        assert_eq!(acquisition.strategy, StrategyKind::Secondary);
        assert_eq!(acquisition.attempts.len(), 2);
        assert_eq!(file_names(dir.path()), vec!["Title_12345.mp4"]);
        assert_eq!(
            *backend.seen.lock(),
            vec![
                StrategyKind::Primary.selection(Quality::P1080, Container::Mp4),
                StrategyKind::Secondary.selection(Quality::P1080, Container::Mp4),
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn recovery_adopts_other_extension() -> Result<()> {
        let dir = tempdir()?;
        let backend =
            ScriptedBackend::titled("Title", vec![MediaStep::Write { ext: "webm", bytes: 64 }]);

        let acquisition = DownloadOrchestrator::default().run(&backend, &plan(dir.path())).await?;
        assert_eq!(acquisition.path, dir.path().join("Title_12345.webm"));
        Ok(())
    }

    #[test]
    fn last_resort_only_considers_recent_files() -> Result<()> {
        let dir = tempdir()?;
        let stale = dir.path().join("stale.mkv");
        fs::write(&stale, b"old")?;
        File::options()
            .write(true)
            .open(&stale)?
            .set_modified(SystemTime::now() - Duration::from_secs(600))?;
        let window = Duration::from_secs(30);
        assert_eq!(locate_artifact(dir.path(), "Title_12345", "mp4", window), None);

        let renamed = dir.path().join("Some Other Name.mkv");
        fs::write(&renamed, b"new")?;
        fs::write(dir.path().join("ignored.mp4.part"), b"partial")?;
        assert_eq!(locate_artifact(dir.path(), "Title_12345", "mp4", window), Some(renamed));
        Ok(())
    }

    #[tokio::test]
    async fn fatal_errors_stop_the_chain() {
        let dir = tempdir().unwrap();
        let backend = ScriptedBackend::titled(
            "Title",
            vec![MediaStep::Reject("Private video"), MediaStep::Write { ext: "mp4", bytes: 1 }],
        );
        let err = DownloadOrchestrator::default()
            .run(&backend, &plan(dir.path()))
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert_eq!(backend.seen.lock().len(), 1);

        let backend = ScriptedBackend::titled("Title", vec![MediaStep::Missing]);
        let err = DownloadOrchestrator::default()
            .run(&backend, &plan(dir.path()))
            .await
            .unwrap_err();
        assert!(matches!(err, AcquireError::CapabilityUnavailable { .. }));
    }

    #[tokio::test]
    async fn exhaustion_reports_last_error_and_every_attempt() {
        let dir = tempdir().unwrap();
        let backend = ScriptedBackend::titled(
            "Title",
            vec![MediaStep::Fail("first"), MediaStep::Fail("second"), MediaStep::Fail("third")],
        );
        let err = DownloadOrchestrator::default()
            .run(&backend, &plan(dir.path()))
            .await
            .unwrap_err();
        match err {
            AcquireError::AcquisitionFailed { last_error, attempts } => {
                assert!(last_error.ends_with("third"), "{last_error}");
                assert_eq!(attempts.len(), 3);
                assert!(attempts[0].starts_with("primary: "));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn silent_success_without_file_is_its_own_kind() {
        let dir = tempdir().unwrap();
        let backend = ScriptedBackend::titled(
            "Title",
            vec![MediaStep::Fail("x"), MediaStep::Fail("y"), MediaStep::Vanish],
        );
        let err = DownloadOrchestrator::default()
            .run(&backend, &plan(dir.path()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AcquireError::FileNotFoundAfterDownload { ref base_name, .. }
                if base_name == "Title_12345"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn stage_timeout_advances_the_chain() -> Result<()> {
        struct Hanging;

        #[async_trait::async_trait]
        impl AcquisitionBackend for Hanging {
            fn name(&self) -> &'static str {
                "hanging"
            }
            async fn smoke_test(&self) -> crate::error::Result<String> {
                Ok(String::new())
            }
            async fn fetch_metadata(
                &self,
                _: &str,
                _: Duration,
            ) -> crate::error::Result<BackendInfo> {
                Err(AcquireError::Backend("unused".into()))
            }
            async fn fetch_media(&self, request: &FetchRequest) -> crate::error::Result<()> {
                if request.selection == FormatSelection::Unconstrained {
                    let target = request.output_dir.join(format!("{}.mp4", request.base_name));
                    fs::write(target, b"ok")?;
                    return Ok(());
                }
                std::future::pending().await
            }
        }

        let dir = tempdir()?;
        let acquisition = DownloadOrchestrator::default().run(&Hanging, &plan(dir.path())).await?;
        assert_eq!(acquisition.strategy, StrategyKind::Tertiary);
        assert!(acquisition.attempts[0].diagnostic().contains("timed out after 300s"));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn timed_out_stages_leave_nothing_behind() -> Result<()> {
        let base = serve(|base| {
            Router::new()
                .route(
                    "/player",
                    post(move || async move {
                        time::sleep(Duration::from_millis(700)).await;
                        Json(json!({
                            "playabilityStatus": {"status": "OK"},
                            "streamingData": {"formats": [
                                {
                                    "url": format!("{base}/media"),
                                    "mimeType": "video/mp4",
                                    "height": 360
                                }
                            ]}
                        }))
                    }),
                )
                .route(
                    "/media",
                    get(|| async {
                        time::sleep(Duration::from_millis(700)).await;
                        vec![7u8; 4096]
                    }),
                )
        })
        .await;
        let backend = HttpBackend::with_endpoints("", format!("{base}/player"), "");
        let orchestrator = DownloadOrchestrator::new(OrchestratorConfig {
            primary_timeout: Duration::from_secs(1),
            secondary_timeout: Duration::from_secs(1),
            tertiary_timeout: Duration::from_secs(1),
            ..OrchestratorConfig::default()
        });

        let dir = tempdir()?;
        let err = orchestrator.run(&backend, &plan(dir.path())).await.unwrap_err();
        assert!(matches!(err, AcquireError::AcquisitionFailed { .. }), "{err:?}");

        // Give any stray blocking work time to finish.
        time::sleep(Duration::from_millis(1500)).await;
        assert!(file_names(dir.path()).is_empty(), "{:?}", file_names(dir.path()));
        Ok(())
    }
}
