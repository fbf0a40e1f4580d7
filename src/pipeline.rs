//! The request pipeline: validate, provision, describe, download, store.
//!
//! [`Acquirer`] is the one service the HTTP layer and the CLI tools share.
//! Housekeeping (sweeps, companion files, staging removal) is best effort and
//! only ever logs.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::task;
use tracing::{info, warn};

use crate::backend::{Container, Quality};
use crate::capability::{Capability, CapabilityProvider, ProviderState};
use crate::config::Settings;
use crate::error::{AcquireError, Result};
use crate::identifier::{ResourceIdentifier, canonical_watch_url, extract_identifier};
use crate::metadata::{VideoMetadata, fetch_metadata, synthetic_metadata};
use crate::orchestrator::{DownloadOrchestrator, DownloadPlan};
use crate::storage::{
    ArtifactRecord, DEFAULT_MAX_AGE, ScratchStore, SweepReport, human_size,
    sanitize_and_unique_filename,
};

/// Source of the filename disambiguator (unix seconds by default).
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DownloadRequest {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub quality: Option<String>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub cookie: Option<String>,
}

impl DownloadRequest {
    pub fn for_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadSummary {
    pub title: String,
    pub filename: String,
    pub thumbnail: String,
    pub duration: u64,
    pub uploader: String,
    pub file_size: String,
}

pub struct Acquirer {
    settings: Settings,
    provider: Arc<CapabilityProvider>,
    store: ScratchStore,
    orchestrator: DownloadOrchestrator,
    clock: Clock,
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or_default()
}

/// Trims the input and extracts its video identifier.
pub fn validate_url(input: &str) -> Result<ResourceIdentifier> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(AcquireError::Validation("URL is required".into()));
    }
    extract_identifier(trimmed).ok_or_else(|| {
        AcquireError::Validation(format!("unsupported or invalid video URL: {trimmed}"))
    })
}

impl Acquirer {
    pub fn new(settings: Settings, provider: Arc<CapabilityProvider>) -> Self {
        let store = ScratchStore::new(&settings.scratch_dir, &settings.bin_dir);
        Self {
            settings,
            provider,
            store,
            orchestrator: DownloadOrchestrator::default(),
            clock: Arc::new(unix_now),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_orchestrator(mut self, orchestrator: DownloadOrchestrator) -> Self {
        self.orchestrator = orchestrator;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> &ScratchStore {
        &self.store
    }

    pub fn capability_state(&self) -> ProviderState {
        self.provider.state()
    }

    /// Creates the scratch layout. Called once at startup.
    pub fn prepare(&self) -> anyhow::Result<()> {
        self.store.ensure_directory()
    }

    /// Metadata for `url`. Only an invalid URL is an error; an unavailable
    /// backend yields the synthetic record.
    pub async fn describe(&self, url: &str) -> Result<VideoMetadata> {
        let id = validate_url(url)?;
        match self.provider.ensure().await {
            Ok(capability) => {
                let url = canonical_watch_url(&id);
                Ok(fetch_metadata(Some(capability.backend()), &url).await)
            }
            Err(err) => {
                warn!("describing without a backend: {err}");
                Ok(synthetic_metadata(id.as_str()))
            }
        }
    }

    pub async fn acquire(&self, request: &DownloadRequest) -> Result<DownloadSummary> {
        let id = validate_url(&request.url)?;
        let ceiling = match request.quality.as_deref().filter(|value| !value.trim().is_empty()) {
            Some(value) => value.parse::<Quality>().map_err(AcquireError::Validation)?,
            None => self.settings.max_quality,
        }
        .clamp_to(self.settings.max_quality);
        let container = match request.format.as_deref().filter(|value| !value.trim().is_empty()) {
            Some(value) => value.parse::<Container>().map_err(AcquireError::Validation)?,
            None => Container::default(),
        };
        let cookie = request
            .cookie
            .as_deref()
            .map(str::trim)
            .filter(|cookie| !cookie.is_empty())
            .map(str::to_string);

        self.sweep(DEFAULT_MAX_AGE).await;

        let capability = self.provider.ensure().await?;
        match self.acquire_with(&capability, &id, ceiling, container, cookie.clone()).await {
            Err(AcquireError::CapabilityUnavailable { tried }) => {
                warn!(tried = ?tried, "backend became unavailable mid-request; re-provisioning");
                self.provider.invalidate();
                let capability = self.provider.ensure().await?;
                self.acquire_with(&capability, &id, ceiling, container, cookie).await
            }
            other => other,
        }
    }

    async fn acquire_with(
        &self,
        capability: &Capability,
        id: &ResourceIdentifier,
        ceiling: Quality,
        container: Container,
        cookie: Option<String>,
    ) -> Result<DownloadSummary> {
        let backend = capability.backend();
        let url = canonical_watch_url(id);

        let metadata = fetch_metadata(Some(backend), &url).await;
        let base_name = sanitize_and_unique_filename(&metadata.title, (self.clock)());
        let staging_dir = self.store.staging_dir()?;
        let plan = DownloadPlan {
            url: url.clone(),
            staging_dir: staging_dir.clone(),
            base_name,
            ceiling,
            container,
            cookie,
        };
        info!(%id, %ceiling, backend = backend.name(), "acquiring");

        let outcome = self.orchestrator.run(backend, &plan).await;
        let acquisition = match outcome {
            Ok(acquisition) => acquisition,
            Err(err) => {
                self.store.discard_staging(&staging_dir);
                return Err(err);
            }
        };
        let promoted = self.store.promote(&acquisition.path, &plan.base_name);
        self.store.discard_staging(&staging_dir);
        let artifact = promoted?;

        let filename = artifact
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let size_bytes = std::fs::metadata(&artifact).map(|meta| meta.len()).unwrap_or(0);

        let record = ArtifactRecord {
            filename: filename.clone(),
            source_url: url,
            identifier: Some(id.to_string()),
            backend: backend.name().to_string(),
            strategy: acquisition.strategy.to_string(),
            size_bytes,
            created_at: Utc::now().to_rfc3339(),
            metadata: metadata.clone(),
        };
        if let Err(err) = self.store.write_companion(&artifact, &record) {
            warn!(artifact = %artifact.display(), "could not write companion record: {err}");
        }

        info!(%filename, strategy = %acquisition.strategy, size_bytes, "download complete");
        Ok(DownloadSummary {
            title: metadata.title,
            filename,
            thumbnail: metadata.thumbnail_url,
            duration: metadata.duration_seconds,
            uploader: metadata.uploader_name,
            file_size: human_size(size_bytes),
        })
    }

    /// Age sweep of the scratch directory, off the async runtime.
    pub async fn sweep(&self, max_age: Duration) -> SweepReport {
        let store = self.store.clone();
        match task::spawn_blocking(move || store.sweep_older_than(max_age)).await {
            Ok(report) => report,
            Err(err) => {
                warn!("scratch sweep task failed: {err}");
                SweepReport::default()
            }
        }
    }
}
