//! Acquisition capability: which backend is usable right now.
//!
//! [`CapabilityProvider`] walks an ordered list of [`ProvisionStrategy`]s the
//! first time anyone asks, and caches the outcome, success or failure, until
//! [`CapabilityProvider::invalidate`] is called. Concurrent first callers wait
//! on the same probe instead of racing to install yt-dlp twice.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::{error, info, warn};

use crate::backend::AcquisitionBackend;
use crate::config::Settings;
use crate::error::{AcquireError, Result};
use crate::provision;

/// How the active backend was obtained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "strategy", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum CapabilityKind {
    Installed { binary: PathBuf },
    Downloaded { binary: PathBuf },
    PackageManager { binary: PathBuf, manager: String },
    InProcess,
    Remote { base_url: String },
}

/// A verified backend plus the record of how it was provisioned.
#[derive(Clone)]
pub struct Capability {
    kind: CapabilityKind,
    backend: Arc<dyn AcquisitionBackend>,
}

impl Capability {
    pub fn new(kind: CapabilityKind, backend: Arc<dyn AcquisitionBackend>) -> Self {
        Self { kind, backend }
    }

    pub fn kind(&self) -> &CapabilityKind {
        &self.kind
    }

    pub fn backend(&self) -> &dyn AcquisitionBackend {
        self.backend.as_ref()
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capability")
            .field("kind", &self.kind)
            .field("backend", &self.backend.name())
            .finish()
    }
}

/// One way of getting a working backend. Implementations verify what they
/// produce (smoke test) before returning it.
#[async_trait]
pub trait ProvisionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn provision(&self) -> Result<Capability>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum ProviderState {
    Uninitialized,
    Probing,
    Ready { capability: CapabilityKind },
    Unavailable { tried: Vec<String> },
}

type ProbeOutcome = std::result::Result<Capability, Vec<String>>;

/// One probing generation. `invalidate` swaps in a fresh slot; callers still
/// holding the old one finish against it undisturbed.
#[derive(Default)]
struct ProbeSlot {
    outcome: OnceCell<ProbeOutcome>,
    probing: AtomicBool,
}

struct ProbingFlag<'a>(&'a AtomicBool);

impl<'a> ProbingFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for ProbingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct CapabilityProvider {
    strategies: Vec<Box<dyn ProvisionStrategy>>,
    slot: RwLock<Arc<ProbeSlot>>,
}

impl CapabilityProvider {
    pub fn new(strategies: Vec<Box<dyn ProvisionStrategy>>) -> Self {
        Self {
            strategies,
            slot: RwLock::new(Arc::new(ProbeSlot::default())),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(provision::default_strategies(settings))
    }

    /// Names of the configured strategies, in probing order.
    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|strategy| strategy.name()).collect()
    }

    /// Returns the active capability, probing on first use.
    pub async fn ensure(&self) -> Result<Capability> {
        let slot = self.slot.read().clone();
        let outcome = slot
            .outcome
            .get_or_init(|| self.probe(&slot.probing))
            .await;
        match outcome {
            Ok(capability) => Ok(capability.clone()),
            Err(tried) => Err(AcquireError::CapabilityUnavailable {
                tried: tried.clone(),
            }),
        }
    }

    /// Forgets the cached outcome; the next `ensure` probes again.
    pub fn invalidate(&self) {
        info!("acquisition capability invalidated");
        *self.slot.write() = Arc::new(ProbeSlot::default());
    }

    pub fn state(&self) -> ProviderState {
        let slot = self.slot.read().clone();
        match slot.outcome.get() {
            Some(Ok(capability)) => ProviderState::Ready {
                capability: capability.kind().clone(),
            },
            Some(Err(tried)) => ProviderState::Unavailable {
                tried: tried.clone(),
            },
            None if slot.probing.load(Ordering::SeqCst) => ProviderState::Probing,
            None => ProviderState::Uninitialized,
        }
    }

    async fn probe(&self, probing: &AtomicBool) -> ProbeOutcome {
        let _flag = ProbingFlag::raise(probing);
        let mut tried = Vec::with_capacity(self.strategies.len());
        for strategy in &self.strategies {
            info!(strategy = strategy.name(), "probing acquisition strategy");
            match strategy.provision().await {
                Ok(capability) => {
                    info!(
                        strategy = strategy.name(),
                        kind = ?capability.kind(),
                        "acquisition capability ready"
                    );
                    return Ok(capability);
                }
                Err(err) => {
                    let reason = failure_reason(&err);
                    warn!(strategy = strategy.name(), "strategy unavailable: {reason}");
                    tried.push(format!("{}: {reason}", strategy.name()));
                }
            }
        }
        if tried.is_empty() {
            tried.push("no provisioning strategies configured".to_string());
        }
        error!(tried = ?tried, "no acquisition backend could be provisioned");
        Err(tried)
    }
}

fn failure_reason(err: &AcquireError) -> String {
    match err {
        AcquireError::CapabilityUnavailable { tried } => tried.join("; "),
        other => other.to_string(),
    }
}
