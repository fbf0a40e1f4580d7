//! Error taxonomy shared by the acquisition pipeline.
//!
//! Only the variants near the top of the enum ever reach an HTTP client. The
//! plumbing variants (`Timeout`, `Backend`, `Io`) are produced by individual
//! backend calls and absorbed by the orchestrator, which folds them into
//! `AcquisitionFailed` once every strategy has been tried.

use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, AcquireError>;

#[derive(Error, Debug)]
pub enum AcquireError {
    /// The input is not something we can download (bad URL, private or
    /// removed video). User-correctable.
    #[error("{0}")]
    Validation(String),

    /// No acquisition backend could be provisioned, or the one in use
    /// disappeared.
    #[error("no acquisition backend is available (tried: {})", tried.join("; "))]
    CapabilityUnavailable { tried: Vec<String> },

    /// Every download strategy was attempted and none produced a file.
    #[error("download failed after {} attempt(s): {last_error}", attempts.len())]
    AcquisitionFailed {
        last_error: String,
        attempts: Vec<String>,
    },

    /// A strategy reported success but no artifact could be located.
    #[error("download reported success but no file named {base_name}.* was produced")]
    FileNotFoundAfterDownload {
        base_name: String,
        attempts: Vec<String>,
    },

    #[error("timed out after {0}s")]
    Timeout(u64),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl AcquireError {
    pub fn capability(reason: impl Into<String>) -> Self {
        Self::CapabilityUnavailable {
            tried: vec![reason.into()],
        }
    }

    /// Per-attempt diagnostics, when the error carries any.
    pub fn attempts(&self) -> &[String] {
        match self {
            Self::AcquisitionFailed { attempts, .. }
            | Self::FileNotFoundAfterDownload { attempts, .. } => attempts,
            Self::CapabilityUnavailable { tried } => tried,
            _ => &[],
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}
