//! Deadline and cancellation for backends that do blocking HTTP.
//!
//! Blocking work outlives the future that spawned it, so an abandoned attempt
//! would otherwise keep writing into the staging directory. Every call made
//! during one attempt draws on the same deadline, the copy loop polls the
//! attempt's cancellation token, and partial files carry a per-attempt name.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use super::FetchRequest;
use crate::error::{AcquireError, Result};

const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub(crate) struct AttemptBudget {
    deadline: Instant,
    timeout: Duration,
    cancel: CancellationToken,
}

impl AttemptBudget {
    pub(crate) fn start(request: &FetchRequest) -> Self {
        Self {
            deadline: Instant::now() + request.timeout,
            timeout: request.timeout,
            cancel: request.cancel.clone(),
        }
    }

    /// Fails once the attempt is cancelled or out of time.
    pub(crate) fn check(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(AcquireError::Backend("attempt abandoned".into()));
        }
        if Instant::now() >= self.deadline {
            return Err(AcquireError::Timeout(self.timeout.as_secs()));
        }
        Ok(())
    }

    /// Time left for the next blocking call.
    pub(crate) fn remaining(&self) -> Result<Duration> {
        self.check()?;
        Ok(self.deadline.saturating_duration_since(Instant::now()))
    }

    /// Copies `reader` into `target` through an attempt-unique partial file.
    /// Nothing is left behind when the copy fails or the attempt is
    /// abandoned.
    pub(crate) fn stream_to_file(&self, reader: impl Read, target: &Path) -> Result<u64> {
        let partial = partial_path(target);
        let copied = self.copy_into(reader, &partial).and_then(|written| {
            self.check()?;
            fs::rename(&partial, target)?;
            Ok(written)
        });
        if copied.is_err() {
            match fs::remove_file(&partial) {
                Ok(()) => debug!(partial = %partial.display(), "discarded partial download"),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    debug!(partial = %partial.display(), "could not discard partial: {err}")
                }
            }
        }
        copied
    }

    fn copy_into(&self, mut reader: impl Read, partial: &Path) -> Result<u64> {
        let mut file = File::create(partial)?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut written = 0u64;
        loop {
            self.check()?;
            let read = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(read) => read,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.check()?;
                    return Err(err.into());
                }
            };
            file.write_all(&buf[..read])?;
            written += read as u64;
        }
        file.flush()?;
        Ok(written)
    }
}

fn partial_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!("{name}.{}.part", Uuid::new_v4().simple()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::FormatSelection;
    use anyhow::Result;
    use tempfile::tempdir;

    fn request(dir: &Path, timeout: Duration) -> FetchRequest {
        FetchRequest {
            url: "https://youtu.be/dQw4w9WgXcQ".into(),
            output_dir: dir.to_path_buf(),
            base_name: "Clip_1".into(),
            selection: FormatSelection::Unconstrained,
            cookie: None,
            timeout,
            cancel: CancellationToken::new(),
        }
    }

    /// Reader that cancels its attempt after the first chunk.
    struct CancelAfterFirst {
        token: CancellationToken,
        served: bool,
    }

    impl Read for CancelAfterFirst {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.served {
                return Ok(buf.len().min(16));
            }
            self.served = true;
            self.token.cancel();
            buf[..4].copy_from_slice(b"data");
            Ok(4)
        }
    }

    #[test]
    fn completed_copy_lands_under_the_target_name() -> Result<()> {
        let dir = tempdir()?;
        let budget = AttemptBudget::start(&request(dir.path(), Duration::from_secs(5)));
        let target = dir.path().join("Clip_1.mp4");
        assert_eq!(budget.stream_to_file(&b"0123456789"[..], &target)?, 10);
        assert_eq!(fs::read(&target)?, b"0123456789");
        assert_eq!(fs::read_dir(dir.path())?.count(), 1);
        Ok(())
    }

    #[test]
    fn cancelled_copy_leaves_nothing_behind() -> Result<()> {
        let dir = tempdir()?;
        let request = request(dir.path(), Duration::from_secs(5));
        let budget = AttemptBudget::start(&request);
        let reader = CancelAfterFirst {
            token: request.cancel.clone(),
            served: false,
        };
        let target = dir.path().join("Clip_1.mp4");
        assert!(budget.stream_to_file(reader, &target).is_err());
        assert_eq!(fs::read_dir(dir.path())?.count(), 0);
        Ok(())
    }

    #[test]
    fn exhausted_budget_reports_a_timeout() -> Result<()> {
        let dir = tempdir()?;
        let budget = AttemptBudget::start(&request(dir.path(), Duration::ZERO));
        assert!(matches!(budget.remaining(), Err(AcquireError::Timeout(0))));
        Ok(())
    }

    #[test]
    fn partial_names_are_unique_per_attempt() {
        let target = Path::new("/scratch/Clip_1.mp4");
        let first = partial_path(target);
        assert_ne!(first, partial_path(target));
        let name = first.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("Clip_1.mp4.") && name.ends_with(".part"));
    }
}
