#![forbid(unsafe_code)]

//! Deletes expired artifacts and abandoned staging directories from the
//! scratch directory. Meant for cron when the server's own sweep is not
//! running.

use anyhow::{Context, Result, anyhow, bail};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;
use vidrelay::config::{BIN_SUBDIR, load_settings};
use vidrelay::storage::{DEFAULT_MAX_AGE, ScratchStore};

#[derive(Debug, Clone, Default)]
struct SweepArgs {
    scratch_dir: Option<PathBuf>,
    max_age: Option<Duration>,
}

impl SweepArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(env::args().skip(1))
    }

    #[cfg(test)]
    fn from_slice(values: &[&str]) -> Result<Self> {
        Self::from_iter(values.iter().map(|value| value.to_string()))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut parsed = Self::default();
        let mut args = iter.into_iter();

        while let Some(arg) = args.next() {
            let (flag, inline) = match arg.split_once('=') {
                Some((flag, value)) if flag.starts_with("--") => {
                    (flag.to_string(), Some(value.to_string()))
                }
                _ => (arg.clone(), None),
            };
            let mut value = || {
                inline
                    .clone()
                    .or_else(|| args.next())
                    .ok_or_else(|| anyhow!("{flag} requires a value"))
            };
            match flag.as_str() {
                "--scratch-dir" => parsed.scratch_dir = Some(PathBuf::from(value()?)),
                "--max-age-minutes" => {
                    let raw = value()?;
                    let minutes: u64 = raw
                        .parse()
                        .with_context(|| format!("invalid --max-age-minutes value: {raw}"))?;
                    let secs = minutes
                        .checked_mul(60)
                        .ok_or_else(|| anyhow!("--max-age-minutes value too large: {raw}"))?;
                    parsed.max_age = Some(Duration::from_secs(secs));
                }
                _ => bail!("unknown argument: {arg}"),
            }
        }

        Ok(parsed)
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("vidrelay=info,sweep_scratch=info")),
        )
        .init();

    let args = SweepArgs::parse()?;
    let settings = load_settings().context("loading configuration")?;
    let (root, bin_dir) = match args.scratch_dir {
        Some(dir) => (dir.clone(), dir.join(BIN_SUBDIR)),
        None => (settings.scratch_dir, settings.bin_dir),
    };
    let max_age = args.max_age.unwrap_or(DEFAULT_MAX_AGE);

    info!(root = %root.display(), max_age_secs = max_age.as_secs(), "sweeping scratch directory");
    let report = ScratchStore::new(root, bin_dir).sweep_older_than(max_age);
    println!(
        "Removed {} file(s) and {} staging director(ies); {} failure(s).",
        report.removed_files, report.removed_dirs, report.failures
    );
    if report.failures > 0 {
        bail!("{} entries could not be removed", report.failures);
    }
    Ok(())
}
