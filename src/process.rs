//! Child-process helper shared by the binary-backed acquisition paths.

use std::io;
use std::path::Path;
use std::process::{Output, Stdio};
use std::time::Duration;

use tokio::process::Command;
use tokio::time;
use tracing::debug;

use crate::error::{AcquireError, Result};

/// Longest stderr excerpt carried into error messages.
const STDERR_EXCERPT: usize = 600;

/// Runs `program args…` to completion and captures its output. When the
/// deadline passes the child is killed (the future owning it is dropped with
/// `kill_on_drop`) and `AcquireError::Timeout` is returned. A program that
/// cannot be found maps to `CapabilityUnavailable` so callers can tell a
/// vanished binary apart from a failed run.
pub async fn run_with_timeout(
    program: &Path,
    args: &[String],
    timeout: Duration,
) -> Result<Output> {
    debug!(program = %program.display(), ?args, "spawning");
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    match time::timeout(timeout, command.output()).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(err)) if err.kind() == io::ErrorKind::NotFound => Err(AcquireError::capability(
            format!("{} not found", program.display()),
        )),
        Ok(Err(err)) => Err(err.into()),
        Err(_) => Err(AcquireError::Timeout(timeout.as_secs())),
    }
}

/// The tail of stderr, trimmed to something that fits in a log line or an
/// API error. Falls back to the exit status when stderr is empty.
pub fn stderr_summary(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        return format!("exited with {}", output.status);
    }
    let error_lines: Vec<&str> = trimmed
        .lines()
        .filter(|line| line.starts_with("ERROR"))
        .collect();
    let text = if error_lines.is_empty() {
        trimmed.to_string()
    } else {
        error_lines.join("\n")
    };
    if text.len() <= STDERR_EXCERPT {
        return text;
    }
    let mut start = text.len() - STDERR_EXCERPT;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("…{}", &text[start..])
}
