#![forbid(unsafe_code)]

//! Shared security helpers used by the vidrelay binaries.

use anyhow::{Result, bail};
use nix::unistd::Uid;

/// Fails fast when a binary is started as root. The server spawns yt-dlp with
/// user-supplied URLs and writes into a shared scratch directory, so it is
/// expected to run under an unprivileged service account.
pub fn ensure_not_root(process: &str) -> Result<()> {
    if Uid::current().is_root() {
        bail!("{process} must not be run as root; start it from an unprivileged account");
    }
    Ok(())
}
