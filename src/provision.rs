//! Provisioning strategies, tried in order by the capability provider.
//!
//! * `remote`: another vidrelay instance, when `BACKEND_URL` is set. It is then
//!   the only strategy.
//! * `installed`: a yt-dlp already on this host (configured path, managed
//!   binary directory, `PATH`).
//! * `download`: the prebuilt release asset for this OS/CPU, fetched into the
//!   managed binary directory.
//! * `package-manager`: pip/brew/apt and friends. Opt-in, it changes the host.
//! * `in-process`: the minimal HTTP backend.

use std::env;
use std::ffi::OsStr;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task;
use tracing::{debug, info, warn};

use crate::backend::{AcquisitionBackend, HttpBackend, RemoteBackend, YtDlpBackend};
use crate::capability::{Capability, CapabilityKind, ProvisionStrategy};
use crate::config::Settings;
use crate::error::{AcquireError, Result};
use crate::process::{run_with_timeout, stderr_summary};

pub const RELEASE_BASE_URL: &str = "https://github.com/yt-dlp/yt-dlp/releases/latest/download";

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);
const INSTALL_TIMEOUT: Duration = Duration::from_secs(300);

/// The strategy list for a configuration, in probing order.
pub fn default_strategies(settings: &Settings) -> Vec<Box<dyn ProvisionStrategy>> {
    if let Some(base_url) = &settings.backend_url {
        return vec![Box::new(RemoteService {
            base_url: base_url.clone(),
        })];
    }

    let mut strategies: Vec<Box<dyn ProvisionStrategy>> = vec![
        Box::new(InstalledBinary::from_settings(settings)),
        Box::new(PrebuiltDownload {
            bin_dir: settings.bin_dir.clone(),
            asset_url: release_asset(env::consts::OS, env::consts::ARCH)
                .map(|asset| format!("{RELEASE_BASE_URL}/{asset}")),
            cookies_file: settings.cookies_file.clone(),
        }),
    ];
    if settings.allow_package_install {
        strategies.push(Box::new(PackageManagerInstall {
            cookies_file: settings.cookies_file.clone(),
        }));
    }
    strategies.push(Box::new(InProcess::default()));
    strategies
}

/// Release asset name for an OS/architecture pair, as published by yt-dlp.
pub fn release_asset(os: &str, arch: &str) -> Option<&'static str> {
    match (os, arch) {
        ("linux", "x86_64") => Some("yt-dlp_linux"),
        ("linux", "aarch64") => Some("yt-dlp_linux_aarch64"),
        ("linux", "arm") => Some("yt-dlp_linux_armv7l"),
        ("macos", _) => Some("yt-dlp_macos"),
        ("windows", "x86") => Some("yt-dlp_x86.exe"),
        ("windows", _) => Some("yt-dlp.exe"),
        // Python zipapp; works wherever python3 does.
        ("freebsd" | "openbsd" | "netbsd", _) => Some("yt-dlp"),
        _ => None,
    }
}

fn binary_name() -> &'static str {
    if cfg!(windows) { "yt-dlp.exe" } else { "yt-dlp" }
}

/// Looks `bin` up in a `PATH`-style list.
pub fn find_in(paths: &OsStr, bin: &str) -> Option<PathBuf> {
    env::split_paths(paths)
        .map(|dir| dir.join(bin))
        .find(|candidate| candidate.is_file())
}

pub fn find_in_path(bin: &str) -> Option<PathBuf> {
    env::var_os("PATH").and_then(|paths| find_in(&paths, bin))
}

async fn verified(binary: PathBuf, cookies_file: Option<PathBuf>) -> Result<YtDlpBackend> {
    let backend = YtDlpBackend::new(binary).with_cookies_file(cookies_file);
    backend.smoke_test().await?;
    Ok(backend)
}

pub struct RemoteService {
    pub base_url: String,
}

#[async_trait]
impl ProvisionStrategy for RemoteService {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn provision(&self) -> Result<Capability> {
        let backend = RemoteBackend::new(&self.base_url);
        backend.smoke_test().await?;
        Ok(Capability::new(
            CapabilityKind::Remote {
                base_url: backend.base_url().to_string(),
            },
            Arc::new(backend),
        ))
    }
}

pub struct InstalledBinary {
    candidates: Vec<PathBuf>,
    managed: PathBuf,
    cookies_file: Option<PathBuf>,
}

impl InstalledBinary {
    pub fn new(candidates: Vec<PathBuf>, managed: PathBuf, cookies_file: Option<PathBuf>) -> Self {
        Self {
            candidates,
            managed,
            cookies_file,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        let managed = settings.bin_dir.join(binary_name());
        let mut candidates: Vec<PathBuf> = settings.ytdlp_path.iter().cloned().collect();
        candidates.push(managed.clone());
        candidates.extend(find_in_path(binary_name()));
        candidates.dedup();
        Self::new(candidates, managed, settings.cookies_file.clone())
    }
}

#[async_trait]
impl ProvisionStrategy for InstalledBinary {
    fn name(&self) -> &'static str {
        "installed"
    }

    async fn provision(&self) -> Result<Capability> {
        let mut failures = Vec::new();
        for candidate in self.candidates.iter().filter(|path| path.is_file()) {
            match verified(candidate.clone(), self.cookies_file.clone()).await {
                Ok(backend) => {
                    let kind = if *candidate == self.managed {
                        CapabilityKind::Downloaded {
                            binary: candidate.clone(),
                        }
                    } else {
                        CapabilityKind::Installed {
                            binary: candidate.clone(),
                        }
                    };
                    return Ok(Capability::new(kind, Arc::new(backend)));
                }
                Err(err) => {
                    debug!(candidate = %candidate.display(), "installed yt-dlp rejected: {err}");
                    failures.push(format!("{}: {err}", candidate.display()));
                }
            }
        }
        if failures.is_empty() {
            failures.push("yt-dlp not found in configured path, binary directory or PATH".into());
        }
        Err(AcquireError::CapabilityUnavailable { tried: failures })
    }
}

pub struct PrebuiltDownload {
    pub bin_dir: PathBuf,
    pub asset_url: Option<String>,
    pub cookies_file: Option<PathBuf>,
}

impl PrebuiltDownload {
    fn fetch(url: &str, target: &Path) -> Result<()> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let partial = target.with_extension("part");
        let response = ureq::AgentBuilder::new()
            .timeout(DOWNLOAD_TIMEOUT)
            .build()
            .get(url)
            .call()
            .map_err(|err| AcquireError::capability(format!("downloading {url}: {err}")))?;
        let mut file = File::create(&partial)?;
        io::copy(&mut response.into_reader(), &mut file)?;
        drop(file);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&partial, fs::Permissions::from_mode(0o755))?;
        }
        fs::rename(&partial, target)?;
        Ok(())
    }
}

#[async_trait]
impl ProvisionStrategy for PrebuiltDownload {
    fn name(&self) -> &'static str {
        "download"
    }

    async fn provision(&self) -> Result<Capability> {
        let url = self.asset_url.clone().ok_or_else(|| {
            AcquireError::capability(format!(
                "no prebuilt yt-dlp for {}/{}",
                env::consts::OS,
                env::consts::ARCH
            ))
        })?;
        let target = self.bin_dir.join(binary_name());
        info!(%url, target = %target.display(), "downloading prebuilt yt-dlp");
        {
            let target = target.clone();
            task::spawn_blocking(move || Self::fetch(&url, &target))
                .await
                .map_err(|err| AcquireError::Backend(format!("task join error: {err}")))??;
        }
        let backend = verified(target.clone(), self.cookies_file.clone()).await?;
        Ok(Capability::new(
            CapabilityKind::Downloaded { binary: target },
            Arc::new(backend),
        ))
    }
}

/// Package managers tried in order, with the arguments that install yt-dlp.
const PACKAGE_MANAGERS: &[(&str, &[&str])] = &[
    ("pip3", &["install", "--user", "--upgrade", "yt-dlp"]),
    ("pipx", &["install", "yt-dlp"]),
    ("brew", &["install", "yt-dlp"]),
    ("apt-get", &["install", "-y", "yt-dlp"]),
    ("dnf", &["install", "-y", "yt-dlp"]),
    ("pacman", &["-S", "--noconfirm", "yt-dlp"]),
    ("apk", &["add", "yt-dlp"]),
];

pub struct PackageManagerInstall {
    pub cookies_file: Option<PathBuf>,
}

fn installed_location() -> Option<PathBuf> {
    find_in_path(binary_name()).or_else(|| {
        let user_bin = env::var_os("HOME")
            .map(|home| Path::new(&home).join(".local/bin").join(binary_name()))?;
        user_bin.is_file().then_some(user_bin)
    })
}

#[async_trait]
impl ProvisionStrategy for PackageManagerInstall {
    fn name(&self) -> &'static str {
        "package-manager"
    }

    async fn provision(&self) -> Result<Capability> {
        let mut failures = Vec::new();
        for (manager, args) in PACKAGE_MANAGERS {
            let Some(program) = find_in_path(manager) else {
                continue;
            };
            info!(manager, "installing yt-dlp through the package manager");
            let args: Vec<String> = args.iter().map(|arg| arg.to_string()).collect();
            let output = match run_with_timeout(&program, &args, INSTALL_TIMEOUT).await {
                Ok(output) => output,
                Err(err) => {
                    failures.push(format!("{manager}: {err}"));
                    continue;
                }
            };
            if !output.status.success() {
                warn!(manager, "install failed: {}", stderr_summary(&output));
                failures.push(format!("{manager}: {}", stderr_summary(&output)));
                continue;
            }
            let Some(binary) = installed_location() else {
                failures.push(format!("{manager}: installed, but yt-dlp is not on PATH"));
                continue;
            };
            match verified(binary.clone(), self.cookies_file.clone()).await {
                Ok(backend) => {
                    return Ok(Capability::new(
                        CapabilityKind::PackageManager {
                            binary,
                            manager: manager.to_string(),
                        },
                        Arc::new(backend),
                    ));
                }
                Err(err) => failures.push(format!("{manager}: {err}")),
            }
        }
        if failures.is_empty() {
            failures.push("no supported package manager found".into());
        }
        Err(AcquireError::CapabilityUnavailable { tried: failures })
    }
}

#[derive(Default)]
pub struct InProcess {
    backend: HttpBackend,
}

impl InProcess {
    pub fn new(backend: HttpBackend) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl ProvisionStrategy for InProcess {
    fn name(&self) -> &'static str {
        "in-process"
    }

    async fn provision(&self) -> Result<Capability> {
        self.backend.smoke_test().await?;
        Ok(Capability::new(
            CapabilityKind::InProcess,
            Arc::new(self.backend.clone()),
        ))
    }
}
