use anyhow::{Context, Result, anyhow};
use std::{
    env, fs,
    path::{Path, PathBuf},
};

use crate::backend::Quality;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/vidrelay-env";
pub const CONFIG_PATH_ENV: &str = "VIDRELAY_CONFIG";
pub const DEFAULT_VIDRELAY_PORT: u16 = 8080;
pub const DEFAULT_VIDRELAY_HOST: &str = "127.0.0.1";
pub const DEV_SCRATCH_DIR: &str = "temp";
pub const PROD_SCRATCH_SUBDIR: &str = "vidrelay";
pub const BIN_SUBDIR: &str = ".bin";

/// Keys accepted both in the env file and as process environment variables.
const KNOWN_KEYS: &[&str] = &[
    "SCRATCH_DIR",
    "DEPLOYMENT",
    "BACKEND_URL",
    "MAX_QUALITY",
    "YTDLP_PATH",
    "COOKIES_FILE",
    "ALLOW_PACKAGE_INSTALL",
    "VIDRELAY_HOST",
    "VIDRELAY_PORT",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Deployment {
    #[default]
    Development,
    Production,
}

#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    pub scratch_dir: Option<PathBuf>,
    pub deployment: Option<Deployment>,
    pub backend_url: Option<String>,
    pub max_quality: Option<Quality>,
    pub ytdlp_path: Option<PathBuf>,
    pub cookies_file: Option<PathBuf>,
    pub allow_package_install: Option<bool>,
    pub vidrelay_host: Option<String>,
    pub vidrelay_port: Option<u16>,
}

/// Fully resolved runtime settings handed to the acquisition pipeline.
#[derive(Debug, Clone)]
pub struct Settings {
    pub scratch_dir: PathBuf,
    pub bin_dir: PathBuf,
    pub deployment: Deployment,
    pub backend_url: Option<String>,
    pub max_quality: Quality,
    pub ytdlp_path: Option<PathBuf>,
    pub cookies_file: Option<PathBuf>,
    pub allow_package_install: bool,
    pub vidrelay_host: String,
    pub vidrelay_port: u16,
}

impl Settings {
    /// Settings rooted at an explicit scratch directory, everything else at
    /// its default. Handy for the CLI tools and tests.
    pub fn with_scratch_dir(scratch_dir: impl Into<PathBuf>) -> Self {
        let scratch_dir = scratch_dir.into();
        Self {
            bin_dir: scratch_dir.join(BIN_SUBDIR),
            scratch_dir,
            deployment: Deployment::Development,
            backend_url: None,
            max_quality: Quality::default(),
            ytdlp_path: None,
            cookies_file: None,
            allow_package_install: false,
            vidrelay_host: DEFAULT_VIDRELAY_HOST.to_string(),
            vidrelay_port: DEFAULT_VIDRELAY_PORT,
        }
    }
}

impl EnvConfig {
    fn apply(&mut self, key: &str, value: &str, origin: &str) -> Result<()> {
        let value = value.trim().trim_matches('"');
        if value.is_empty() {
            return Ok(());
        }
        match key {
            "SCRATCH_DIR" => self.scratch_dir = Some(PathBuf::from(value)),
            "DEPLOYMENT" => {
                self.deployment = Some(match value.to_ascii_lowercase().as_str() {
                    "production" | "prod" | "packaged" => Deployment::Production,
                    "development" | "dev" => Deployment::Development,
                    other => return Err(anyhow!("Unknown DEPLOYMENT '{other}' in {origin}")),
                })
            }
            "BACKEND_URL" => self.backend_url = Some(value.trim_end_matches('/').to_string()),
            "MAX_QUALITY" => {
                let quality = value
                    .parse()
                    .map_err(|err| anyhow!("Parsing MAX_QUALITY from {origin}: {err}"))?;
                self.max_quality = Some(quality);
            }
            "YTDLP_PATH" => self.ytdlp_path = Some(PathBuf::from(value)),
            "COOKIES_FILE" => self.cookies_file = Some(PathBuf::from(value)),
            "ALLOW_PACKAGE_INSTALL" => self.allow_package_install = Some(parse_flag(value)),
            "VIDRELAY_HOST" => self.vidrelay_host = Some(value.to_string()),
            "VIDRELAY_PORT" => {
                let port: u16 = value
                    .parse()
                    .with_context(|| format!("Parsing VIDRELAY_PORT from {origin}"))?;
                self.vidrelay_port = Some(port);
            }
            _ => {}
        }
        Ok(())
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

pub fn read_env_config(path: &Path) -> Result<Option<EnvConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    let origin = path.display().to_string();
    let mut cfg = EnvConfig::default();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if let Some((key, value_raw)) = trimmed.split_once('=') {
            cfg.apply(key.trim(), value_raw, &origin)?;
        }
    }
    Ok(Some(cfg))
}

/// Reads the env file named by `VIDRELAY_CONFIG` (or the default path) and
/// lets process environment variables override it.
pub fn load_settings() -> Result<Settings> {
    let path = env::var(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
    let file = read_env_config(&path)?;
    resolve_settings(file, |key| env::var(key).ok())
}

pub fn resolve_settings<F>(file: Option<EnvConfig>, lookup: F) -> Result<Settings>
where
    F: Fn(&str) -> Option<String>,
{
    let mut cfg = file.unwrap_or_default();
    for key in KNOWN_KEYS {
        if let Some(value) = lookup(key) {
            cfg.apply(key, &value, "environment")?;
        }
    }

    let deployment = cfg.deployment.unwrap_or_default();
    let scratch_dir = cfg.scratch_dir.unwrap_or_else(|| match deployment {
        Deployment::Development => PathBuf::from(DEV_SCRATCH_DIR),
        Deployment::Production => env::temp_dir().join(PROD_SCRATCH_SUBDIR),
    });

    Ok(Settings {
        bin_dir: scratch_dir.join(BIN_SUBDIR),
        scratch_dir,
        deployment,
        backend_url: cfg.backend_url,
        max_quality: cfg.max_quality.unwrap_or_default(),
        ytdlp_path: cfg.ytdlp_path,
        cookies_file: cfg.cookies_file,
        allow_package_install: cfg.allow_package_install.unwrap_or(false),
        vidrelay_host: cfg
            .vidrelay_host
            .unwrap_or_else(|| DEFAULT_VIDRELAY_HOST.to_string()),
        vidrelay_port: cfg.vidrelay_port.unwrap_or(DEFAULT_VIDRELAY_PORT),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn read_env_config_extracts_port_and_quality() {
        let cfg = make_config(
            "# scratch\nSCRATCH_DIR=\"/srv/scratch\"\n\
             VIDRELAY_PORT=\"4242\"\nMAX_QUALITY=\"1440p\"\n",
        );
        let parsed = read_env_config(cfg.path()).unwrap().unwrap();
        assert_eq!(parsed.vidrelay_port, Some(4242));
        assert_eq!(parsed.max_quality, Some(Quality::P1440));
        assert_eq!(parsed.scratch_dir, Some(PathBuf::from("/srv/scratch")));
    }

    #[test]
    fn read_env_config_rejects_bad_port() {
        let cfg = make_config("VIDRELAY_PORT=\"http\"\n");
        assert!(read_env_config(cfg.path()).is_err());
    }

    #[test]
    fn missing_file_falls_back_to_development_defaults() {
        let missing = Path::new("/definitely/not/here/vidrelay-env");
        let settings = resolve_settings(read_env_config(missing).unwrap(), no_env).unwrap();
        assert_eq!(settings.deployment, Deployment::Development);
        assert_eq!(settings.scratch_dir, PathBuf::from(DEV_SCRATCH_DIR));
        assert_eq!(settings.bin_dir, PathBuf::from(DEV_SCRATCH_DIR).join(BIN_SUBDIR));
        assert_eq!(settings.vidrelay_port, DEFAULT_VIDRELAY_PORT);
        assert_eq!(settings.max_quality, Quality::default());
        assert!(!settings.allow_package_install);
    }

    #[test]
    fn production_uses_system_temp() {
        let cfg = make_config("DEPLOYMENT=\"production\"\n");
        let settings =
            resolve_settings(read_env_config(cfg.path()).unwrap(), no_env).unwrap();
        assert_eq!(settings.scratch_dir, env::temp_dir().join(PROD_SCRATCH_SUBDIR));
    }

    #[test]
    fn environment_overrides_file_values() {
        let cfg = make_config("VIDRELAY_HOST=\"127.0.0.1\"\nBACKEND_URL=\"http://a/\"\n");
        let env: HashMap<&str, &str> = HashMap::from([
            ("VIDRELAY_HOST", "0.0.0.0"),
            ("ALLOW_PACKAGE_INSTALL", "yes"),
        ]);
        let settings = resolve_settings(read_env_config(cfg.path()).unwrap(), |key| {
            env.get(key).map(|v| v.to_string())
        })
        .unwrap();
        assert_eq!(settings.vidrelay_host, "0.0.0.0");
        assert_eq!(settings.backend_url.as_deref(), Some("http://a"));
        assert!(settings.allow_package_install);
    }
}
