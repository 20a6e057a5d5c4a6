//! Bridge bootstrap configuration.
//!
//! Stored as TOML at `<config dir>/hassdash/bridge.toml`. The hub URL and
//! token here only seed the settings record in the store; once saved there,
//! the stored values are used.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use hassdash_connection::{ConnectOptions, DeploymentMode, endpoint};

/// Environment variable overriding `hub_url`.
pub const ENV_URL: &str = "HASSDASH_URL";
/// Environment variable overriding `token`.
pub const ENV_TOKEN: &str = "HASSDASH_TOKEN";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// `card`, `panel` or `ingress`.
    pub mode: DeploymentMode,
    /// Directory holding the history store.
    pub data_dir: PathBuf,
    /// Hub address. In ingress mode, the origin that serves the dashboard.
    pub hub_url: String,
    /// Long-lived access token. Ignored in ingress mode.
    pub token: String,
    /// Overrides the mode's reconnect cap.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_reconnect_attempts: Option<u32>,
    /// `tracing` filter used when `RUST_LOG` is unset.
    pub log_filter: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            mode: DeploymentMode::default(),
            data_dir: default_data_dir(),
            hub_url: String::new(),
            token: String::new(),
            max_reconnect_attempts: None,
            log_filter: "info".into(),
        }
    }
}

impl AppConfig {
    /// Reads the config at `path`, falling back to defaults when the file
    /// does not exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    /// Writes the config as TOML with owner-only permissions.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)
            .with_context(|| format!("writing {}", path.display()))?;
        set_permissions_0600(path);
        Ok(())
    }

    /// Applies `HASSDASH_URL` / `HASSDASH_TOKEN` from the process environment.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(url) = lookup(ENV_URL).filter(|v| !v.is_empty()) {
            self.hub_url = url;
        }
        if let Some(token) = lookup(ENV_TOKEN).filter(|v| !v.is_empty()) {
            self.token = token;
        }
        self
    }

    /// Connection options for the bridge bootstrap.
    pub fn connect_options(&self) -> anyhow::Result<ConnectOptions> {
        let (url, token) = match self.mode {
            DeploymentMode::Ingress if self.hub_url.is_empty() => (String::new(), String::new()),
            DeploymentMode::Ingress => (endpoint::ingress_url(&self.hub_url)?, String::new()),
            DeploymentMode::Card | DeploymentMode::Panel => {
                (self.hub_url.clone(), self.token.clone())
            }
        };

        let mut options = ConnectOptions::new(url, token).with_mode(self.mode);
        if let Some(max) = self.max_reconnect_attempts {
            options = options.with_max_attempts(Some(max));
        }
        Ok(options)
    }
}

fn set_permissions_0600(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
}

/// Default config file location: `<config dir>/hassdash/bridge.toml`.
pub fn config_path() -> anyhow::Result<PathBuf> {
    Ok(config_base_dir()?.join("hassdash").join("bridge.toml"))
}

fn default_data_dir() -> PathBuf {
    config_base_dir()
        .map(|dir| dir.join("hassdash").join("data"))
        .unwrap_or_else(|_| PathBuf::from("hassdash-data"))
}

fn config_base_dir() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        let appdata = std::env::var("APPDATA").context("APPDATA is not set")?;
        Ok(PathBuf::from(appdata))
    }

    #[cfg(not(target_os = "windows"))]
    {
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME")
            && !xdg.is_empty()
        {
            return Ok(PathBuf::from(xdg));
        }
        let home = std::env::var("HOME").context("HOME is not set")?;
        Ok(PathBuf::from(home).join(".config"))
    }
}
