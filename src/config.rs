//! Host configuration.
//!
//! Read once at startup from `config.json` in the app data dir. Every field has
//! a default, so a missing or partial file is fine. A few environment variables
//! override the file for quick local debugging.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::persistent::ShellTarget;

pub const CONFIG_FILE_NAME: &str = "config.json";

/// Full path to the CLI binary, bypassing PATH lookup.
pub const CLI_PATH_ENV: &str = "DASH_CLI_PATH";
/// Shell used for fallback terminals instead of `$SHELL`.
pub const SHELL_ENV: &str = "DASH_SHELL";
/// WSL distribution hosting the persistent command session.
pub const WSL_DISTRO_ENV: &str = "DASH_WSL_DISTRO";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AppConfig {
    pub terminal: TerminalConfig,
    pub snapshots: SnapshotConfig,
    pub persistent_shell: PersistentShellConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TerminalConfig {
    /// Program name looked up on PATH for the direct spawn path.
    pub cli_program: String,
    /// Explicit CLI location; wins over PATH lookup.
    pub cli_path: Option<PathBuf>,
    /// Login shell for fallback terminals. `None` means `$SHELL`.
    pub shell: Option<String>,
    /// Rewrite the CLI's startup banner logo in direct-spawn output.
    pub rewrite_banner: bool,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            cli_program: "claude".to_string(),
            cli_path: None,
            shell: None,
            rewrite_banner: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SnapshotConfig {
    pub max_snapshot_bytes: u64,
    pub max_total_bytes: u64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            max_snapshot_bytes: crate::snapshot::MAX_SNAPSHOT_BYTES,
            max_total_bytes: crate::snapshot::MAX_TOTAL_BYTES,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PersistentShellConfig {
    /// Explicit target. Takes precedence over `distribution`.
    pub target: Option<ShellTarget>,
    /// WSL distribution to keep warm.
    pub distribution: Option<String>,
    pub startup_timeout_ms: u64,
}

impl Default for PersistentShellConfig {
    fn default() -> Self {
        Self {
            target: None,
            distribution: None,
            startup_timeout_ms: 120_000,
        }
    }
}

impl PersistentShellConfig {
    /// The shell to keep warm, if any is configured.
    pub fn resolved_target(&self) -> Option<ShellTarget> {
        if let Some(target) = &self.target {
            return Some(target.clone());
        }
        self.distribution
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(|d| ShellTarget::Wsl {
                distribution: d.to_string(),
            })
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }
}

impl AppConfig {
    /// Load `config.json` from `dir` (defaults when absent) and apply
    /// environment overrides.
    pub fn load(dir: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load_file(&dir.join(CONFIG_FILE_NAME))?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(path) = non_empty(CLI_PATH_ENV) {
            self.terminal.cli_path = Some(PathBuf::from(path));
        }
        if let Some(shell) = non_empty(SHELL_ENV) {
            self.terminal.shell = Some(shell);
        }
        if let Some(distro) = non_empty(WSL_DISTRO_ENV) {
            self.persistent_shell.distribution = Some(distro);
        }
    }
}
