pub mod banner;
pub mod cli_detect;
mod decode;
pub mod env;
mod portable_pty_backend;
pub mod session_manager;

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, trace};

use crate::arch::cli::CliLocator;
use crate::arch::shell;
use crate::config::TerminalConfig;
use crate::terminal::portable_pty_backend::PortablePtyBackend;
use crate::terminal::session_manager::{
    PtySessionBackend, PtySink, RecordInfo, SpawnEnv, SpawnMode, SpawnSpec,
};

pub(crate) use decode::Utf8Carry;

/// Host -> UI output chunk for one PTY.
pub const PTY_DATA_EVENT: &str = "pty:data";
/// Host -> UI exit notice for one PTY; the record is gone once this is sent.
pub const PTY_EXIT_EVENT: &str = "pty:exit";

const DEFAULT_COLS: u16 = 120;
const DEFAULT_ROWS: u16 = 30;

#[derive(Debug, Error)]
pub enum TerminalError {
    #[error("terminal session not found")]
    NotFound,
    #[error("{program} not found on PATH")]
    ToolNotFound { program: String },
    #[error("failed to spawn {program}: {reason}")]
    Spawn { program: String, reason: String },
    #[error("terminal backend error: {0}")]
    Backend(String),
}

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PtyDataEvent {
    pub session_id: String,
    pub data: String,
}

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PtyExitEvent {
    pub session_id: String,
    pub exit_code: u32,
    pub signal: Option<String>,
}

/// Request for the direct CLI spawn path.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StartDirect {
    pub id: String,
    pub cwd: PathBuf,
    pub cols: u16,
    pub rows: u16,
    #[serde(default)]
    pub auto_approve: bool,
    #[serde(default)]
    pub resume: bool,
}

/// Request for the login shell spawn path.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StartShell {
    pub id: String,
    pub cwd: PathBuf,
    pub cols: u16,
    pub rows: u16,
}

fn dims(cols: u16, rows: u16) -> (u16, u16) {
    (
        if cols == 0 { DEFAULT_COLS } else { cols },
        if rows == 0 { DEFAULT_ROWS } else { rows },
    )
}

/// Process-wide table of live PTYs keyed by caller-assigned id.
///
/// Owned by the app state; IPC handlers borrow it.
pub struct PtyRegistry {
    backend: Arc<dyn PtySessionBackend>,
    locator: CliLocator,
    config: TerminalConfig,
}

impl PtyRegistry {
    pub fn new(config: TerminalConfig) -> Self {
        Self::with_backend(config, Arc::new(PortablePtyBackend::new()))
    }

    pub fn with_backend(config: TerminalConfig, backend: Arc<dyn PtySessionBackend>) -> Self {
        let locator = CliLocator::new(config.cli_program.clone(), config.cli_path.clone());
        Self {
            backend,
            locator,
            config,
        }
    }

    pub fn cli_locator(&self) -> &CliLocator {
        &self.locator
    }

    /// Launch the CLI itself with a minimal allow-listed environment.
    ///
    /// Fails with `ToolNotFound` when the binary cannot be resolved; the caller
    /// decides whether to fall back to [`PtyRegistry::start`].
    pub fn start_direct(
        &self,
        req: StartDirect,
        owner: Option<Arc<dyn PtySink>>,
    ) -> Result<(), TerminalError> {
        let Some(program) = self.locator.resolve() else {
            debug!(id = %req.id, program = self.locator.program(), "cli not found");
            return Err(TerminalError::ToolNotFound {
                program: self.locator.program().to_string(),
            });
        };
        let (cols, rows) = dims(req.cols, req.rows);
        let spec = SpawnSpec {
            id: req.id,
            mode: SpawnMode::DirectCli,
            cwd: req.cwd,
            cols,
            rows,
            program: program.to_string_lossy().to_string(),
            args: env::direct_cli_args(req.auto_approve, req.resume),
            env: SpawnEnv::Exact(env::direct_env(
                |k| std::env::var(k).ok(),
                dirs::home_dir(),
            )),
            filter_banner: self.config.rewrite_banner,
        };
        self.backend.spawn(spec, owner)
    }

    /// Launch the user's interactive login shell with the ambient environment.
    pub fn start(&self, req: StartShell, owner: Option<Arc<dyn PtySink>>) -> Result<(), TerminalError> {
        let sh = shell::login_shell_command(self.config.shell.as_deref());
        let (cols, rows) = dims(req.cols, req.rows);
        let spec = SpawnSpec {
            id: req.id,
            mode: SpawnMode::LoginShell,
            cwd: req.cwd,
            cols,
            rows,
            program: sh.program,
            args: sh.args,
            env: SpawnEnv::Inherit {
                remove: env::SCRUBBED_VARS.iter().map(|k| k.to_string()).collect(),
                set: vec![
                    ("TERM".to_string(), env::TERM.to_string()),
                    ("COLORTERM".to_string(), env::COLORTERM.to_string()),
                ],
            },
            filter_banner: false,
        };
        self.backend.spawn(spec, owner)
    }

    /// Unknown ids and write failures are ignored.
    pub fn write(&self, id: &str, data: &str) {
        if let Err(e) = self.backend.write(id, data) {
            trace!(%id, error = %e, "pty write dropped");
        }
    }

    /// Failures happen during attach/detach transitions and are not actionable.
    pub fn resize(&self, id: &str, cols: u16, rows: u16) {
        if cols == 0 || rows == 0 {
            return;
        }
        if let Err(e) = self.backend.resize(id, cols, rows) {
            debug!(%id, cols, rows, error = %e, "pty resize ignored");
        }
    }

    /// Best-effort terminate. The record is gone afterwards either way.
    pub fn kill(&self, id: &str) {
        match self.backend.close(id) {
            Ok(()) => debug!(%id, "pty killed"),
            Err(TerminalError::NotFound) => {}
            Err(e) => debug!(%id, error = %e, "pty kill failed"),
        }
    }

    pub fn kill_all(&self) -> usize {
        let n = self.backend.close_where(&|_| true);
        if n > 0 {
            info!(count = n, "killed all ptys");
        }
        n
    }

    /// Kill every PTY delivering to `owner`, leaving other windows' alone.
    pub fn kill_by_owner(&self, owner: &str) -> usize {
        let n = self
            .backend
            .close_where(&|r: &RecordInfo| r.owner.as_deref() == Some(owner));
        if n > 0 {
            info!(owner, count = n, "killed ptys for closed owner");
        }
        n
    }

    pub fn contains(&self, id: &str) -> bool {
        self.backend.info(id).is_some()
    }

    pub fn spawn_mode(&self, id: &str) -> Option<SpawnMode> {
        self.backend.info(id).map(|r| r.mode)
    }

    pub fn info(&self, id: &str) -> Option<RecordInfo> {
        self.backend.info(id)
    }

    pub fn len(&self) -> usize {
        self.backend.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backend.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_direct_flags_default_to_off() {
        let req: StartDirect =
            serde_json::from_str(r#"{"id":"t1","cwd":"/tmp","cols":80,"rows":24}"#).unwrap();
        assert!(!req.auto_approve);
        assert!(!req.resume);

        let req: StartDirect = serde_json::from_str(
            r#"{"id":"t1","cwd":"/tmp","cols":80,"rows":24,"autoApprove":true,"resume":true}"#,
        )
        .unwrap();
        assert!(req.auto_approve && req.resume);
    }

    #[test]
    fn exit_event_is_camel_case() {
        let ev = PtyExitEvent {
            session_id: "a".into(),
            exit_code: 2,
            signal: None,
        };
        assert_eq!(
            serde_json::to_value(ev).unwrap(),
            serde_json::json!({"sessionId": "a", "exitCode": 2, "signal": null})
        );
    }

    #[test]
    fn zero_dimensions_get_defaults() {
        assert_eq!(dims(0, 0), (DEFAULT_COLS, DEFAULT_ROWS));
        assert_eq!(dims(80, 24), (80, 24));
    }

    #[test]
    fn missing_cli_is_tool_not_found() {
        let registry = PtyRegistry::new(TerminalConfig {
            cli_program: "definitely-not-a-real-cli-6f1c".into(),
            ..TerminalConfig::default()
        });
        let err = registry
            .start_direct(
                StartDirect {
                    id: "t".into(),
                    cwd: std::env::temp_dir(),
                    cols: 80,
                    rows: 24,
                    auto_approve: false,
                    resume: false,
                },
                None,
            )
            .unwrap_err();
        assert!(matches!(err, TerminalError::ToolNotFound { .. }));
        assert!(registry.is_empty());
    }
}
