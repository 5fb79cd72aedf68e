use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;

use crate::terminal::TerminalError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SpawnMode {
    /// The CLI binary itself, minimal environment.
    DirectCli,
    /// The user's interactive login shell.
    LoginShell,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SpawnEnv {
    /// Start from an empty environment and set exactly these.
    Exact(Vec<(String, String)>),
    /// Inherit the host environment, drop `remove`, then apply `set`.
    Inherit {
        remove: Vec<String>,
        set: Vec<(String, String)>,
    },
}

#[derive(Clone, Debug)]
pub struct SpawnSpec {
    pub id: String,
    pub mode: SpawnMode,
    pub cwd: PathBuf,
    pub cols: u16,
    pub rows: u16,
    pub program: String,
    pub args: Vec<String>,
    pub env: SpawnEnv,
    /// Run early output through the banner rewrite.
    pub filter_banner: bool,
}

/// Terminal exit as reported to the owning surface.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PtyExit {
    pub exit_code: u32,
    pub signal: Option<String>,
}

/// The UI surface a PTY's events are delivered to (one window/webview).
///
/// Events go to the owner only, never broadcast.
pub trait PtySink: Send + Sync {
    /// Stable identity used by `kill_by_owner`.
    fn owner_id(&self) -> &str;

    /// A destroyed surface silently drops events.
    fn is_alive(&self) -> bool {
        true
    }

    fn send_data(&self, id: &str, data: &str);
    fn send_exit(&self, id: &str, exit: &PtyExit);
}

/// Snapshot of one live record, for callers that need to inspect the registry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordInfo {
    pub id: String,
    pub mode: SpawnMode,
    pub cwd: PathBuf,
    pub owner: Option<String>,
    pub pid: Option<u32>,
}

pub trait PtySessionBackend: Send + Sync {
    /// Spawn and register under `spec.id`, replacing any live record with that
    /// id. With no `owner`, the replaced record's owner is inherited.
    fn spawn(&self, spec: SpawnSpec, owner: Option<Arc<dyn PtySink>>) -> Result<(), TerminalError>;
    fn write(&self, id: &str, data: &str) -> Result<(), TerminalError>;
    fn resize(&self, id: &str, cols: u16, rows: u16) -> Result<(), TerminalError>;
    fn close(&self, id: &str) -> Result<(), TerminalError>;
    /// Close every record matching `pred`; returns how many were closed.
    fn close_where(&self, pred: &dyn Fn(&RecordInfo) -> bool) -> usize;
    fn info(&self, id: &str) -> Option<RecordInfo>;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
