//! Request handlers behind the UI-facing IPC surface.
//!
//! Every request/response call answers with the same envelope; failures are
//! turned into `{success: false, error}` here and never cross the boundary as
//! errors. Input, resize and kill are fire-and-forget.

use std::fmt::Display;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::snapshot::{SnapshotStore, TerminalSnapshot};
use crate::terminal::session_manager::PtySink;
use crate::terminal::{PtyRegistry, StartDirect, StartShell};

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> Envelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(error: impl Display) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.to_string()),
        }
    }

    pub fn from_result<E: Display>(result: Result<T, E>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(e) => Self::err(e),
        }
    }
}

impl Envelope<()> {
    /// Success with no payload.
    pub fn done() -> Self {
        Self {
            success: true,
            data: None,
            error: None,
        }
    }

    pub fn from_unit<E: Display>(result: Result<(), E>) -> Self {
        match result {
            Ok(()) => Self::done(),
            Err(e) => Self::err(e),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct PtyInput {
    pub id: String,
    pub data: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct PtyResize {
    pub id: String,
    pub cols: u16,
    pub rows: u16,
}

#[derive(Clone)]
pub struct PtyIpc {
    terminals: Arc<PtyRegistry>,
    snapshots: Arc<SnapshotStore>,
}

impl PtyIpc {
    pub fn new(terminals: Arc<PtyRegistry>, snapshots: Arc<SnapshotStore>) -> Self {
        Self {
            terminals,
            snapshots,
        }
    }

    pub fn terminals(&self) -> &Arc<PtyRegistry> {
        &self.terminals
    }

    pub fn start_direct(&self, req: StartDirect, owner: Arc<dyn PtySink>) -> Envelope<()> {
        let id = req.id.clone();
        let result = self.terminals.start_direct(req, Some(owner));
        if let Err(e) = &result {
            warn!(%id, error = %e, "direct cli start failed");
        }
        Envelope::from_unit(result)
    }

    pub fn start(&self, req: StartShell, owner: Arc<dyn PtySink>) -> Envelope<()> {
        let id = req.id.clone();
        let result = self.terminals.start(req, Some(owner));
        if let Err(e) = &result {
            warn!(%id, error = %e, "shell start failed");
        }
        Envelope::from_unit(result)
    }

    pub fn input(&self, req: PtyInput) {
        self.terminals.write(&req.id, &req.data);
    }

    pub fn resize(&self, req: PtyResize) {
        self.terminals.resize(&req.id, req.cols, req.rows);
    }

    pub fn kill(&self, id: &str) {
        self.terminals.kill(id);
    }

    /// `data` is `null` when there is nothing to restore.
    pub fn snapshot_get(&self, id: &str) -> Envelope<Option<TerminalSnapshot>> {
        Envelope::ok(self.snapshots.get(id))
    }

    pub fn snapshot_save(&self, id: &str, snapshot: TerminalSnapshot) -> Envelope<()> {
        Envelope::from_unit(self.snapshots.save(id, &snapshot))
    }

    pub fn snapshot_clear(&self, id: &str) -> Envelope<()> {
        Envelope::from_unit(self.snapshots.delete(id))
    }
}
