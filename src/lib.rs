pub mod arch;
pub mod config;
pub mod ipc;
pub mod logging;
pub mod persistent;
pub mod snapshot;
pub mod terminal;
pub mod ui;

#[cfg(feature = "desktop")]
mod desktop;

#[cfg(feature = "desktop")]
pub use desktop::run;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::arch::paths;
use crate::config::AppConfig;
use crate::ipc::PtyIpc;
use crate::persistent::PersistentSession;
use crate::snapshot::{SnapshotError, SnapshotStore};
use crate::terminal::cli_detect::{self, CliStatus};
use crate::terminal::PtyRegistry;

/// Host-side services, built once at startup and handed to every handler.
pub struct AppState {
    pub config: AppConfig,
    pub terminals: Arc<PtyRegistry>,
    pub snapshots: Arc<SnapshotStore>,
    pub persistent: PersistentSession,
    pub ipc: PtyIpc,
    quitting: AtomicBool,
}

impl AppState {
    pub fn new(config: AppConfig, data_dir: &Path) -> Result<Self, SnapshotError> {
        let terminals = Arc::new(PtyRegistry::new(config.terminal.clone()));
        let snapshots = Arc::new(SnapshotStore::with_limits(
            paths::snapshots_dir(data_dir),
            config.snapshots.max_snapshot_bytes,
            config.snapshots.max_total_bytes,
        )?);
        let ipc = PtyIpc::new(terminals.clone(), snapshots.clone());
        Ok(Self {
            config,
            terminals,
            snapshots,
            persistent: PersistentSession::new(),
            ipc,
            quitting: AtomicBool::new(false),
        })
    }

    pub async fn cli_status(&self) -> CliStatus {
        cli_detect::detect_cli(self.terminals.cli_locator(), &self.persistent).await
    }

    /// Marks the start of an orderly quit. True only for the first caller.
    pub fn begin_quit(&self) -> bool {
        !self.quitting.swap(true, Ordering::SeqCst)
    }

    pub fn is_quitting(&self) -> bool {
        self.quitting.load(Ordering::SeqCst)
    }

    /// Stop the command session, then every PTY. Best effort throughout.
    pub async fn shutdown(&self) {
        self.persistent.shutdown().await;
        let killed = self.terminals.kill_all();
        info!(killed, "host services shut down");
    }
}
