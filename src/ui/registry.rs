use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::ui::session::{SessionOptions, TerminalSession};
use crate::ui::{ContainerId, HostBridge, UiRuntime, WidgetFactory};

#[derive(Clone, Debug)]
pub struct AttachOptions {
    pub id: String,
    pub cwd: PathBuf,
    pub container: ContainerId,
    pub auto_approve: bool,
}

/// Terminal sessions by stable id, so a terminal survives its view being
/// unmounted and mounted somewhere else.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<TerminalSession>>>,
    bridge: Arc<dyn HostBridge>,
    runtime: Arc<dyn UiRuntime>,
    widgets: WidgetFactory,
}

impl SessionRegistry {
    pub fn new(bridge: Arc<dyn HostBridge>, runtime: Arc<dyn UiRuntime>, widgets: WidgetFactory) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            bridge,
            runtime,
            widgets,
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Arc<TerminalSession>>> {
        self.sessions.lock().expect("poisoned session registry lock")
    }

    /// Get or create the session for `opts.id` and attach it to the container.
    /// `cwd` and `auto_approve` only matter on creation.
    pub fn attach(&self, opts: AttachOptions) -> Arc<TerminalSession> {
        let session = {
            let mut sessions = self.sessions();
            sessions
                .entry(opts.id.clone())
                .or_insert_with(|| {
                    debug!(id = %opts.id, "creating terminal session");
                    TerminalSession::new(
                        SessionOptions {
                            id: opts.id.clone(),
                            cwd: opts.cwd.clone(),
                            auto_approve: opts.auto_approve,
                        },
                        (self.widgets)(&opts.id),
                        self.bridge.clone(),
                        self.runtime.clone(),
                    )
                })
                .clone()
        };
        session.attach(opts.container);
        session
    }

    pub fn detach(&self, id: &str) -> Option<ContainerId> {
        self.get(id)?.detach()
    }

    pub fn get(&self, id: &str) -> Option<Arc<TerminalSession>> {
        self.sessions().get(id).cloned()
    }

    pub fn dispose(&self, id: &str) {
        let session = self.sessions().remove(id);
        if let Some(session) = session {
            session.dispose();
        }
    }

    pub fn dispose_all(&self) {
        let sessions: Vec<_> = self.sessions().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.dispose();
        }
    }

    /// The user closed the task: tear the session down and forget its
    /// snapshot.
    pub fn discard(&self, id: &str) {
        self.dispose(id);
        let resp = self.bridge.snapshot_clear(id);
        if !resp.success {
            debug!(%id, error = ?resp.error, "snapshot clear failed");
        }
    }

    /// Persist every live session, e.g. on the before-quit broadcast.
    pub fn save_all_snapshots(&self) {
        let sessions: Vec<_> = self.sessions().values().cloned().collect();
        for session in sessions {
            session.save_snapshot();
        }
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions().is_empty()
    }
}
