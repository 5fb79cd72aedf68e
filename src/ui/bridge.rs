use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::ipc::{Envelope, PtyInput, PtyIpc, PtyResize};
use crate::snapshot::TerminalSnapshot;
use crate::terminal::session_manager::{PtyExit, PtySink};
use crate::terminal::{StartDirect, StartShell};
use crate::ui::{DataListener, ExitListener, HostBridge, Subscription};

#[derive(Default)]
struct Listeners {
    next_token: u64,
    data: HashMap<String, Vec<(u64, DataListener)>>,
    exit: HashMap<String, Vec<(u64, ExitListener)>>,
}

/// The PTY owner for one in-process UI surface; fans events out to the
/// listeners registered per id.
pub struct BridgeSink {
    owner_id: String,
    listeners: Mutex<Listeners>,
}

impl BridgeSink {
    fn listeners(&self) -> MutexGuard<'_, Listeners> {
        self.listeners.lock().expect("poisoned bridge listeners lock")
    }
}

impl PtySink for BridgeSink {
    fn owner_id(&self) -> &str {
        &self.owner_id
    }

    fn send_data(&self, id: &str, data: &str) {
        // Clone out so listeners can (un)subscribe while being called.
        let targets: Vec<DataListener> = self
            .listeners()
            .data
            .get(id)
            .map(|ls| ls.iter().map(|(_, l)| l.clone()).collect())
            .unwrap_or_default();
        for listener in targets {
            listener(data);
        }
    }

    fn send_exit(&self, id: &str, exit: &PtyExit) {
        let targets: Vec<ExitListener> = self
            .listeners()
            .exit
            .get(id)
            .map(|ls| ls.iter().map(|(_, l)| l.clone()).collect())
            .unwrap_or_default();
        for listener in targets {
            listener(exit);
        }
    }
}

/// [`HostBridge`] that talks to the host services in the same process.
pub struct LocalBridge {
    ipc: PtyIpc,
    sink: Arc<BridgeSink>,
}

impl LocalBridge {
    pub fn new(ipc: PtyIpc, owner_id: impl Into<String>) -> Self {
        Self {
            ipc,
            sink: Arc::new(BridgeSink {
                owner_id: owner_id.into(),
                listeners: Mutex::new(Listeners::default()),
            }),
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.sink.owner_id
    }

    fn owner(&self) -> Arc<dyn PtySink> {
        self.sink.clone()
    }

    fn unsubscribe(sink: &Weak<BridgeSink>, id: String, token: u64, exit: bool) -> Subscription {
        let sink = sink.clone();
        Subscription::new(move || {
            let Some(sink) = sink.upgrade() else { return };
            let mut listeners = sink.listeners();
            if exit {
                if let Some(ls) = listeners.exit.get_mut(&id) {
                    ls.retain(|(t, _)| *t != token);
                    if ls.is_empty() {
                        listeners.exit.remove(&id);
                    }
                }
            } else if let Some(ls) = listeners.data.get_mut(&id) {
                ls.retain(|(t, _)| *t != token);
                if ls.is_empty() {
                    listeners.data.remove(&id);
                }
            }
        })
    }
}

impl HostBridge for LocalBridge {
    fn start_direct(&self, req: StartDirect) -> Envelope<()> {
        self.ipc.start_direct(req, self.owner())
    }

    fn start(&self, req: StartShell) -> Envelope<()> {
        self.ipc.start(req, self.owner())
    }

    fn input(&self, id: &str, data: &str) {
        self.ipc.input(PtyInput {
            id: id.to_string(),
            data: data.to_string(),
        });
    }

    fn resize(&self, id: &str, cols: u16, rows: u16) {
        self.ipc.resize(PtyResize {
            id: id.to_string(),
            cols,
            rows,
        });
    }

    fn kill(&self, id: &str) {
        self.ipc.kill(id);
    }

    fn snapshot_get(&self, id: &str) -> Envelope<Option<TerminalSnapshot>> {
        self.ipc.snapshot_get(id)
    }

    fn snapshot_save(&self, id: &str, snapshot: TerminalSnapshot) -> Envelope<()> {
        self.ipc.snapshot_save(id, snapshot)
    }

    fn snapshot_clear(&self, id: &str) -> Envelope<()> {
        self.ipc.snapshot_clear(id)
    }

    fn on_data(&self, id: &str, listener: DataListener) -> Subscription {
        let token = {
            let mut listeners = self.sink.listeners();
            listeners.next_token += 1;
            let token = listeners.next_token;
            listeners
                .data
                .entry(id.to_string())
                .or_default()
                .push((token, listener));
            token
        };
        Self::unsubscribe(&Arc::downgrade(&self.sink), id.to_string(), token, false)
    }

    fn on_exit(&self, id: &str, listener: ExitListener) -> Subscription {
        let token = {
            let mut listeners = self.sink.listeners();
            listeners.next_token += 1;
            let token = listeners.next_token;
            listeners
                .exit
                .entry(id.to_string())
                .or_default()
                .push((token, listener));
            token
        };
        Self::unsubscribe(&Arc::downgrade(&self.sink), id.to_string(), token, true)
    }
}
