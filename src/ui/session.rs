use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::snapshot::TerminalSnapshot;
use crate::terminal::session_manager::PtyExit;
use crate::terminal::{StartDirect, StartShell};
use crate::ui::{
    ContainerId, Dimensions, HostBridge, KeyEvent, KeyEventKind, RendererTier, Subscription,
    TerminalWidget, UiRuntime,
};

pub const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(120);
/// Runtime heap above which scrollback is sacrificed.
pub const MEMORY_LIMIT_BYTES: u64 = 128 * 1024 * 1024;
pub const SCROLLBACK_LINES: usize = 100_000;
pub const TRIMMED_SCROLLBACK_LINES: usize = 10_000;
pub const DEFAULT_DIMENSIONS: Dimensions = Dimensions {
    cols: 120,
    rows: 30,
};

/// Lets the CLI tell "newline inside one input" from "submit".
const SHIFT_ENTER_INPUT: &str = "\n";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionPhase {
    Unattached,
    Opening,
    Attached,
    Detached,
    Disposed,
}

#[derive(Clone, Debug)]
pub struct SessionOptions {
    pub id: String,
    pub cwd: PathBuf,
    pub auto_approve: bool,
}

struct State {
    phase: SessionPhase,
    widget: Box<dyn TerminalWidget>,
    renderer: Option<RendererTier>,
    /// Mounted into some container at least once.
    opened: bool,
    pty_started: bool,
    container: Option<ContainerId>,
    resize_observer: Option<Subscription>,
    snapshot_timer: Option<Subscription>,
    pty_listeners: Vec<Subscription>,
}

impl State {
    fn disposed(&self) -> bool {
        self.phase == SessionPhase::Disposed
    }

    fn dimensions(&self) -> Dimensions {
        self.widget
            .proposed_dimensions()
            .filter(Dimensions::is_usable)
            .unwrap_or(DEFAULT_DIMENSIONS)
    }
}

/// One terminal as seen by the UI: owns the widget, drives the PTY behind it
/// and outlives any particular container.
///
/// The state lock is never held while calling into the host bridge.
pub struct TerminalSession {
    id: String,
    cwd: PathBuf,
    auto_approve: bool,
    bridge: Arc<dyn HostBridge>,
    runtime: Arc<dyn UiRuntime>,
    me: Weak<TerminalSession>,
    state: Mutex<State>,
}

impl TerminalSession {
    pub fn new(
        opts: SessionOptions,
        mut widget: Box<dyn TerminalWidget>,
        bridge: Arc<dyn HostBridge>,
        runtime: Arc<dyn UiRuntime>,
    ) -> Arc<Self> {
        widget.set_scrollback(SCROLLBACK_LINES);
        Arc::new_cyclic(|me| Self {
            id: opts.id,
            cwd: opts.cwd,
            auto_approve: opts.auto_approve,
            bridge,
            runtime,
            me: me.clone(),
            state: Mutex::new(State {
                phase: SessionPhase::Unattached,
                widget,
                renderer: None,
                opened: false,
                pty_started: false,
                container: None,
                resize_observer: None,
                snapshot_timer: None,
                pty_listeners: Vec::new(),
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("poisoned terminal session lock")
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn phase(&self) -> SessionPhase {
        self.state().phase
    }

    pub fn is_disposed(&self) -> bool {
        self.state().disposed()
    }

    pub fn container(&self) -> Option<ContainerId> {
        self.state().container.clone()
    }

    pub fn pty_started(&self) -> bool {
        self.state().pty_started
    }

    /// Accelerated renderer in use; `None` means the software fallback.
    pub fn renderer(&self) -> Option<RendererTier> {
        self.state().renderer
    }

    /// Show the terminal in `container`, taking the loan until `detach`.
    ///
    /// The first attach mounts the widget and starts the PTY; later ones move
    /// the same widget. Never fails; a disposed session ignores the call.
    pub fn attach(&self, container: ContainerId) {
        let (start_pty, stale) = {
            let mut st = self.state();
            if st.disposed() {
                return;
            }
            if !st.opened {
                st.phase = SessionPhase::Opening;
                st.widget.open(&container);
                st.opened = true;
                st.renderer = load_renderer(&mut *st.widget);
            } else if st.widget.parent().as_ref() != Some(&container) {
                st.widget.reparent(&container);
            }
            st.container = Some(container.clone());
            let start_pty = !st.pty_started;
            st.pty_started = true;
            (start_pty, (st.resize_observer.take(), st.snapshot_timer.take()))
        };
        drop(stale);

        let me = self.me.clone();
        let resize_observer = self.runtime.observe_resize(
            &container,
            Arc::new(move || {
                if let Some(session) = me.upgrade() {
                    session.fit();
                }
            }),
        );
        self.fit();
        self.focus();

        if start_pty {
            self.start_pty();
        }

        let me = self.me.clone();
        let snapshot_timer = self.runtime.every(
            SNAPSHOT_INTERVAL,
            Arc::new(move || {
                if let Some(session) = me.upgrade() {
                    session.save_snapshot();
                }
            }),
        );

        let mut st = self.state();
        if st.disposed() {
            return;
        }
        st.resize_observer = Some(resize_observer);
        st.snapshot_timer = Some(snapshot_timer);
        st.phase = SessionPhase::Attached;
        debug!(id = %self.id, container = %container.0, "terminal attached");
    }

    /// Save a snapshot and hand the container back. The widget stays alive
    /// for the next `attach`.
    pub fn detach(&self) -> Option<ContainerId> {
        if self.is_disposed() {
            return None;
        }
        self.save_snapshot();

        let (container, released) = {
            let mut st = self.state();
            if st.disposed() {
                return None;
            }
            let container = st.container.take();
            if container.is_some() {
                st.phase = SessionPhase::Detached;
            }
            (
                container,
                (st.resize_observer.take(), st.snapshot_timer.take()),
            )
        };
        drop(released);
        if let Some(c) = &container {
            debug!(id = %self.id, container = %c.0, "terminal detached");
        }
        container
    }

    /// Final snapshot, stop everything, kill the PTY, release the widget.
    /// A second call does nothing.
    pub fn dispose(&self) {
        if self.is_disposed() {
            return;
        }
        self.save_snapshot();

        let released = {
            let mut st = self.state();
            if st.disposed() {
                return;
            }
            st.phase = SessionPhase::Disposed;
            st.container = None;
            (
                st.resize_observer.take(),
                st.snapshot_timer.take(),
                std::mem::take(&mut st.pty_listeners),
            )
        };
        drop(released);

        self.bridge.kill(&self.id);
        self.state().widget.dispose();
        info!(id = %self.id, "terminal session disposed");
    }

    pub fn write_input(&self, data: &str) {
        if self.is_disposed() {
            return;
        }
        self.bridge.input(&self.id, data);
    }

    /// Key hook for the widget. Returns `false` when the key was consumed and
    /// the widget must not handle it.
    pub fn handle_key(&self, event: &KeyEvent) -> bool {
        if event.kind == KeyEventKind::Down && event.key == "Enter" && event.shift {
            self.write_input(SHIFT_ENTER_INPUT);
            return false;
        }
        true
    }

    pub fn focus(&self) {
        let mut st = self.state();
        if st.opened && !st.disposed() {
            st.widget.focus();
        }
    }

    /// Best effort; a failed save only costs the restore.
    pub fn save_snapshot(&self) {
        let snapshot = {
            let st = self.state();
            if st.disposed() || !st.opened {
                return;
            }
            let dims = st.dimensions();
            TerminalSnapshot::new(dims.cols, dims.rows, st.widget.serialize())
        };
        let resp = self.bridge.snapshot_save(&self.id, snapshot);
        if !resp.success {
            debug!(id = %self.id, error = ?resp.error, "snapshot save failed");
        }
    }

    /// Write the stored screen back into the widget. Only on explicit request;
    /// a live PTY repaints on its own.
    pub fn restore_snapshot(&self) -> bool {
        let resp = self.bridge.snapshot_get(&self.id);
        let Some(Some(snapshot)) = resp.data.filter(|_| resp.success) else {
            return false;
        };
        let mut st = self.state();
        if st.disposed() {
            return false;
        }
        st.widget.write(&snapshot.data);
        true
    }

    fn fit(&self) {
        let dims = {
            let mut st = self.state();
            if st.disposed() || st.container.is_none() {
                return;
            }
            st.widget.fit()
        };
        if let Some(dims) = dims.filter(Dimensions::is_usable) {
            self.bridge.resize(&self.id, dims.cols, dims.rows);
        }
    }

    fn dimensions(&self) -> Dimensions {
        self.state().dimensions()
    }

    /// Direct CLI first; the login shell if that is refused.
    fn start_pty(&self) {
        self.listen_to_pty();
        let dims = self.dimensions();
        let resp = self.bridge.start_direct(StartDirect {
            id: self.id.clone(),
            cwd: self.cwd.clone(),
            cols: dims.cols,
            rows: dims.rows,
            auto_approve: self.auto_approve,
            resume: false,
        });
        if resp.success {
            return;
        }
        info!(id = %self.id, error = ?resp.error, "direct cli unavailable; starting shell");
        self.start_shell(dims);
    }

    fn start_shell(&self, dims: Dimensions) {
        let resp = self.bridge.start(StartShell {
            id: self.id.clone(),
            cwd: self.cwd.clone(),
            cols: dims.cols,
            rows: dims.rows,
        });
        if !resp.success {
            let error = resp.error.unwrap_or_default();
            warn!(id = %self.id, %error, "shell start failed");
            let mut st = self.state();
            if !st.disposed() {
                st.widget
                    .write(&format!("\r\n\x1b[31m[Failed to start shell: {error}]\x1b[0m\r\n"));
            }
        }
    }

    /// (Re)register for this id's output and exit. Subscribed before any
    /// start so no early output is missed.
    fn listen_to_pty(&self) {
        let me = self.me.clone();
        let data = self.bridge.on_data(
            &self.id,
            Arc::new(move |chunk: &str| {
                if let Some(session) = me.upgrade() {
                    session.on_pty_data(chunk);
                }
            }),
        );
        let me = self.me.clone();
        let exit = self.bridge.on_exit(
            &self.id,
            Arc::new(move |exit: &PtyExit| {
                if let Some(session) = me.upgrade() {
                    session.on_pty_exit(exit);
                }
            }),
        );

        let replaced = {
            let mut st = self.state();
            if st.disposed() {
                return;
            }
            std::mem::replace(&mut st.pty_listeners, vec![data, exit])
        };
        drop(replaced);
    }

    fn on_pty_data(&self, chunk: &str) {
        let mut st = self.state();
        if st.disposed() {
            return;
        }
        st.widget.write(chunk);

        if self
            .runtime
            .heap_used_bytes()
            .is_some_and(|used| used > MEMORY_LIMIT_BYTES)
        {
            debug!(id = %self.id, "heap over limit; trimming scrollback");
            st.widget.set_scrollback(TRIMMED_SCROLLBACK_LINES);
            st.widget.clear();
            st.widget.set_scrollback(SCROLLBACK_LINES);
        }
    }

    /// Show the exit, then put a login shell under the same id.
    fn on_pty_exit(&self, exit: &PtyExit) {
        let dims = {
            let mut st = self.state();
            if st.disposed() {
                return;
            }
            st.widget.write(&exit_notice(exit.exit_code));
            st.dimensions()
        };
        info!(id = %self.id, code = exit.exit_code, "pty exited; starting shell");
        self.listen_to_pty();
        self.start_shell(dims);
    }
}

fn exit_notice(code: u32) -> String {
    format!("\r\n\x1b[90m[Process exited with code {code}]\x1b[0m\r\n")
}

/// Best accelerated renderer that loads.
fn load_renderer(widget: &mut dyn TerminalWidget) -> Option<RendererTier> {
    for tier in RendererTier::PREFERENCE {
        match widget.load_renderer(tier) {
            Ok(()) => return Some(tier),
            Err(e) => debug!(?tier, error = %e, "renderer unavailable"),
        }
    }
    None
}
