//! Client side of a terminal: the per-session manager that owns a terminal
//! widget, and the registry that keeps managers alive across remounts.
//!
//! The widget toolkit, the embedding runtime and the host connection are
//! traits so the same logic drives a webview bridge or an in-process host.

pub mod bridge;
pub mod registry;
pub mod session;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::ipc::Envelope;
use crate::snapshot::TerminalSnapshot;
use crate::terminal::session_manager::PtyExit;
use crate::terminal::{StartDirect, StartShell};

pub use bridge::LocalBridge;
pub use registry::{AttachOptions, SessionRegistry};
pub use session::{SessionOptions, SessionPhase, TerminalSession};

/// A place a widget can be shown in. The session owns its widget; a container
/// is only loaned to it between `attach` and `detach`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ContainerId(pub String);

impl From<&str> for ContainerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Dimensions {
    pub cols: u16,
    pub rows: u16,
}

impl Dimensions {
    pub fn is_usable(&self) -> bool {
        self.cols > 0 && self.rows > 0
    }
}

/// Accelerated renderers, tried in order. Failing all of them leaves the
/// widget on its built-in software renderer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RendererTier {
    Gpu,
    Canvas,
}

impl RendererTier {
    pub const PREFERENCE: [RendererTier; 2] = [RendererTier::Gpu, RendererTier::Canvas];
}

#[derive(Debug, Error)]
#[error("terminal widget error: {0}")]
pub struct WidgetError(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyEventKind {
    Down,
    Up,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyEvent {
    pub kind: KeyEventKind,
    pub key: String,
    pub shift: bool,
}

/// Cancels a registration when dropped.
pub struct Subscription(Option<Box<dyn FnOnce() + Send>>);

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(cancel)))
    }

    pub fn empty() -> Self {
        Self(None)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.0.take() {
            cancel();
        }
    }
}

/// The terminal emulator widget (xterm.js or a native equivalent).
pub trait TerminalWidget: Send {
    /// Mount into `container` for the first time.
    fn open(&mut self, container: &ContainerId);
    /// Container the widget element currently lives in.
    fn parent(&self) -> Option<ContainerId>;
    /// Move the existing element, keeping scrollback and focus state.
    fn reparent(&mut self, container: &ContainerId);
    fn load_renderer(&mut self, tier: RendererTier) -> Result<(), WidgetError>;
    /// Fit to the container; the resulting size, if it could be measured.
    fn fit(&mut self) -> Option<Dimensions>;
    fn proposed_dimensions(&self) -> Option<Dimensions>;
    fn write(&mut self, data: &str);
    /// Replayable screen state, restored later with `write`.
    fn serialize(&self) -> String;
    fn set_scrollback(&mut self, lines: usize);
    fn clear(&mut self);
    fn focus(&mut self);
    fn dispose(&mut self);
}

/// Builds the widget for a new session id.
pub type WidgetFactory = Arc<dyn Fn(&str) -> Box<dyn TerminalWidget> + Send + Sync>;

/// Services of the embedding UI runtime.
pub trait UiRuntime: Send + Sync {
    fn observe_resize(&self, container: &ContainerId, on_resize: Arc<dyn Fn() + Send + Sync>)
        -> Subscription;
    fn every(&self, period: Duration, tick: Arc<dyn Fn() + Send + Sync>) -> Subscription;
    /// Heap in use by the runtime, when it reports it.
    fn heap_used_bytes(&self) -> Option<u64>;
}

pub type DataListener = Arc<dyn Fn(&str) + Send + Sync>;
pub type ExitListener = Arc<dyn Fn(&PtyExit) + Send + Sync>;

/// The host's PTY and snapshot surface as seen from the UI.
pub trait HostBridge: Send + Sync {
    fn start_direct(&self, req: StartDirect) -> Envelope<()>;
    fn start(&self, req: StartShell) -> Envelope<()>;
    fn input(&self, id: &str, data: &str);
    fn resize(&self, id: &str, cols: u16, rows: u16);
    fn kill(&self, id: &str);
    fn snapshot_get(&self, id: &str) -> Envelope<Option<TerminalSnapshot>>;
    fn snapshot_save(&self, id: &str, snapshot: TerminalSnapshot) -> Envelope<()>;
    fn snapshot_clear(&self, id: &str) -> Envelope<()>;
    fn on_data(&self, id: &str, listener: DataListener) -> Subscription;
    fn on_exit(&self, id: &str, listener: ExitListener) -> Subscription;
}
