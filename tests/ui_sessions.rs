use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashterm_lib::ipc::Envelope;
use dashterm_lib::snapshot::TerminalSnapshot;
use dashterm_lib::terminal::session_manager::PtyExit;
use dashterm_lib::terminal::{StartDirect, StartShell};
use dashterm_lib::ui::session::{SCROLLBACK_LINES, TRIMMED_SCROLLBACK_LINES};
use dashterm_lib::ui::{
    AttachOptions, ContainerId, DataListener, Dimensions, ExitListener, HostBridge, KeyEvent,
    KeyEventKind, RendererTier, SessionPhase, SessionRegistry, Subscription, TerminalWidget,
    UiRuntime, WidgetError, WidgetFactory,
};

// ---------------------------------------------------------------------------
// Fakes

#[derive(Default)]
struct WidgetLog {
    opened: Vec<ContainerId>,
    parent: Option<ContainerId>,
    reparented: Vec<ContainerId>,
    written: String,
    scrollback: Vec<usize>,
    clears: usize,
    focused: usize,
    disposed: bool,
}

struct FakeWidget {
    log: Arc<Mutex<WidgetLog>>,
    failing_renderers: Vec<RendererTier>,
    size: Dimensions,
}

impl TerminalWidget for FakeWidget {
    fn open(&mut self, container: &ContainerId) {
        let mut log = self.log.lock().unwrap();
        log.opened.push(container.clone());
        log.parent = Some(container.clone());
    }

    fn parent(&self) -> Option<ContainerId> {
        self.log.lock().unwrap().parent.clone()
    }

    fn reparent(&mut self, container: &ContainerId) {
        let mut log = self.log.lock().unwrap();
        log.reparented.push(container.clone());
        log.parent = Some(container.clone());
    }

    fn load_renderer(&mut self, tier: RendererTier) -> Result<(), WidgetError> {
        if self.failing_renderers.contains(&tier) {
            return Err(WidgetError(format!("{tier:?} unavailable")));
        }
        Ok(())
    }

    fn fit(&mut self) -> Option<Dimensions> {
        Some(self.size)
    }

    fn proposed_dimensions(&self) -> Option<Dimensions> {
        Some(self.size)
    }

    fn write(&mut self, data: &str) {
        self.log.lock().unwrap().written.push_str(data);
    }

    fn serialize(&self) -> String {
        self.log.lock().unwrap().written.clone()
    }

    fn set_scrollback(&mut self, lines: usize) {
        self.log.lock().unwrap().scrollback.push(lines);
    }

    fn clear(&mut self) {
        self.log.lock().unwrap().clears += 1;
    }

    fn focus(&mut self) {
        self.log.lock().unwrap().focused += 1;
    }

    fn dispose(&mut self) {
        self.log.lock().unwrap().disposed = true;
    }
}

type Callback = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct FakeRuntime {
    next: AtomicU64,
    observers: Arc<Mutex<Vec<(u64, Callback)>>>,
    timers: Arc<Mutex<Vec<(u64, Callback)>>>,
    heap: Mutex<Option<u64>>,
}

impl FakeRuntime {
    fn register(&self, list: &Arc<Mutex<Vec<(u64, Callback)>>>, cb: Callback) -> Subscription {
        let token = self.next.fetch_add(1, Ordering::SeqCst);
        list.lock().unwrap().push((token, cb));
        let list = list.clone();
        Subscription::new(move || list.lock().unwrap().retain(|(t, _)| *t != token))
    }

    fn fire(list: &Arc<Mutex<Vec<(u64, Callback)>>>) {
        let cbs: Vec<Callback> = list.lock().unwrap().iter().map(|(_, c)| c.clone()).collect();
        for cb in cbs {
            cb();
        }
    }

    fn trigger_resize(&self) {
        Self::fire(&self.observers);
    }

    fn tick(&self) {
        Self::fire(&self.timers);
    }

    fn observer_count(&self) -> usize {
        self.observers.lock().unwrap().len()
    }

    fn timer_count(&self) -> usize {
        self.timers.lock().unwrap().len()
    }

    fn set_heap(&self, bytes: Option<u64>) {
        *self.heap.lock().unwrap() = bytes;
    }
}

impl UiRuntime for FakeRuntime {
    fn observe_resize(&self, _container: &ContainerId, on_resize: Callback) -> Subscription {
        self.register(&self.observers, on_resize)
    }

    fn every(&self, _period: Duration, tick: Callback) -> Subscription {
        self.register(&self.timers, tick)
    }

    fn heap_used_bytes(&self) -> Option<u64> {
        *self.heap.lock().unwrap()
    }
}

#[derive(Default)]
struct BridgeListeners {
    next: u64,
    data: Vec<(u64, String, DataListener)>,
    exit: Vec<(u64, String, ExitListener)>,
}

#[derive(Default)]
struct FakeBridge {
    calls: Mutex<Vec<String>>,
    direct_fails: AtomicBool,
    shell_fails: AtomicBool,
    snapshots: Mutex<HashMap<String, TerminalSnapshot>>,
    listeners: Arc<Mutex<BridgeListeners>>,
}

impl FakeBridge {
    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == call).count()
    }

    fn emit_data(&self, id: &str, data: &str) {
        let targets: Vec<DataListener> = self
            .listeners
            .lock()
            .unwrap()
            .data
            .iter()
            .filter(|(_, i, _)| i == id)
            .map(|(_, _, l)| l.clone())
            .collect();
        for l in targets {
            l(data);
        }
    }

    fn emit_exit(&self, id: &str, code: u32) {
        let targets: Vec<ExitListener> = self
            .listeners
            .lock()
            .unwrap()
            .exit
            .iter()
            .filter(|(_, i, _)| i == id)
            .map(|(_, _, l)| l.clone())
            .collect();
        let exit = PtyExit {
            exit_code: code,
            signal: None,
        };
        for l in targets {
            l(&exit);
        }
    }

    fn data_listener_count(&self, id: &str) -> usize {
        self.listeners
            .lock()
            .unwrap()
            .data
            .iter()
            .filter(|(_, i, _)| i == id)
            .count()
    }
}

impl HostBridge for FakeBridge {
    fn start_direct(&self, req: StartDirect) -> Envelope<()> {
        self.record(format!("start_direct:{}", req.id));
        if self.direct_fails.load(Ordering::SeqCst) {
            Envelope::err("cli not found on PATH")
        } else {
            Envelope::done()
        }
    }

    fn start(&self, req: StartShell) -> Envelope<()> {
        self.record(format!("start:{}", req.id));
        if self.shell_fails.load(Ordering::SeqCst) {
            Envelope::err("no shell")
        } else {
            Envelope::done()
        }
    }

    fn input(&self, id: &str, data: &str) {
        self.record(format!("input:{id}:{data}"));
    }

    fn resize(&self, id: &str, cols: u16, rows: u16) {
        self.record(format!("resize:{id}:{cols}x{rows}"));
    }

    fn kill(&self, id: &str) {
        self.record(format!("kill:{id}"));
    }

    fn snapshot_get(&self, id: &str) -> Envelope<Option<TerminalSnapshot>> {
        Envelope::ok(self.snapshots.lock().unwrap().get(id).cloned())
    }

    fn snapshot_save(&self, id: &str, snapshot: TerminalSnapshot) -> Envelope<()> {
        self.record(format!("snapshot_save:{id}"));
        self.snapshots.lock().unwrap().insert(id.to_string(), snapshot);
        Envelope::done()
    }

    fn snapshot_clear(&self, id: &str) -> Envelope<()> {
        self.record(format!("snapshot_clear:{id}"));
        self.snapshots.lock().unwrap().remove(id);
        Envelope::done()
    }

    fn on_data(&self, id: &str, listener: DataListener) -> Subscription {
        let token = {
            let mut ls = self.listeners.lock().unwrap();
            ls.next += 1;
            let token = ls.next;
            ls.data.push((token, id.to_string(), listener));
            token
        };
        let ls = self.listeners.clone();
        Subscription::new(move || ls.lock().unwrap().data.retain(|(t, _, _)| *t != token))
    }

    fn on_exit(&self, id: &str, listener: ExitListener) -> Subscription {
        let token = {
            let mut ls = self.listeners.lock().unwrap();
            ls.next += 1;
            let token = ls.next;
            ls.exit.push((token, id.to_string(), listener));
            token
        };
        let ls = self.listeners.clone();
        Subscription::new(move || ls.lock().unwrap().exit.retain(|(t, _, _)| *t != token))
    }
}

struct Harness {
    bridge: Arc<FakeBridge>,
    runtime: Arc<FakeRuntime>,
    widgets: Arc<Mutex<HashMap<String, Arc<Mutex<WidgetLog>>>>>,
    registry: SessionRegistry,
}

impl Harness {
    fn new() -> Self {
        Self::with_failing_renderers(Vec::new())
    }

    fn with_failing_renderers(failing: Vec<RendererTier>) -> Self {
        let bridge = Arc::new(FakeBridge::default());
        let runtime = Arc::new(FakeRuntime::default());
        let widgets: Arc<Mutex<HashMap<String, Arc<Mutex<WidgetLog>>>>> = Arc::default();
        let logs = widgets.clone();
        let factory: WidgetFactory = Arc::new(move |id: &str| {
            let log = Arc::new(Mutex::new(WidgetLog::default()));
            logs.lock().unwrap().insert(id.to_string(), log.clone());
            Box::new(FakeWidget {
                log,
                failing_renderers: failing.clone(),
                size: Dimensions {
                    cols: 100,
                    rows: 40,
                },
            }) as Box<dyn TerminalWidget>
        });
        let registry = SessionRegistry::new(bridge.clone(), runtime.clone(), factory);
        Self {
            bridge,
            runtime,
            widgets,
            registry,
        }
    }

    fn attach(&self, id: &str, container: &str) -> Arc<dashterm_lib::ui::TerminalSession> {
        self.registry.attach(AttachOptions {
            id: id.to_string(),
            cwd: std::env::temp_dir(),
            container: container.into(),
            auto_approve: false,
        })
    }

    fn widget(&self, id: &str) -> Arc<Mutex<WidgetLog>> {
        self.widgets.lock().unwrap()[id].clone()
    }

    fn written(&self, id: &str) -> String {
        self.widget(id).lock().unwrap().written.clone()
    }
}

// ---------------------------------------------------------------------------
// Session lifecycle

#[test]
fn first_attach_falls_back_to_shell_when_cli_is_missing() {
    let h = Harness::new();
    h.bridge.direct_fails.store(true, Ordering::SeqCst);

    let session = h.attach("t1", "panel-a");

    let calls = h.bridge.calls();
    let direct = calls.iter().position(|c| c == "start_direct:t1").unwrap();
    let shell = calls.iter().position(|c| c == "start:t1").unwrap();
    assert!(direct < shell);
    assert!(session.pty_started());
    assert_eq!(session.phase(), SessionPhase::Attached);
    assert_eq!(session.renderer(), Some(RendererTier::Gpu));
    assert_eq!(h.widget("t1").lock().unwrap().opened, vec![ContainerId::from("panel-a")]);
}

#[test]
fn reattach_moves_the_widget_without_restarting_the_pty() {
    let h = Harness::new();
    let first = h.attach("t1", "panel-a");

    assert_eq!(first.detach(), Some(ContainerId::from("panel-a")));
    assert_eq!(first.phase(), SessionPhase::Detached);
    assert_eq!(h.bridge.count("snapshot_save:t1"), 1);
    assert_eq!(h.runtime.observer_count(), 0);
    assert_eq!(h.runtime.timer_count(), 0);

    let second = h.attach("t1", "panel-b");
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(second.container(), Some(ContainerId::from("panel-b")));

    let log = h.widget("t1");
    let log = log.lock().unwrap();
    assert_eq!(log.opened.len(), 1);
    assert_eq!(log.reparented, vec![ContainerId::from("panel-b")]);
    assert_eq!(h.bridge.count("start_direct:t1"), 1);
    assert_eq!(h.bridge.count("start:t1"), 0);
    assert_eq!(h.registry.len(), 1);
}

#[test]
fn output_reaches_the_widget() {
    let h = Harness::new();
    h.attach("t1", "panel-a");
    h.bridge.emit_data("t1", "hello\r\n");
    h.bridge.emit_data("other", "not mine");
    assert_eq!(h.written("t1"), "hello\r\n");
}

#[test]
fn exit_shows_a_notice_and_starts_a_shell() {
    let h = Harness::new();
    h.attach("t1", "panel-a");

    h.bridge.emit_exit("t1", 3);

    assert!(h.written("t1").contains("[Process exited with code 3]"));
    assert_eq!(h.bridge.count("start:t1"), 1);
    // Listeners were swapped, not stacked.
    assert_eq!(h.bridge.data_listener_count("t1"), 1);
    h.bridge.emit_data("t1", "after");
    assert_eq!(h.written("t1").matches("after").count(), 1);
}

#[test]
fn shell_failure_is_shown_in_the_terminal() {
    let h = Harness::new();
    h.bridge.direct_fails.store(true, Ordering::SeqCst);
    h.bridge.shell_fails.store(true, Ordering::SeqCst);

    let session = h.attach("t1", "panel-a");

    assert!(h.written("t1").contains("[Failed to start shell: no shell]"));
    assert_eq!(session.phase(), SessionPhase::Attached);
}

#[test]
fn shift_enter_sends_a_line_feed() {
    let h = Harness::new();
    let session = h.attach("t1", "panel-a");
    let key = |kind, shift| KeyEvent {
        kind,
        key: "Enter".to_string(),
        shift,
    };

    assert!(!session.handle_key(&key(KeyEventKind::Down, true)));
    assert!(session.handle_key(&key(KeyEventKind::Up, true)));
    assert!(session.handle_key(&key(KeyEventKind::Down, false)));
    assert_eq!(h.bridge.count("input:t1:\n"), 1);
}

#[test]
fn heap_pressure_trims_scrollback() {
    let h = Harness::new();
    h.attach("t1", "panel-a");

    h.bridge.emit_data("t1", "fine");
    assert_eq!(h.widget("t1").lock().unwrap().clears, 0);

    h.runtime.set_heap(Some(200 * 1024 * 1024));
    h.bridge.emit_data("t1", "heavy");

    let log = h.widget("t1");
    let log = log.lock().unwrap();
    assert_eq!(log.clears, 1);
    assert_eq!(
        log.scrollback,
        vec![SCROLLBACK_LINES, TRIMMED_SCROLLBACK_LINES, SCROLLBACK_LINES]
    );
}

#[test]
fn resize_observer_and_timer_follow_the_attachment() {
    let h = Harness::new();
    let session = h.attach("t1", "panel-a");
    assert_eq!(h.bridge.count("resize:t1:100x40"), 1);

    h.runtime.trigger_resize();
    assert_eq!(h.bridge.count("resize:t1:100x40"), 2);

    h.runtime.tick();
    assert_eq!(h.bridge.count("snapshot_save:t1"), 1);

    session.detach();
    h.runtime.trigger_resize();
    h.runtime.tick();
    assert_eq!(h.bridge.count("resize:t1:100x40"), 2);
    assert_eq!(h.bridge.count("snapshot_save:t1"), 2);
}

#[test]
fn dispose_kills_once_and_silences_the_session() {
    let h = Harness::new();
    let session = h.attach("t1", "panel-a");

    session.dispose();
    session.dispose();

    assert_eq!(h.bridge.count("kill:t1"), 1);
    assert_eq!(h.bridge.count("snapshot_save:t1"), 1);
    assert_eq!(session.phase(), SessionPhase::Disposed);
    assert!(h.widget("t1").lock().unwrap().disposed);
    assert_eq!(h.bridge.data_listener_count("t1"), 0);

    session.attach("panel-b".into());
    assert_eq!(session.detach(), None);
    assert_eq!(h.widget("t1").lock().unwrap().opened.len(), 1);
}

#[test]
fn restore_replays_the_stored_screen() {
    let h = Harness::new();
    h.bridge.snapshots.lock().unwrap().insert(
        "t1".to_string(),
        TerminalSnapshot::new(100, 40, "saved-screen".to_string()),
    );
    let session = h.attach("t1", "panel-a");

    assert!(session.restore_snapshot());
    assert!(h.written("t1").contains("saved-screen"));

    let other = h.attach("t2", "panel-b");
    assert!(!other.restore_snapshot());
}

#[test]
fn renderer_falls_back_through_the_tiers() {
    let h = Harness::with_failing_renderers(vec![RendererTier::Gpu]);
    assert_eq!(h.attach("t1", "a").renderer(), Some(RendererTier::Canvas));

    let h = Harness::with_failing_renderers(vec![RendererTier::Gpu, RendererTier::Canvas]);
    let session = h.attach("t1", "a");
    assert_eq!(session.renderer(), None);
    assert_eq!(session.phase(), SessionPhase::Attached);
}

// ---------------------------------------------------------------------------
// Registry

#[test]
fn discard_forgets_the_session_and_its_snapshot() {
    let h = Harness::new();
    h.attach("t1", "panel-a");
    h.attach("t2", "panel-b");

    h.registry.discard("t1");

    assert!(h.registry.get("t1").is_none());
    assert_eq!(h.registry.len(), 1);
    assert_eq!(h.bridge.count("kill:t1"), 1);
    assert_eq!(h.bridge.count("snapshot_clear:t1"), 1);
    assert!(!h.bridge.snapshots.lock().unwrap().contains_key("t1"));
}

#[test]
fn save_all_then_dispose_all() {
    let h = Harness::new();
    h.attach("t1", "panel-a");
    h.attach("t2", "panel-b");

    h.registry.save_all_snapshots();
    assert_eq!(h.bridge.count("snapshot_save:t1"), 1);
    assert_eq!(h.bridge.count("snapshot_save:t2"), 1);

    h.registry.dispose_all();
    assert!(h.registry.is_empty());
    assert_eq!(h.bridge.count("kill:t1"), 1);
    assert_eq!(h.bridge.count("kill:t2"), 1);
    assert_eq!(h.registry.detach("t1"), None);
}

// ---------------------------------------------------------------------------
// In-process host

#[cfg(unix)]
#[test]
fn local_bridge_drives_a_real_shell() {
    use std::time::Instant;

    use dashterm_lib::config::TerminalConfig;
    use dashterm_lib::ipc::PtyIpc;
    use dashterm_lib::snapshot::SnapshotStore;
    use dashterm_lib::terminal::session_manager::SpawnMode;
    use dashterm_lib::terminal::PtyRegistry;
    use dashterm_lib::ui::LocalBridge;

    let dir = tempfile::tempdir().unwrap();
    let terminals = Arc::new(PtyRegistry::new(TerminalConfig {
        cli_program: "no-such-cli-8d2a".to_string(),
        shell: Some("/bin/sh".to_string()),
        ..TerminalConfig::default()
    }));
    let snapshots = Arc::new(SnapshotStore::open(dir.path().join("snapshots")).unwrap());
    let bridge = Arc::new(LocalBridge::new(
        PtyIpc::new(terminals.clone(), snapshots.clone()),
        "main",
    ));

    let runtime = Arc::new(FakeRuntime::default());
    let log = Arc::new(Mutex::new(WidgetLog::default()));
    let widget_log = log.clone();
    let factory: WidgetFactory = Arc::new(move |_id: &str| {
        Box::new(FakeWidget {
            log: widget_log.clone(),
            failing_renderers: Vec::new(),
            size: Dimensions { cols: 80, rows: 24 },
        }) as Box<dyn TerminalWidget>
    });
    let registry = SessionRegistry::new(bridge, runtime, factory);

    let session = registry.attach(AttachOptions {
        id: "live".to_string(),
        cwd: dir.path().to_path_buf(),
        container: "panel".into(),
        auto_approve: false,
    });
    assert_eq!(terminals.spawn_mode("live"), Some(SpawnMode::LoginShell));
    assert_eq!(terminals.info("live").unwrap().owner.as_deref(), Some("main"));

    session.write_input("echo ui_$((2*21))\n");
    let deadline = Instant::now() + Duration::from_secs(10);
    while !log.lock().unwrap().written.contains("ui_42") {
        assert!(Instant::now() < deadline, "shell output never arrived");
        std::thread::sleep(Duration::from_millis(20));
    }

    registry.save_all_snapshots();
    assert!(snapshots.get("live").is_some());

    registry.discard("live");
    assert!(!terminals.contains("live"));
    assert!(snapshots.get("live").is_none());
}
