// Learn more about Tauri commands at https://tauri.app/develop/calling-rust/
use std::sync::Arc;
use std::time::Duration;

use tauri::{AppHandle, Emitter, Manager, RunEvent, State, WebviewWindow, WindowEvent};
use tracing::{error, info, warn};

use crate::arch::paths;
use crate::config::AppConfig;
use crate::ipc::{Envelope, PtyInput, PtyResize};
use crate::logging;
use crate::persistent::SessionError;
use crate::snapshot::TerminalSnapshot;
use crate::terminal::cli_detect::CliStatus;
use crate::terminal::session_manager::{PtyExit, PtySink};
use crate::terminal::{
    PtyDataEvent, PtyExitEvent, StartDirect, StartShell, PTY_DATA_EVENT, PTY_EXIT_EVENT,
};
use crate::AppState;

/// Broadcast when the app is about to quit; windows get a short grace period
/// to save their snapshots.
pub const BEFORE_QUIT_EVENT: &str = "app:beforeQuit";
/// Broadcast when the command session is lost; the app shows a blocking
/// notice and exits.
pub const FATAL_EVENT: &str = "session:fatal";
const BEFORE_QUIT_GRACE: Duration = Duration::from_millis(200);

/// Delivers one PTY's events to the webview window that started it.
struct WebviewSink {
    app: AppHandle,
    label: String,
}

impl PtySink for WebviewSink {
    fn owner_id(&self) -> &str {
        &self.label
    }

    fn is_alive(&self) -> bool {
        self.app.get_webview_window(&self.label).is_some()
    }

    fn send_data(&self, id: &str, data: &str) {
        let _ = self.app.emit_to(
            self.label.as_str(),
            PTY_DATA_EVENT,
            PtyDataEvent {
                session_id: id.to_string(),
                data: data.to_string(),
            },
        );
    }

    fn send_exit(&self, id: &str, exit: &PtyExit) {
        let _ = self.app.emit_to(
            self.label.as_str(),
            PTY_EXIT_EVENT,
            PtyExitEvent {
                session_id: id.to_string(),
                exit_code: exit.exit_code,
                signal: exit.signal.clone(),
            },
        );
    }
}

fn owner(app: &AppHandle, window: &WebviewWindow) -> Arc<dyn PtySink> {
    Arc::new(WebviewSink {
        app: app.clone(),
        label: window.label().to_string(),
    })
}

#[tauri::command]
fn pty_start_direct(
    app: AppHandle,
    window: WebviewWindow,
    state: State<'_, Arc<AppState>>,
    args: StartDirect,
) -> Envelope<()> {
    state.ipc.start_direct(args, owner(&app, &window))
}

#[tauri::command]
fn pty_start(
    app: AppHandle,
    window: WebviewWindow,
    state: State<'_, Arc<AppState>>,
    args: StartShell,
) -> Envelope<()> {
    state.ipc.start(args, owner(&app, &window))
}

#[tauri::command]
fn pty_input(state: State<'_, Arc<AppState>>, args: PtyInput) {
    state.ipc.input(args);
}

#[tauri::command]
fn pty_resize(state: State<'_, Arc<AppState>>, args: PtyResize) {
    state.ipc.resize(args);
}

#[tauri::command]
fn pty_kill(state: State<'_, Arc<AppState>>, id: String) {
    state.ipc.kill(&id);
}

#[tauri::command]
fn pty_snapshot_get(state: State<'_, Arc<AppState>>, id: String) -> Envelope<Option<TerminalSnapshot>> {
    state.ipc.snapshot_get(&id)
}

#[tauri::command]
fn pty_snapshot_save(
    state: State<'_, Arc<AppState>>,
    id: String,
    snapshot: TerminalSnapshot,
) -> Envelope<()> {
    state.ipc.snapshot_save(&id, snapshot)
}

#[tauri::command]
fn pty_snapshot_clear(state: State<'_, Arc<AppState>>, id: String) -> Envelope<()> {
    state.ipc.snapshot_clear(&id)
}

#[tauri::command]
async fn cli_status(state: State<'_, Arc<AppState>>) -> Result<CliStatus, String> {
    Ok(state.cli_status().await)
}

/// Blocks until the user dismisses it. Main thread only.
fn show_fatal_dialog(err: &SessionError) {
    let (title, text) = err.fatal_notice();
    show_error_dialog(title, &text);
}

fn show_error_dialog(title: &str, text: &str) {
    rfd::MessageDialog::new()
        .set_level(rfd::MessageLevel::Error)
        .set_title(title)
        .set_description(text)
        .set_buttons(rfd::MessageButtons::Ok)
        .show();
}

fn install_fatal_handler(app: &AppHandle, state: &AppState) {
    let app = app.clone();
    state.persistent.set_fatal_handler(Arc::new(move |err| {
        error!(error = %err, "command session lost; exiting");
        let _ = app.emit(FATAL_EVENT, err.to_string());

        // The handler runs on a runtime task; dialogs belong on the main thread.
        let (title, text) = err.fatal_notice();
        let handle = app.clone();
        let shown = app.run_on_main_thread(move || {
            show_error_dialog(title, &text);
            handle.exit(1);
        });
        if let Err(e) = shown {
            warn!(error = %e, "fatal dialog could not be shown");
            app.exit(1);
        }
    }));
}

fn setup(app: &mut tauri::App) -> Result<(), Box<dyn std::error::Error>> {
    let handle = app.handle().clone();
    let data_dir = paths::app_data_dir(&handle)?;
    match paths::app_log_dir(&handle).map(|dir| logging::init(&dir)) {
        Ok(Ok(path)) => info!(log = %path.display(), "logging to file"),
        Ok(Err(e)) => eprintln!("file logging disabled: {e}"),
        Err(e) => eprintln!("no log directory: {e}"),
    }

    let config = AppConfig::load(&data_dir).unwrap_or_else(|e| {
        warn!(error = %e, "config unreadable; using defaults");
        AppConfig::default()
    });
    let state = Arc::new(AppState::new(config, &data_dir)?);
    install_fatal_handler(&handle, &state);

    // Everything else assumes the command session is up once configured.
    if let Some(target) = state.config.persistent_shell.resolved_target() {
        let timeout = state.config.persistent_shell.startup_timeout();
        if let Err(e) = tauri::async_runtime::block_on(state.persistent.initialize(target, timeout)) {
            error!(error = %e, "command session failed to start");
            let _ = handle.emit(FATAL_EVENT, e.to_string());
            show_fatal_dialog(&e);
            return Err(e.into());
        }
    }

    app.manage(state);
    info!("host ready");
    Ok(())
}

fn on_exit_requested(app: &AppHandle, code: Option<i32>, api: &tauri::ExitRequestApi) {
    let Some(state) = app.try_state::<Arc<AppState>>() else {
        return;
    };
    let state = state.inner().clone();

    // Explicit exit (ours after the grace period, or fatal): just make sure
    // no PTY outlives us.
    if code.is_some() {
        state.terminals.kill_all();
        return;
    }
    if !state.begin_quit() {
        api.prevent_exit();
        return;
    }

    api.prevent_exit();
    let _ = app.emit(BEFORE_QUIT_EVENT, ());
    let handle = app.clone();
    tauri::async_runtime::spawn(async move {
        tokio::time::sleep(BEFORE_QUIT_GRACE).await;
        state.shutdown().await;
        handle.exit(0);
    });
}

#[cfg_attr(mobile, tauri::mobile_entry_point)]
pub fn run() {
    let app = tauri::Builder::default()
        .setup(setup)
        .on_window_event(|window, event| {
            if let WindowEvent::Destroyed = event {
                if let Some(state) = window.try_state::<Arc<AppState>>() {
                    state.terminals.kill_by_owner(window.label());
                }
            }
        })
        .invoke_handler(tauri::generate_handler![
            pty_start_direct,
            pty_start,
            pty_input,
            pty_resize,
            pty_kill,
            pty_snapshot_get,
            pty_snapshot_save,
            pty_snapshot_clear,
            cli_status,
        ])
        .build(tauri::generate_context!());

    let app = match app {
        Ok(app) => app,
        Err(e) => {
            error!(error = %e, "error while building tauri application");
            eprintln!("error while building tauri application: {e}");
            std::process::exit(1);
        }
    };

    app.run(|handle, event| {
        if let RunEvent::ExitRequested { code, api, .. } = event {
            on_exit_requested(handle, code, &api);
        }
    });
}
