use std::{
    collections::HashMap,
    fmt::Display,
    io::{Read, Write},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc, Mutex,
    },
    thread,
    time::Duration,
};

use portable_pty::{
    native_pty_system, Child, ChildKiller, CommandBuilder, ExitStatus, MasterPty, PtySize,
};
use tracing::{debug, info, warn};

use crate::terminal::banner::{self, BannerFilter};
use crate::terminal::decode::Utf8Carry;
use crate::terminal::session_manager::{
    PtyExit, PtySessionBackend, PtySink, RecordInfo, SpawnEnv, SpawnMode, SpawnSpec,
};
use crate::terminal::TerminalError;

/// Exit delivery waits this long for the reader to drain output the child
/// wrote just before exiting, so `exit` follows the last `data`.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

struct Session {
    mode: SpawnMode,
    cwd: PathBuf,
    pid: Option<u32>,
    writer: Mutex<Box<dyn Write + Send>>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    owner: Mutex<Option<Arc<dyn PtySink>>>,
    /// Set once the record has left the map; late output is dropped.
    retired: AtomicBool,
}

impl Session {
    fn owner(&self) -> Option<Arc<dyn PtySink>> {
        self.owner.lock().expect("poisoned pty owner lock").clone()
    }

    fn live_owner(&self) -> Option<Arc<dyn PtySink>> {
        self.owner().filter(|o| o.is_alive())
    }

    fn emit_data(&self, id: &str, data: &str) {
        if data.is_empty() || self.retired.load(Ordering::Acquire) {
            return;
        }
        if let Some(owner) = self.live_owner() {
            owner.send_data(id, data);
        }
    }

    fn info(&self, id: &str) -> RecordInfo {
        RecordInfo {
            id: id.to_string(),
            mode: self.mode,
            cwd: self.cwd.clone(),
            owner: self.owner().map(|o| o.owner_id().to_string()),
            pid: self.pid,
        }
    }

    /// Best-effort terminate, but never block the caller on it.
    fn terminate(self: Arc<Self>, id: String) {
        self.retired.store(true, Ordering::Release);
        thread::spawn(move || {
            if let Err(e) = self.killer.lock().expect("poisoned killer lock").kill() {
                debug!(%id, error = %e, "pty kill failed; process likely gone");
            }
        });
    }
}

/// Output path of one PTY: decoded text, optionally through the banner filter.
#[derive(Clone)]
struct Output {
    id: String,
    session: Arc<Session>,
    banner: Option<Arc<Mutex<BannerFilter>>>,
}

impl Output {
    fn forward(&self, text: &str) {
        match &self.banner {
            None => self.session.emit_data(&self.id, text),
            // Emit under the filter lock so the deadline flush cannot reorder.
            Some(filter) => {
                let mut filter = filter.lock().expect("poisoned banner filter lock");
                if let Some(out) = filter.push(text) {
                    self.session.emit_data(&self.id, &out);
                }
            }
        }
    }

    fn flush(&self) {
        if let Some(filter) = &self.banner {
            let mut filter = filter.lock().expect("poisoned banner filter lock");
            if let Some(out) = filter.flush() {
                self.session.emit_data(&self.id, &out);
            }
        }
    }

    fn arm_deadline(&self) {
        let output = self.clone();
        thread::spawn(move || {
            thread::sleep(banner::DEADLINE);
            output.flush();
        });
    }
}

fn spawn_error(program: &str, e: impl Display) -> TerminalError {
    TerminalError::Spawn {
        program: program.to_string(),
        reason: e.to_string(),
    }
}

/// Kill a child that will never be registered and collect it, so it does not
/// linger as a zombie.
fn reap(mut child: Box<dyn Child + Send + Sync>) -> Option<ExitStatus> {
    if let Err(e) = child.kill() {
        debug!(error = %e, "kill of unregistered pty child failed");
    }
    child.wait().ok()
}

fn apply_env(cmd: &mut CommandBuilder, env: &SpawnEnv) {
    match env {
        SpawnEnv::Exact(vars) => {
            cmd.env_clear();
            for (k, v) in vars {
                cmd.env(k, v);
            }
        }
        SpawnEnv::Inherit { remove, set } => {
            for k in remove {
                cmd.env_remove(k);
            }
            for (k, v) in set {
                cmd.env(k, v);
            }
        }
    }
}

#[derive(Default)]
pub struct PortablePtyBackend {
    sessions: Arc<Mutex<HashMap<String, Arc<Session>>>>,
}

impl PortablePtyBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, id: &str) -> Result<Arc<Session>, TerminalError> {
        self.sessions
            .lock()
            .expect("poisoned terminal sessions lock")
            .get(id)
            .cloned()
            .ok_or(TerminalError::NotFound)
    }
}

impl PtySessionBackend for PortablePtyBackend {
    fn spawn(&self, spec: SpawnSpec, owner: Option<Arc<dyn PtySink>>) -> Result<(), TerminalError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: spec.rows,
                cols: spec.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| spawn_error(&spec.program, e))?;

        let mut cmd = CommandBuilder::new(&spec.program);
        cmd.args(&spec.args);
        cmd.cwd(&spec.cwd);
        apply_env(&mut cmd, &spec.env);

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| spawn_error(&spec.program, e))?;
        // The child has its own handle on the slave side; keeping ours open
        // would hide EOF from the reader.
        drop(pair.slave);

        let killer = child.clone_killer();
        let pid = child.process_id();

        let io = pair
            .master
            .try_clone_reader()
            .and_then(|reader| pair.master.take_writer().map(|writer| (reader, writer)));
        let (mut reader, writer) = match io {
            Ok(io) => io,
            Err(e) => {
                reap(child);
                return Err(TerminalError::Backend(e.to_string()));
            }
        };

        let session = Arc::new(Session {
            mode: spec.mode,
            cwd: spec.cwd.clone(),
            pid,
            writer: Mutex::new(writer),
            master: Mutex::new(pair.master),
            killer: Mutex::new(killer),
            owner: Mutex::new(None),
            retired: AtomicBool::new(false),
        });

        let replaced = {
            let mut map = self.sessions.lock().expect("poisoned terminal sessions lock");
            let previous = map.remove(&spec.id);
            let owner = owner.or_else(|| previous.as_ref().and_then(|p| p.owner()));
            *session.owner.lock().expect("poisoned pty owner lock") = owner;
            map.insert(spec.id.clone(), session.clone());
            previous
        };
        if let Some(previous) = replaced {
            debug!(id = %spec.id, "replacing live pty with the same id");
            previous.terminate(spec.id.clone());
        }

        info!(
            id = %spec.id,
            mode = ?spec.mode,
            pid = ?pid,
            cwd = %spec.cwd.display(),
            "pty started"
        );

        // Read loop: PTY -> owner.
        let output = Output {
            id: spec.id.clone(),
            session: session.clone(),
            banner: spec
                .filter_banner
                .then(|| Arc::new(Mutex::new(BannerFilter::new()))),
        };
        let (reader_done_tx, reader_done_rx) = mpsc::channel::<()>();
        thread::spawn(move || {
            let mut decoder = Utf8Carry::default();
            let mut armed = false;
            let mut buf = [0u8; 8192];
            loop {
                let n = match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(_) => break,
                };
                if !armed && output.banner.is_some() {
                    output.arm_deadline();
                    armed = true;
                }
                let text = decoder.push(&buf[..n]);
                if !text.is_empty() {
                    output.forward(&text);
                }
            }
            output.forward(&decoder.finish());
            output.flush();
            let _ = reader_done_tx.send(());
        });

        // Finalize on child exit (more reliable than PTY EOF on Windows).
        let sessions = self.sessions.clone();
        let id = spec.id;
        thread::spawn(move || {
            let exit = match child.wait() {
                Ok(status) => PtyExit {
                    exit_code: status.exit_code(),
                    signal: status.signal().map(str::to_string),
                },
                Err(e) => {
                    warn!(%id, error = %e, "waiting on pty child failed");
                    PtyExit {
                        exit_code: 1,
                        signal: None,
                    }
                }
            };
            let _ = reader_done_rx.recv_timeout(READER_DRAIN_TIMEOUT);

            // Only the record still registered under `id` reports its exit; a
            // killed or replaced one goes quietly.
            let current = {
                let mut map = sessions.lock().expect("poisoned terminal sessions lock");
                let is_current = map.get(&id).is_some_and(|s| Arc::ptr_eq(s, &session));
                if is_current {
                    map.remove(&id);
                }
                is_current
            };
            session.retired.store(true, Ordering::Release);
            if current {
                info!(%id, code = exit.exit_code, signal = ?exit.signal, "pty exited");
                if let Some(owner) = session.live_owner() {
                    owner.send_exit(&id, &exit);
                }
            }
        });

        Ok(())
    }

    fn write(&self, id: &str, data: &str) -> Result<(), TerminalError> {
        let session = self.get(id)?;
        let mut w = session.writer.lock().expect("poisoned pty writer lock");
        w.write_all(data.as_bytes())
            .map_err(|e| TerminalError::Backend(e.to_string()))?;
        w.flush().ok();
        Ok(())
    }

    fn resize(&self, id: &str, cols: u16, rows: u16) -> Result<(), TerminalError> {
        let session = self.get(id)?;
        let master = session.master.lock().expect("poisoned pty master lock");
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| TerminalError::Backend(e.to_string()))
    }

    fn close(&self, id: &str) -> Result<(), TerminalError> {
        let session = {
            let mut map = self.sessions.lock().expect("poisoned terminal sessions lock");
            map.remove(id)
        };

        let Some(session) = session else {
            return Err(TerminalError::NotFound);
        };
        session.terminate(id.to_string());
        Ok(())
    }

    fn close_where(&self, pred: &dyn Fn(&RecordInfo) -> bool) -> usize {
        let victims: Vec<(String, Arc<Session>)> = {
            let mut map = self.sessions.lock().expect("poisoned terminal sessions lock");
            let ids: Vec<String> = map
                .iter()
                .filter(|(id, s)| pred(&s.info(id)))
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| map.remove(&id).map(|s| (id, s)))
                .collect()
        };
        let count = victims.len();
        for (id, session) in victims {
            session.terminate(id);
        }
        count
    }

    fn info(&self, id: &str) -> Option<RecordInfo> {
        self.sessions
            .lock()
            .expect("poisoned terminal sessions lock")
            .get(id)
            .map(|s| s.info(id))
    }

    fn len(&self) -> usize {
        self.sessions
            .lock()
            .expect("poisoned terminal sessions lock")
            .len()
    }
}
