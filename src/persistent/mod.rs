//! One long-lived shell, kept warm, that runs short probe commands.
//!
//! Commands are multiplexed over the shell's stdin. Each one is wrapped so its
//! output is framed by per-call markers on both stdout and stderr, which lets
//! concurrent callers get exactly their own output back.

mod frame;

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::persistent::frame::{Frame, FrameParser};
use crate::terminal::Utf8Carry;

/// After the process exits, output still in the pipes gets this long to land.
const PUMP_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Where the persistent shell runs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ShellTarget {
    /// `bash -l` inside a WSL distribution.
    Wsl { distribution: String },
    /// Any program that reads shell commands on stdin.
    Command {
        program: PathBuf,
        #[serde(default)]
        args: Vec<String>,
    },
}

impl ShellTarget {
    fn command(&self) -> Command {
        match self {
            ShellTarget::Wsl { distribution } => {
                let mut cmd = Command::new("wsl.exe");
                cmd.args(["-d", distribution.as_str(), "--", "bash", "-l"]);
                cmd
            }
            ShellTarget::Command { program, args } => {
                let mut cmd = Command::new(program);
                cmd.args(args);
                cmd
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("command session did not become ready within {0:?}")]
    StartupTimeout(Duration),
    #[error("command session process error: {0}")]
    Process(String),
    #[error("command session is not ready")]
    NotReady,
    #[error("command session closed")]
    Closed,
    #[error("command session terminated unexpectedly (code: {code:?})")]
    Terminated { code: Option<i32> },
    #[error("command session i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// Title and text for the blocking notice shown before the app gives up on
    /// a session that failed to start or died.
    pub fn fatal_notice(&self) -> (&'static str, String) {
        const CLOSING: &str = "The application will now close.";
        match self {
            SessionError::StartupTimeout(timeout) => (
                "Command environment did not start",
                format!(
                    "The command environment was not ready after {} seconds. {CLOSING}",
                    timeout.as_secs()
                ),
            ),
            SessionError::Terminated { .. } => {
                ("Command environment stopped", format!("The {self}. {CLOSING}"))
            }
            other => ("Command environment failed", format!("{other}. {CLOSING}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Invoked once if the shell dies after it became ready.
pub type FatalHandler = Arc<dyn Fn(&SessionError) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

enum Phase {
    Idle,
    Starting {
        sentinel: String,
        ready_tx: oneshot::Sender<Result<(), SessionError>>,
    },
    Ready,
}

struct Pending {
    stdout: Option<Frame>,
    stderr: Option<Frame>,
    tx: oneshot::Sender<Result<ExecOutput, SessionError>>,
}

impl Pending {
    fn try_finish(&mut self) -> Option<ExecOutput> {
        let (out, err) = (self.stdout.as_ref()?, self.stderr.as_ref()?);
        Some(ExecOutput {
            stdout: out.body.clone(),
            stderr: err.body.clone(),
            exit_code: out.exit_code,
        })
    }
}

struct SessionState {
    /// Bumped on every start and shutdown; callbacks from an older process
    /// compare against it and go quiet.
    generation: u64,
    target: Option<ShellTarget>,
    phase: Phase,
    pending: HashMap<String, Pending>,
    stdout: FrameParser,
    stderr: FrameParser,
    kill: Option<oneshot::Sender<()>>,
    on_fatal: Option<FatalHandler>,
}

impl SessionState {
    fn reset_streams(&mut self) {
        self.stdout = FrameParser::default();
        self.stderr = FrameParser::default();
    }

    fn reject_pending(&mut self) {
        for (_, p) in self.pending.drain() {
            let _ = p.tx.send(Err(SessionError::Closed));
        }
    }

    fn on_output(&mut self, stream: Stream, text: &str) {
        let parser = match stream {
            Stream::Stdout => &mut self.stdout,
            Stream::Stderr => &mut self.stderr,
        };
        parser.feed(text);

        if stream == Stream::Stdout {
            if let Phase::Starting { sentinel, .. } = &self.phase {
                if !parser.take_sentinel(sentinel) {
                    return;
                }
                if let Phase::Starting { ready_tx, .. } =
                    std::mem::replace(&mut self.phase, Phase::Ready)
                {
                    let _ = ready_tx.send(Ok(()));
                }
            }
        }

        let pending = &self.pending;
        let frames = parser.frames(|id| pending.contains_key(id));
        for frame in frames {
            let id = frame.id.clone();
            let Some(p) = self.pending.get_mut(&id) else {
                debug!(%id, ?stream, "frame for unknown command dropped");
                continue;
            };
            match stream {
                Stream::Stdout => p.stdout = Some(frame),
                Stream::Stderr => p.stderr = Some(frame),
            }
            if let Some(output) = p.try_finish() {
                if let Some(p) = self.pending.remove(&id) {
                    let _ = p.tx.send(Ok(output));
                }
            }
        }
    }
}

struct OpenStdin {
    generation: u64,
    pipe: ChildStdin,
}

struct Inner {
    state: Mutex<SessionState>,
    stdin: tokio::sync::Mutex<Option<OpenStdin>>,
}

impl Inner {
    fn state(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().expect("poisoned command session lock")
    }

    fn on_output(&self, generation: u64, stream: Stream, text: &str) {
        if text.is_empty() {
            return;
        }
        let mut st = self.state();
        if st.generation == generation {
            st.on_output(stream, text);
        }
    }

    async fn on_close(&self, generation: u64, code: Option<i32>) {
        let fatal = {
            let mut st = self.state();
            if st.generation != generation {
                // Shut down on purpose; nothing to report.
                return;
            }
            st.kill = None;
            st.reject_pending();
            st.reset_streams();
            match std::mem::replace(&mut st.phase, Phase::Idle) {
                Phase::Starting { ready_tx, .. } => {
                    let _ = ready_tx.send(Err(SessionError::Process(format!(
                        "shell exited with code {code:?} before it was ready"
                    ))));
                    None
                }
                Phase::Ready => st.on_fatal.clone().map(|h| (h, SessionError::Terminated { code })),
                Phase::Idle => None,
            }
        };

        {
            let mut stdin = self.stdin.lock().await;
            if stdin.as_ref().is_some_and(|s| s.generation == generation) {
                *stdin = None;
            }
        }

        if let Some((handler, err)) = fatal {
            error!(error = %err, "command session died after startup");
            handler(&err);
        } else {
            debug!(?code, "command session process closed");
        }
    }
}

/// Handle to the single persistent command session. Cheap to clone.
#[derive(Clone)]
pub struct PersistentSession {
    inner: Arc<Inner>,
}

impl Default for PersistentSession {
    fn default() -> Self {
        Self::new()
    }
}

impl PersistentSession {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(SessionState {
                    generation: 0,
                    target: None,
                    phase: Phase::Idle,
                    pending: HashMap::new(),
                    stdout: FrameParser::default(),
                    stderr: FrameParser::default(),
                    kill: None,
                    on_fatal: None,
                }),
                stdin: tokio::sync::Mutex::new(None),
            }),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.inner.state().phase, Phase::Ready)
    }

    pub fn target(&self) -> Option<ShellTarget> {
        self.inner.state().target.clone()
    }

    pub fn set_fatal_handler(&self, handler: FatalHandler) {
        self.inner.state().on_fatal = Some(handler);
    }

    /// Start the shell and wait until it answers a readiness probe.
    ///
    /// A session that is already running is shut down first.
    pub async fn initialize(&self, target: ShellTarget, timeout: Duration) -> Result<(), SessionError> {
        self.shutdown().await;

        let mut child = target
            .command()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SessionError::Process(e.to_string()))?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.start_kill();
            return Err(SessionError::Process("shell pipes unavailable".to_string()));
        };

        let nonce = Uuid::new_v4().simple().to_string();
        let (ready_tx, ready_rx) = oneshot::channel();
        let (kill_tx, kill_rx) = oneshot::channel();
        let generation = {
            let mut st = self.inner.state();
            st.generation += 1;
            st.target = Some(target.clone());
            st.phase = Phase::Starting {
                sentinel: format!("__READY_{nonce}__"),
                ready_tx,
            };
            st.kill = Some(kill_tx);
            st.reset_streams();
            st.generation
        };
        *self.inner.stdin.lock().await = Some(OpenStdin {
            generation,
            pipe: stdin,
        });

        let pumps = vec![
            tokio::spawn(pump(self.inner.clone(), generation, Stream::Stdout, stdout)),
            tokio::spawn(pump(self.inner.clone(), generation, Stream::Stderr, stderr)),
        ];
        tokio::spawn(watch(self.inner.clone(), generation, child, kill_rx, pumps));

        info!(?target, "starting command session");

        // printf keeps the literal sentinel out of any echo of the probe itself.
        let probe = format!("printf '__READY_%s__\\n' {nonce}\n");
        if let Err(e) = self.write_stdin(generation, &probe).await {
            debug!(error = %e, "readiness probe not written");
        }

        match tokio::time::timeout(timeout, ready_rx).await {
            Ok(Ok(Ok(()))) => {
                info!("command session ready");
                Ok(())
            }
            Ok(Ok(Err(e))) => {
                warn!(error = %e, "command session failed to start");
                Err(e)
            }
            Ok(Err(_)) => Err(SessionError::Process("startup aborted".to_string())),
            Err(_) => {
                warn!(?timeout, "command session startup timed out");
                self.shutdown().await;
                Err(SessionError::StartupTimeout(timeout))
            }
        }
    }

    /// Run one command in the warm shell and collect its output.
    ///
    /// Concurrent calls are fine; each resolves when its own end markers have
    /// been seen on both streams.
    ///
    /// There is no per-call timeout. A command that never lets the shell reach
    /// the end markers (an unbalanced quote, a read from stdin) hangs this call
    /// and every later one until the session is shut down.
    pub async fn exec(&self, command: &str) -> Result<ExecOutput, SessionError> {
        let id = Uuid::new_v4().simple().to_string();
        let (tx, rx) = oneshot::channel();
        let generation = {
            let mut st = self.inner.state();
            if !matches!(st.phase, Phase::Ready) {
                return Err(SessionError::NotReady);
            }
            st.pending.insert(
                id.clone(),
                Pending {
                    stdout: None,
                    stderr: None,
                    tx,
                },
            );
            st.generation
        };

        if let Err(e) = self.write_stdin(generation, &wrap_command(&id, command)).await {
            self.inner.state().pending.remove(&id);
            return Err(e);
        }
        rx.await.unwrap_or(Err(SessionError::Closed))
    }

    /// Close stdin, kill the shell and reject anything in flight. Idempotent.
    pub async fn shutdown(&self) {
        let kill = {
            let mut st = self.inner.state();
            st.generation += 1;
            st.reject_pending();
            st.reset_streams();
            // Dropping a pending ready sender tells a concurrent initialize to give up.
            st.phase = Phase::Idle;
            st.kill.take()
        };

        if let Some(mut open) = self.inner.stdin.lock().await.take() {
            let _ = open.pipe.shutdown().await;
        }
        if let Some(kill) = kill {
            let _ = kill.send(());
            info!("command session shut down");
        }
    }

    async fn write_stdin(&self, generation: u64, text: &str) -> Result<(), SessionError> {
        let mut guard = self.inner.stdin.lock().await;
        let Some(open) = guard.as_mut().filter(|s| s.generation == generation) else {
            return Err(SessionError::Closed);
        };
        open.pipe.write_all(text.as_bytes()).await?;
        open.pipe.flush().await?;
        Ok(())
    }
}

/// Echo the start marker on both streams, run the command, then echo the end
/// marker with its status on both streams.
fn wrap_command(id: &str, command: &str) -> String {
    format!(
        "echo __START_{id}__; echo __START_{id}__ 1>&2\n\
         {command}\n\
         __dash_rc=$?; echo __END_{id}_${{__dash_rc}}__ 1>&2; echo __END_{id}_${{__dash_rc}}__\n"
    )
}

async fn pump<R>(inner: Arc<Inner>, generation: u64, stream: Stream, mut reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut decoder = Utf8Carry::default();
    let mut buf = vec![0u8; 8192];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(?stream, error = %e, "command session read failed");
                break;
            }
        };
        let text = decoder.push(&buf[..n]);
        inner.on_output(generation, stream, &text);
    }
    let rest = decoder.finish();
    inner.on_output(generation, stream, &rest);
}

async fn watch(
    inner: Arc<Inner>,
    generation: u64,
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    pumps: Vec<JoinHandle<()>>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill_rx => {
            let _ = child.start_kill();
            child.wait().await
        }
    };
    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            warn!(error = %e, "waiting on command session failed");
            None
        }
    };
    for pump in pumps {
        let _ = tokio::time::timeout(PUMP_DRAIN_TIMEOUT, pump).await;
    }
    inner.on_close(generation, code).await;
}
