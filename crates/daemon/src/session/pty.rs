//! PTY session management.
//!
//! A session owns one shell process running on a pseudo-terminal. Output is
//! read on a dedicated thread and delivered to whichever channel is currently
//! attached, or buffered in the session's backlog while none is.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use protocol::Geometry;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

use super::backlog::Backlog;

/// Unique identifier for a session.
pub type SessionId = String;

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The session was not found.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// The session has already been terminated.
    #[error("session already terminated: {0}")]
    AlreadyTerminated(SessionId),

    /// Failed to spawn the PTY.
    #[error("failed to spawn PTY: {0}")]
    SpawnFailed(String),

    /// Failed to write to the PTY.
    #[error("failed to write to PTY: {0}")]
    WriteFailed(String),

    /// Failed to resize the PTY.
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),

    /// Failed to kill the session.
    #[error("failed to kill session: {0}")]
    KillFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// How a shell process ended.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionStatus {
    /// Exit code when the process exited on its own.
    pub exit_code: Option<i32>,
    /// Signal name when the process was terminated by a signal.
    pub signal: Option<String>,
}

impl SessionStatus {
    /// Status of a process that exited with `code`.
    pub fn exited(code: i32) -> Self {
        Self {
            exit_code: Some(code),
            signal: None,
        }
    }

    /// Status of a process terminated by `signal`.
    pub fn signaled(signal: impl Into<String>) -> Self {
        Self {
            exit_code: None,
            signal: Some(signal.into()),
        }
    }
}

/// Prefix portable-pty uses when rendering a signal termination.
const TERMINATED_BY: &str = "Terminated by ";

/// Extracts the signal name from a rendered portable-pty exit status.
fn signal_name(rendered: &str) -> Option<&str> {
    rendered
        .strip_prefix(TERMINATED_BY)
        .map(str::trim)
        .filter(|name| !name.is_empty())
}

impl From<&portable_pty::ExitStatus> for SessionStatus {
    // portable-pty 0.8 keeps the signal private; it only shows up in Display.
    fn from(status: &portable_pty::ExitStatus) -> Self {
        let rendered = status.to_string();
        match signal_name(&rendered) {
            Some(signal) => Self::signaled(signal),
            None => Self::exited(status.exit_code() as i32),
        }
    }
}

/// Event delivered to the attached channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyEvent {
    /// Raw bytes read from the PTY.
    Output(Vec<u8>),
    /// The shell exited. Always the last event.
    Exit(SessionStatus),
}

/// Receiving half of an attachment.
///
/// The receiver yields `None` without a preceding [`PtyEvent::Exit`] when a
/// newer channel took over the session.
#[derive(Debug)]
pub struct Attachment {
    /// Attachment generation; pass it back to [`Session::detach`].
    pub epoch: u64,
    /// Session events in PTY order.
    pub events: mpsc::UnboundedReceiver<PtyEvent>,
}

/// Everything needed to launch a shell.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    /// Shell executable.
    pub shell: String,
    /// Shell arguments.
    pub args: Vec<String>,
    /// Working directory, already validated.
    pub cwd: PathBuf,
    /// Initial terminal size.
    pub geometry: Geometry,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
    /// Backlog capacity in bytes.
    pub backlog_bytes: usize,
}

/// Variables every shell gets so that TUIs render in full colour.
pub const TERMINAL_ENV: &[(&str, &str)] = &[
    ("TERM", "xterm-256color"),
    ("COLORTERM", "truecolor"),
    ("TERM_PROGRAM", "termbridge"),
];

/// Callback run once on the waiter thread after the shell exited.
pub type ExitHook = Box<dyn FnOnce() + Send>;

/// Buffer size for reading from PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// How long the waiter gives the reader to drain output after exit.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

struct Subscriber {
    epoch: u64,
    tx: mpsc::UnboundedSender<PtyEvent>,
}

/// Where PTY output goes: the attached channel, or the backlog.
struct OutputSink {
    subscriber: Option<Subscriber>,
    backlog: Backlog,
    exit: Option<SessionStatus>,
    /// Last attachment epoch handed out.
    epoch: u64,
}

impl OutputSink {
    fn deliver(&mut self, chunk: Vec<u8>) {
        if self.exit.is_some() {
            return;
        }
        if let Some(ref subscriber) = self.subscriber {
            match subscriber.tx.send(PtyEvent::Output(chunk)) {
                Ok(()) => return,
                Err(mpsc::error::SendError(event)) => {
                    self.subscriber = None;
                    if let PtyEvent::Output(chunk) = event {
                        self.backlog.push(&chunk);
                    }
                    return;
                }
            }
        }
        self.backlog.push(&chunk);
    }

    fn finish(&mut self, status: SessionStatus) {
        if self.exit.is_some() {
            return;
        }
        if let Some(subscriber) = self.subscriber.take() {
            let _ = subscriber.tx.send(PtyEvent::Exit(status.clone()));
        }
        self.exit = Some(status);
    }
}

/// A PTY session with a shell process.
pub struct Session {
    /// Session identifier.
    id: SessionId,

    /// Registry generation, distinguishes sessions reusing an id.
    serial: u64,

    /// Shell that was launched.
    shell: String,

    /// Working directory actually used.
    cwd: PathBuf,

    /// Process ID of the shell, which is also its process group ID.
    pid: u32,

    /// The PTY master handle.
    master: StdMutex<Box<dyn MasterPty + Send>>,

    /// The writer for the PTY.
    writer: Mutex<Box<dyn Write + Send>>,

    /// Handle used to terminate the child.
    killer: StdMutex<Box<dyn ChildKiller + Send + Sync>>,

    /// Current terminal size.
    geometry: StdMutex<Geometry>,

    /// Output routing, shared with the reader and waiter threads.
    sink: Arc<StdMutex<OutputSink>>,

    /// Flag indicating if the session is still running.
    running: Arc<AtomicBool>,

    /// Set once [`Session::kill`] ran.
    killed: AtomicBool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("serial", &self.serial)
            .field("shell", &self.shell)
            .field("cwd", &self.cwd)
            .field("pid", &self.pid)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Session {
    /// Spawns a shell on a fresh PTY.
    ///
    /// The shell becomes a session leader with the PTY as its controlling
    /// terminal, so its pid doubles as the process group id. `on_exit` runs
    /// on the waiter thread after the exit status has been delivered.
    pub fn spawn(
        id: SessionId,
        serial: u64,
        options: SpawnOptions,
        on_exit: Option<ExitHook>,
    ) -> Result<Self, SessionError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(pty_size(options.geometry))
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&options.shell);
        cmd.args(&options.args);
        cmd.cwd(&options.cwd);
        for (key, value) in TERMINAL_ENV {
            cmd.env(key, value);
        }
        for (key, value) in &options.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::SpawnFailed(format!("{}: {}", options.shell, e)))?;

        // The master must be the last holder of the terminal for EOF to
        // reach the reader once the shell exits.
        drop(pair.slave);

        let pid = child
            .process_id()
            .ok_or_else(|| SessionError::SpawnFailed("child has no process id".to_string()))?;

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;
        let killer = child.clone_killer();

        let sink = Arc::new(StdMutex::new(OutputSink {
            subscriber: None,
            backlog: Backlog::new(options.backlog_bytes),
            exit: None,
            epoch: 0,
        }));
        let running = Arc::new(AtomicBool::new(true));

        let (drained_tx, drained_rx) = std_mpsc::channel::<()>();
        spawn_reader(&id, reader, Arc::clone(&sink), drained_tx)?;
        spawn_waiter(
            &id,
            child,
            Arc::clone(&sink),
            Arc::clone(&running),
            drained_rx,
            on_exit,
        )?;

        tracing::info!(
            session_id = %id,
            pid,
            shell = %options.shell,
            cwd = %options.cwd.display(),
            cols = options.geometry.cols,
            rows = options.geometry.rows,
            "Spawned PTY session"
        );

        Ok(Self {
            id,
            serial,
            shell: options.shell,
            cwd: options.cwd,
            pid,
            master: StdMutex::new(pair.master),
            writer: Mutex::new(writer),
            killer: StdMutex::new(killer),
            geometry: StdMutex::new(options.geometry),
            sink,
            running,
            killed: AtomicBool::new(false),
        })
    }

    /// Returns the session ID.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Returns the registry generation of this session.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Returns the shell that was launched.
    pub fn shell(&self) -> &str {
        &self.shell
    }

    /// Returns the working directory actually used.
    pub fn cwd(&self) -> &std::path::Path {
        &self.cwd
    }

    /// Returns the process ID.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Returns the current terminal size.
    pub fn geometry(&self) -> Geometry {
        *lock(&self.geometry)
    }

    /// Checks if the session is still running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns the exit status once the shell has exited.
    pub fn exit_status(&self) -> Option<SessionStatus> {
        lock(&self.sink).exit.clone()
    }

    /// Whether a channel is currently attached.
    pub fn is_attached(&self) -> bool {
        lock(&self.sink).subscriber.is_some()
    }

    /// Attaches a new channel, detaching any previous one.
    ///
    /// Output buffered while detached is replayed first. If the shell has
    /// already exited the receiver gets the exit event and then closes.
    pub fn attach(&self) -> Attachment {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut sink = lock(&self.sink);

        sink.epoch += 1;
        let epoch = sink.epoch;

        let replay = sink.backlog.take();
        if !replay.is_empty() {
            tracing::debug!(session_id = %self.id, bytes = replay.len(), "Replaying backlog");
            let _ = tx.send(PtyEvent::Output(replay));
        }

        let exited = sink.exit.clone();
        if let Some(status) = exited {
            let _ = tx.send(PtyEvent::Exit(status));
        } else if sink.subscriber.replace(Subscriber { epoch, tx }).is_some() {
            tracing::info!(session_id = %self.id, epoch, "Channel took over session");
        }

        Attachment { epoch, events: rx }
    }

    /// Detaches the channel with the given epoch.
    ///
    /// Returns `false` when that channel is no longer the attached one.
    pub fn detach(&self, epoch: u64) -> bool {
        let mut sink = lock(&self.sink);
        let current = sink.subscriber.as_ref().map(|s| s.epoch);
        if current == Some(epoch) {
            sink.subscriber = None;
            true
        } else {
            false
        }
    }

    /// Whether the session is still detached from the channel with `epoch`,
    /// with no attachment since.
    pub fn detached_since(&self, epoch: u64) -> bool {
        let sink = lock(&self.sink);
        sink.subscriber.is_none() && sink.epoch == epoch
    }

    /// Writes data to the PTY.
    pub async fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        if !self.is_running() {
            return Err(SessionError::AlreadyTerminated(self.id.clone()));
        }

        let mut writer = self.writer.lock().await;
        writer
            .write_all(data)
            .map_err(|e| SessionError::WriteFailed(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| SessionError::WriteFailed(e.to_string()))?;

        Ok(())
    }

    /// Resizes the PTY.
    ///
    /// Returns `Ok(false)` without touching the PTY when the geometry is
    /// unchanged or has a zero dimension.
    pub fn resize(&self, geometry: Geometry) -> Result<bool, SessionError> {
        if !geometry.is_valid() {
            tracing::warn!(
                session_id = %self.id,
                cols = geometry.cols,
                rows = geometry.rows,
                "Ignoring resize with zero dimension"
            );
            return Ok(false);
        }

        let mut current = lock(&self.geometry);
        if *current == geometry {
            return Ok(false);
        }

        lock(&self.master)
            .resize(pty_size(geometry))
            .map_err(|e| SessionError::ResizeFailed(e.to_string()))?;
        *current = geometry;

        tracing::debug!(
            session_id = %self.id,
            cols = geometry.cols,
            rows = geometry.rows,
            "Resized PTY"
        );
        Ok(true)
    }

    /// Kills the shell's process group.
    ///
    /// Sends `SIGHUP` to the group, then terminates the child through the
    /// PTY handle. Calling it again is a no-op.
    pub fn kill(&self) -> Result<(), SessionError> {
        if self.killed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if !self.is_running() {
            return Ok(());
        }

        #[cfg(unix)]
        {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            if let Err(e) = killpg(Pid::from_raw(self.pid as i32), Signal::SIGHUP) {
                tracing::debug!(session_id = %self.id, pid = self.pid, error = %e, "killpg failed");
            }
        }

        let result = lock(&self.killer).kill();
        match result {
            Ok(()) => {}
            // The group may already be gone after SIGHUP.
            Err(_) if !self.is_running() => {}
            Err(e) => return Err(SessionError::KillFailed(e.to_string())),
        }

        tracing::info!(session_id = %self.id, pid = self.pid, "Killed PTY session");
        Ok(())
    }
}

fn pty_size(geometry: Geometry) -> PtySize {
    PtySize {
        rows: geometry.rows,
        cols: geometry.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Locks a std mutex, recovering the data if a holder panicked.
fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn spawn_reader(
    id: &str,
    mut reader: Box<dyn Read + Send>,
    sink: Arc<StdMutex<OutputSink>>,
    drained: std_mpsc::Sender<()>,
) -> Result<(), SessionError> {
    let session_id = id.to_string();
    std::thread::Builder::new()
        .name(format!("pty-read-{}", short_id(id)))
        .spawn(move || {
            let mut buffer = [0u8; READ_BUFFER_SIZE];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => lock(&sink).deliver(buffer[..n].to_vec()),
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        // EIO is how Linux reports a hung-up PTY.
                        tracing::debug!(session_id = %session_id, error = %e, "PTY read ended");
                        break;
                    }
                }
            }
            drop(drained);
        })?;
    Ok(())
}

fn spawn_waiter(
    id: &str,
    mut child: Box<dyn Child + Send + Sync>,
    sink: Arc<StdMutex<OutputSink>>,
    running: Arc<AtomicBool>,
    drained: std_mpsc::Receiver<()>,
    on_exit: Option<ExitHook>,
) -> Result<(), SessionError> {
    let session_id = id.to_string();
    std::thread::Builder::new()
        .name(format!("pty-wait-{}", short_id(id)))
        .spawn(move || {
            let status = match child.wait() {
                Ok(status) => SessionStatus::from(&status),
                Err(e) => {
                    tracing::warn!(session_id = %session_id, error = %e, "Failed to wait for shell");
                    SessionStatus::default()
                }
            };

            // Let the reader flush what the shell wrote before exiting. A
            // background job holding the terminal open must not delay the
            // exit event forever.
            let _ = drained.recv_timeout(DRAIN_TIMEOUT);

            running.store(false, Ordering::SeqCst);
            lock(&sink).finish(status.clone());

            tracing::info!(
                session_id = %session_id,
                exit_code = ?status.exit_code,
                signal = ?status.signal,
                "Shell exited"
            );

            if let Some(hook) = on_exit {
                hook();
            }
        })?;
    Ok(())
}

fn short_id(id: &str) -> &str {
    match id.char_indices().nth(8) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}
