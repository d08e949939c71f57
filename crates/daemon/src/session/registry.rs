//! Session registry.
//!
//! Maps session ids to live PTY sessions. A channel naming a live session
//! attaches to it; any other id gets a freshly spawned shell. The
//! check-and-insert is atomic per id so concurrent channels naming the same
//! unseen id never spawn two processes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use protocol::{ChannelParams, Geometry};
use uuid::Uuid;

use super::pty::{Attachment, ExitHook, Session, SessionError, SessionId, SpawnOptions};
use super::shell;
use crate::config::Config;

/// Settings shared by every session the registry spawns.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// Resolved shell executable.
    pub shell: String,
    /// Arguments passed to the shell.
    pub shell_args: Vec<String>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
    /// Geometry used when a channel does not request one.
    pub default_geometry: Geometry,
    /// How long a detached session survives. Zero kills on detach.
    pub reconnect_grace: Duration,
    /// Output kept for replay while detached.
    pub backlog_bytes: usize,
}

impl RegistrySettings {
    /// Builds the settings for `shell` from the loaded configuration.
    pub fn from_config(config: &Config, shell: String) -> Self {
        let mut env: Vec<(String, String)> = config
            .session
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.sort();

        Self {
            shell,
            shell_args: shell::shell_args(config.session.login_shell),
            env,
            default_geometry: Geometry {
                cols: config.session.default_cols,
                rows: config.session.default_rows,
            },
            reconnect_grace: Duration::from_secs(config.session.reconnect_grace_secs),
            backlog_bytes: config.session.backlog_bytes,
        }
    }

    /// Settings for `shell` with everything else at its default.
    pub fn with_shell(shell: impl Into<String>) -> Self {
        Self::from_config(&Config::default(), shell.into())
    }
}

/// Information about a registered session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Session ID.
    pub id: SessionId,
    /// Process ID.
    pub pid: u32,
    /// Working directory.
    pub cwd: PathBuf,
    /// Current terminal size.
    pub geometry: Geometry,
    /// Whether a channel is attached.
    pub attached: bool,
}

/// A channel's handle on a resolved session.
#[derive(Debug)]
pub struct Resolved {
    /// The live session.
    pub session: Arc<Session>,
    /// The channel's attachment.
    pub attachment: Attachment,
    /// Whether the session was spawned for this channel.
    pub spawned: bool,
}

/// Registry of live sessions keyed by session id.
pub struct SessionRegistry {
    sessions: Arc<DashMap<SessionId, Arc<Session>>>,
    settings: RegistrySettings,
    next_serial: AtomicU64,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new(settings: RegistrySettings) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            settings,
            next_serial: AtomicU64::new(1),
        }
    }

    /// Returns the registry settings.
    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    /// Resolves a channel to a session, attaching to a live one or
    /// spawning a new shell.
    ///
    /// A channel without a session id always gets a new anonymous session.
    /// On spawn failure nothing is registered.
    pub fn resolve(&self, params: &ChannelParams) -> Result<Resolved, SessionError> {
        let geometry = params.geometry_or(self.settings.default_geometry);
        let id = match params.session_id {
            Some(ref id) => id.clone(),
            None => format!("anon-{}", Uuid::new_v4()),
        };

        match self.sessions.entry(id.clone()) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_running() {
                    let session = Arc::clone(entry.get());
                    let attachment = session.attach();
                    if let Err(e) = session.resize(geometry) {
                        tracing::warn!(session_id = %id, error = %e, "Resize on attach failed");
                    }
                    tracing::info!(
                        session_id = %id,
                        pid = session.pid(),
                        epoch = attachment.epoch,
                        "Attached to existing session"
                    );
                    return Ok(Resolved {
                        session,
                        attachment,
                        spawned: false,
                    });
                }

                // The shell exited but its exit hook has not run yet.
                let session = Arc::new(self.spawn(&id, params.cwd.as_deref(), geometry)?);
                entry.insert(Arc::clone(&session));
                let attachment = session.attach();
                Ok(Resolved {
                    session,
                    attachment,
                    spawned: true,
                })
            }
            Entry::Vacant(entry) => {
                let session = Arc::new(self.spawn(&id, params.cwd.as_deref(), geometry)?);
                entry.insert(Arc::clone(&session));
                let attachment = session.attach();
                Ok(Resolved {
                    session,
                    attachment,
                    spawned: true,
                })
            }
        }
    }

    fn spawn(
        &self,
        id: &str,
        requested_cwd: Option<&str>,
        geometry: Geometry,
    ) -> Result<Session, SessionError> {
        let serial = self.next_serial.fetch_add(1, Ordering::SeqCst);
        let options = SpawnOptions {
            shell: self.settings.shell.clone(),
            args: self.settings.shell_args.clone(),
            cwd: shell::resolve_cwd(requested_cwd),
            geometry,
            env: self.settings.env.clone(),
            backlog_bytes: self.settings.backlog_bytes,
        };

        let sessions = Arc::downgrade(&self.sessions);
        let session_id = id.to_string();
        let on_exit: ExitHook = Box::new(move || {
            if let Some(sessions) = sessions.upgrade() {
                if sessions
                    .remove_if(&session_id, |_, s| s.serial() == serial)
                    .is_some()
                {
                    tracing::debug!(session_id = %session_id, "Removed exited session");
                }
            }
        });

        Session::spawn(id.to_string(), serial, options, Some(on_exit)).inspect_err(|e| {
            tracing::error!(session_id = %id, error = %e, "Failed to spawn session");
        })
    }

    /// Detaches a channel from its session.
    ///
    /// Stale detaches (a newer channel already took over) are ignored.
    /// Without a grace window the session is killed immediately; otherwise
    /// it is killed when the window expires without a reattachment.
    pub fn detach(&self, session: &Arc<Session>, epoch: u64) {
        if !session.detach(epoch) {
            tracing::debug!(session_id = %session.id(), epoch, "Ignoring stale detach");
            return;
        }

        if self.settings.reconnect_grace.is_zero() {
            terminate(&self.sessions, session);
            return;
        }

        tracing::info!(
            session_id = %session.id(),
            grace_secs = self.settings.reconnect_grace.as_secs(),
            "Session detached, waiting for reconnect"
        );

        let sessions = Arc::clone(&self.sessions);
        let session = Arc::clone(session);
        let grace = self.settings.reconnect_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if session.is_running() && session.detached_since(epoch) {
                tracing::info!(session_id = %session.id(), "Reconnect window expired");
                terminate(&sessions, &session);
            }
        });
    }

    /// Kills a session and removes it from the registry.
    pub fn kill(&self, id: &str) -> Result<(), SessionError> {
        let session = self
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        terminate(&self.sessions, &session);
        Ok(())
    }

    /// Returns a session by id.
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Checks whether a session is registered.
    pub fn exists(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    /// Returns the number of registered sessions.
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Lists registered sessions.
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self
            .sessions
            .iter()
            .map(|entry| {
                let session = entry.value();
                SessionInfo {
                    id: entry.key().clone(),
                    pid: session.pid(),
                    cwd: session.cwd().to_path_buf(),
                    geometry: session.geometry(),
                    attached: session.is_attached(),
                }
            })
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// Kills every registered session.
    pub fn shutdown(&self) {
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.sessions.clear();

        let mut failures: HashMap<SessionId, String> = HashMap::new();
        for session in &sessions {
            if let Err(e) = session.kill() {
                failures.insert(session.id().clone(), e.to_string());
            }
        }

        tracing::info!(
            killed = sessions.len() - failures.len(),
            failed = failures.len(),
            "Session registry shut down"
        );
        for (id, error) in failures {
            tracing::warn!(session_id = %id, error = %error, "Failed to kill session");
        }
    }
}

fn terminate(sessions: &DashMap<SessionId, Arc<Session>>, session: &Arc<Session>) {
    sessions.remove_if(session.id(), |_, s| Arc::ptr_eq(s, session));
    if let Err(e) = session.kill() {
        tracing::warn!(session_id = %session.id(), error = %e, "Failed to kill session");
    }
}
