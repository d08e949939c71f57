//! Session management module.
//!
//! This module provides shell resolution, PTY spawning and the registry
//! that maps session ids to live sessions across channel reconnects.

pub mod backlog;
pub mod pty;
pub mod registry;
pub mod shell;

pub use backlog::Backlog;
pub use pty::{Attachment, PtyEvent, Session, SessionError, SessionId, SessionStatus, SpawnOptions};
pub use registry::{RegistrySettings, Resolved, SessionInfo, SessionRegistry};
pub use shell::{resolve_cwd, resolve_shell};
