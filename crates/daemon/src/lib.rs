//! # termbridge session host
//!
//! Runs interactive shells on pseudo-terminals and exposes each one over a
//! WebSocket channel. A channel names its session in the upgrade request's
//! query string (`?sessionId=..&cwd=..&cols=..&rows=..`); the host attaches
//! the channel to the live session with that id or spawns a new shell.
//!
//! ```text
//!  WebSocket ──► server ──► SessionRegistry ──► Session (PTY + shell)
//!     ▲            │                              │
//!     └── output ◄─┴──────── reader thread ◄──────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use daemon::session::{resolve_shell, RegistrySettings, SessionRegistry};
//! use daemon::{Config, Server};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let shell = resolve_shell(config.session.default_shell.as_deref());
//!     let registry = Arc::new(SessionRegistry::new(RegistrySettings::from_config(&config, shell)));
//!
//!     let server = Server::bind(config.listen_addr()?, registry).await?;
//!     server.run(CancellationToken::new()).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: Shell resolution, PTY sessions and the session registry
//! - [`server`]: WebSocket listener and per-channel relay

pub mod config;
pub mod server;
pub mod session;

// Re-export protocol for convenience
pub use protocol;

pub use config::{Config, ConfigError};
pub use server::{Server, ServerError};
pub use session::{Session, SessionError, SessionId, SessionRegistry, SessionStatus};
