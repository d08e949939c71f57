//! Error types for the multiplexer client.

use thiserror::Error;

use crate::storage::DatabaseError;
use crate::tab::TabState;

/// Errors returned by multiplexer operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// No tab with this id exists.
    #[error("tab not found: {0}")]
    TabNotFound(String),

    /// The operation is not allowed in the tab's current state.
    #[error("tab {tab_id} is {state}, cannot {operation}")]
    InvalidState {
        tab_id: String,
        state: TabState,
        operation: &'static str,
    },

    /// Creating another tab would exceed the configured limit.
    #[error("tab limit reached ({0})")]
    TabLimit(usize),

    /// Every tab id has been handed out.
    #[error("no tab ids left")]
    TabIdsExhausted,

    /// The tab has no open channel.
    #[error("tab {0} is not connected")]
    NotConnected(String),

    /// A reorder index is outside the tab list.
    #[error("invalid move {from} -> {to} for {len} tabs")]
    InvalidIndex { from: usize, to: usize, len: usize },

    /// A keyboard shortcut could not be parsed.
    #[error("invalid shortcut: {0}")]
    InvalidShortcut(String),

    /// The host URL is unusable.
    #[error("invalid host url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Opening the channel failed.
    #[error("connection failed: {0}")]
    Connect(String),

    /// Opening the channel took longer than the connect timeout.
    #[error("connection timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// A wire message could not be handled.
    #[error(transparent)]
    Protocol(#[from] protocol::ProtocolError),

    /// Tab persistence failed.
    #[error(transparent)]
    Storage(#[from] DatabaseError),
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
