//! Wire message definitions for termbridge.
//!
//! Every message is a JSON object tagged by a `type` field. The client sends
//! [`ClientMessage`]s, the host answers with [`ServerMessage`]s. Incoming
//! client text goes through [`ClientFrame::parse`], which keeps the lenient
//! behaviour of treating anything that is not a known message as literal
//! keystrokes.

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Default terminal width when none is requested.
pub const DEFAULT_COLS: u16 = 80;

/// Default terminal height when none is requested.
pub const DEFAULT_ROWS: u16 = 24;

/// Character-grid size of a terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Geometry {
    /// Number of columns.
    pub cols: u16,
    /// Number of rows.
    pub rows: u16,
}

impl Geometry {
    /// Creates a geometry, rejecting zero dimensions.
    pub fn new(cols: u16, rows: u16) -> Result<Self> {
        if cols == 0 || rows == 0 {
            return Err(ProtocolError::InvalidGeometry { cols, rows });
        }
        Ok(Self { cols, rows })
    }

    /// Returns whether both dimensions are positive.
    pub fn is_valid(&self) -> bool {
        self.cols > 0 && self.rows > 0
    }
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
        }
    }
}

impl std::fmt::Display for Geometry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.cols, self.rows)
    }
}

/// Messages sent from the multiplexer client to the session host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Keystroke or paste bytes, written verbatim to the PTY.
    Input { data: String },
    /// New terminal geometry.
    Resize { cols: u16, rows: u16 },
}

impl ClientMessage {
    /// Builds an input message.
    pub fn input(data: impl Into<String>) -> Self {
        ClientMessage::Input { data: data.into() }
    }

    /// Builds a resize message from a geometry.
    pub fn resize(geometry: Geometry) -> Self {
        ClientMessage::Resize {
            cols: geometry.cols,
            rows: geometry.rows,
        }
    }

    /// Serializes the message to its JSON text form.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Messages sent from the session host to the multiplexer client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Session established. Always the first message on a channel.
    Connected {
        /// Shell that was launched.
        shell: String,
        /// Process id of the shell.
        pid: u32,
        /// Working directory actually used.
        cwd: String,
    },
    /// Terminal output.
    Output { data: String },
    /// The shell process terminated.
    Exit {
        /// Exit code when the process exited on its own.
        #[serde(rename = "exitCode")]
        exit_code: Option<i32>,
        /// Signal name when the process was killed by a signal.
        signal: Option<String>,
    },
    /// The session could not be established.
    Error { message: String },
}

impl ServerMessage {
    /// Serializes the message to its JSON text form.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses a message received from the host.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Result of interpreting one text frame received by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    /// A well-formed structured message.
    Message(ClientMessage),
    /// Anything else, written to the PTY as-is.
    Raw(String),
}

impl ClientFrame {
    /// Interprets a text frame.
    ///
    /// Text that is not a well-formed [`ClientMessage`] is returned
    /// unchanged as [`ClientFrame::Raw`] so that non-conforming clients can
    /// still type. This covers plain text, non-object JSON, and objects with
    /// an unknown `type` or bad fields. Only fit for a trusted client.
    pub fn parse(text: &str) -> Self {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => ClientFrame::Message(message),
            Err(_) => ClientFrame::Raw(text.to_string()),
        }
    }
}
