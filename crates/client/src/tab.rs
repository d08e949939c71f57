//! Tabs and their connection state machine.

use std::fmt;

use protocol::{Geometry, ServerMessage};
use serde::{Deserialize, Serialize};

use crate::channel::{ChannelHandle, LinkEvent};
use crate::widget::TerminalWidget;

/// Tab identifier, `term-<n>`.
pub type TabId = String;

/// Connection state of a tab.
///
/// ```text
/// connecting ──► connected ──► disconnected
///     │  └──────────────────────────▲
///     └──► failed                    │
/// disconnected | failed ──► connecting   (reconnect only)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TabState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

impl TabState {
    /// Whether a reconnect is allowed from this state.
    pub fn can_reconnect(self) -> bool {
        matches!(self, TabState::Disconnected | TabState::Failed)
    }
}

impl fmt::Display for TabState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TabState::Connecting => "connecting",
            TabState::Connected => "connected",
            TabState::Disconnected => "disconnected",
            TabState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Something the UI should react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TabUpdate {
    /// The tab's connection state changed.
    StateChanged {
        tab_id: TabId,
        state: TabState,
        reason: Option<String>,
    },
    /// Output was written to the tab's widget.
    Output { tab_id: TabId, data: String },
}

/// Read-only view of a tab.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabInfo {
    pub id: TabId,
    pub name: String,
    pub session_id: String,
    pub state: TabState,
    pub geometry: Geometry,
    pub cwd: Option<String>,
    /// Shell pid reported by the host while connected.
    pub pid: Option<u32>,
    pub shell: Option<String>,
    /// Why the tab last left the connected state.
    pub reason: Option<String>,
}

pub(crate) struct Tab {
    pub(crate) id: TabId,
    pub(crate) name: String,
    pub(crate) seq: u64,
    pub(crate) session_id: String,
    pub(crate) cwd: Option<String>,
    pub(crate) state: TabState,
    /// Latest fitted geometry.
    pub(crate) geometry: Geometry,
    /// Geometry the host last heard about on the current channel.
    pub(crate) sent_geometry: Option<Geometry>,
    pub(crate) pid: Option<u32>,
    pub(crate) shell: Option<String>,
    pub(crate) epoch: u64,
    pub(crate) channel: Option<ChannelHandle>,
    pub(crate) widget: Box<dyn TerminalWidget>,
    reconnecting: bool,
    reason: Option<String>,
}

impl Tab {
    pub(crate) fn new(
        seq: u64,
        session_id: String,
        cwd: Option<String>,
        widget: Box<dyn TerminalWidget>,
    ) -> Self {
        let geometry = widget.geometry();
        Self {
            id: format!("term-{seq}"),
            name: format!("Terminal {seq}"),
            seq,
            session_id,
            cwd,
            state: TabState::Disconnected,
            geometry,
            sent_geometry: None,
            pid: None,
            shell: None,
            epoch: 0,
            channel: None,
            widget,
            reconnecting: false,
            reason: None,
        }
    }

    pub(crate) fn info(&self) -> TabInfo {
        TabInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            session_id: self.session_id.clone(),
            state: self.state,
            geometry: self.geometry,
            cwd: self.cwd.clone(),
            pid: self.pid,
            shell: self.shell.clone(),
            reason: self.reason.clone(),
        }
    }

    /// Binds a freshly opened channel. The previous one, if any, is closed.
    pub(crate) fn begin_connect(&mut self, epoch: u64, channel: ChannelHandle, reconnecting: bool) {
        self.epoch = epoch;
        self.channel = Some(channel);
        self.state = TabState::Connecting;
        self.sent_geometry = Some(self.geometry);
        self.pid = None;
        self.shell = None;
        self.reconnecting = reconnecting;
        self.reason = None;
    }

    /// Puts a restored tab into its resting state without a channel.
    pub(crate) fn mark_restored(&mut self) {
        self.write_notice("restored; reconnect to start a new shell");
        self.reason = Some("restored".to_string());
    }

    /// Applies an event from the current channel, returning the updates it
    /// produced.
    pub(crate) fn apply(&mut self, event: LinkEvent) -> Vec<TabUpdate> {
        match event {
            LinkEvent::Message(ServerMessage::Connected { shell, pid, cwd }) => {
                if self.state != TabState::Connecting {
                    tracing::debug!(tab_id = %self.id, state = %self.state, "Ignoring late connected");
                    return Vec::new();
                }
                tracing::info!(tab_id = %self.id, pid, shell = %shell, cwd = %cwd, "Tab connected");
                if self.reconnecting {
                    self.write_notice(&format!("reconnected: new session, pid {pid}"));
                    self.reconnecting = false;
                }
                self.state = TabState::Connected;
                self.pid = Some(pid);
                self.shell = Some(shell);
                vec![self.state_update()]
            }
            LinkEvent::Message(ServerMessage::Output { data }) => {
                self.widget.write(&data);
                vec![TabUpdate::Output {
                    tab_id: self.id.clone(),
                    data,
                }]
            }
            LinkEvent::Message(ServerMessage::Exit { exit_code, signal }) => {
                let reason = match (exit_code, signal) {
                    (_, Some(signal)) => format!("process terminated by signal {signal}"),
                    (Some(code), None) => format!("process exited with code {code}"),
                    (None, None) => "process exited".to_string(),
                };
                self.disconnect(TabState::Disconnected, reason)
            }
            LinkEvent::Message(ServerMessage::Error { message }) => {
                self.disconnect(TabState::Disconnected, format!("error: {message}"))
            }
            LinkEvent::Closed(reason) => {
                if !matches!(self.state, TabState::Connecting | TabState::Connected) {
                    return Vec::new();
                }
                let reason = match reason {
                    Some(reason) => format!("connection closed: {reason}"),
                    None => "connection closed".to_string(),
                };
                self.disconnect(TabState::Disconnected, reason)
            }
            LinkEvent::Failed(reason) => {
                if self.state != TabState::Connecting {
                    return Vec::new();
                }
                self.disconnect(TabState::Failed, reason)
            }
        }
    }

    fn disconnect(&mut self, state: TabState, reason: String) -> Vec<TabUpdate> {
        tracing::info!(tab_id = %self.id, state = %state, reason = %reason, "Tab left connected state");
        self.channel = None;
        self.state = state;
        self.pid = None;
        self.reconnecting = false;
        self.write_notice(&reason);
        self.reason = Some(reason);
        vec![self.state_update()]
    }

    fn write_notice(&mut self, text: &str) {
        self.widget.write(&format!("\r\n[{text}]\r\n"));
    }

    fn state_update(&self) -> TabUpdate {
        TabUpdate::StateChanged {
            tab_id: self.id.clone(),
            state: self.state,
            reason: self.reason.clone(),
        }
    }
}
