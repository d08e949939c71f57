//! Serializable multiplexer layout.
//!
//! A snapshot records which tabs existed, in order, and which pane was
//! active. It carries no connection state: restored tabs start out
//! disconnected because no shell survives a reload.

use protocol::Geometry;
use serde::{Deserialize, Serialize};

use crate::tab::TabId;

/// One tab as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabSnapshot {
    pub id: TabId,
    pub name: String,
    pub session_id: String,
    #[serde(default)]
    pub cwd: Option<String>,
    pub geometry: Geometry,
}

/// Tab order, active pane and id allocation state.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MuxSnapshot {
    /// Tabs in display order.
    pub tabs: Vec<TabSnapshot>,
    /// Active tab, or `None` for the output pane.
    #[serde(default)]
    pub active: Option<TabId>,
    /// Next tab sequence number.
    pub next_seq: u64,
}

impl MuxSnapshot {
    /// Highest `term-<n>` sequence number among the tabs.
    pub(crate) fn max_seq(&self) -> Option<u64> {
        self.tabs.iter().filter_map(|tab| tab_seq(&tab.id)).max()
    }
}

/// Extracts `n` from a `term-<n>` tab id.
pub(crate) fn tab_seq(id: &str) -> Option<u64> {
    id.strip_prefix("term-")?.parse().ok()
}
