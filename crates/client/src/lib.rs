//! # termbridge Multiplexer Client
//!
//! This crate is the client half of termbridge: it keeps a set of terminal
//! tabs, each bound to its own shell session on a termbridge session host.
//!
//! ## Overview
//!
//! - **Tabs**: create, select, close, reorder and reconnect terminal tabs
//! - **Channels**: one WebSocket per tab, opened through a [`Connector`]
//! - **Geometry sync**: widget fits are forwarded to the host as `resize`
//! - **Shortcuts**: a reserved close shortcut and middle-click close
//! - **Persistence**: tab layout snapshots stored in SQLite
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                  UI layer (owns the value)               │
//! ├──────────────────────────────────────────────────────────┤
//! │                       Multiplexer                        │
//! │  ┌──────────┐  ┌──────────┐  ┌──────────┐  ┌──────────┐  │
//! │  │  Tab 1   │  │  Tab 2   │  │  Tab n   │  │ TabStore │  │
//! │  │ widget   │  │ widget   │  │ widget   │  │ (SQLite) │  │
//! │  └────┬─────┘  └────┬─────┘  └────┬─────┘  └──────────┘  │
//! ├───────┼─────────────┼─────────────┼──────────────────────┤
//! │   channel task  channel task  channel task   (tokio)     │
//! └───────┼─────────────┼─────────────┼──────────────────────┘
//!         ▼             ▼             ▼
//!              termbridge session host
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use client::{ClientConfig, Multiplexer, ScrollbackWidget, WebSocketConnector};
//!
//! # async fn run() -> client::Result<()> {
//! let config = ClientConfig::default();
//! let widgets = ScrollbackWidget::factory(config.scrollback_lines);
//! let mut mux = Multiplexer::new(config, Arc::new(WebSocketConnector::new()), widgets)?;
//!
//! let tab = mux.create_tab()?;
//! while let Some(update) = mux.next_update().await {
//!     println!("{update:?}");
//! }
//! mux.close_tab(&tab)?;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod error;
pub mod input;
pub mod multiplexer;
pub mod snapshot;
pub mod storage;
pub mod tab;
pub mod widget;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use protocol;

pub use channel::{ChannelEvent, ChannelLink, Connector, WebSocketConnector};
pub use error::{ClientError, Result};
pub use input::{Disposition, KeyEvent, Modifiers, PointerButton, Shortcut};
pub use multiplexer::{ActivePane, Multiplexer};
pub use snapshot::{MuxSnapshot, TabSnapshot};
pub use storage::{DatabaseError, TabStore};
pub use tab::{TabId, TabInfo, TabState, TabUpdate};
pub use widget::{ContainerSize, LayoutSlot, ScrollbackWidget, TerminalWidget, WidgetFactory};

/// Default session host endpoint.
pub const DEFAULT_HOST_URL: &str = "ws://127.0.0.1:3001/terminal";

/// Environment variable overriding [`ClientConfig::host_url`].
pub const HOST_URL_ENV: &str = "TERMBRIDGE_HOST_URL";

/// Multiplexer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// WebSocket endpoint of the session host.
    pub host_url: String,
    /// Working directory for new tabs; the host's home when unset.
    pub default_cwd: Option<String>,
    /// How long a channel may take to open before the tab fails.
    pub connect_timeout_secs: u64,
    /// Maximum number of open tabs.
    pub max_tabs: Option<usize>,
    /// Lines kept by the built-in scrollback widget.
    pub scrollback_lines: usize,
    /// Shortcut closing the active tab.
    pub close_shortcut: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let host_url = std::env::var(HOST_URL_ENV)
            .ok()
            .filter(|url| !url.is_empty())
            .unwrap_or_else(|| DEFAULT_HOST_URL.to_string());

        Self {
            host_url,
            default_cwd: None,
            connect_timeout_secs: 10,
            max_tabs: None,
            scrollback_lines: 1000,
            close_shortcut: Shortcut::default().to_string(),
        }
    }
}

impl ClientConfig {
    /// Default settings pointed at `host_url`.
    pub fn with_host_url(host_url: impl Into<String>) -> Self {
        Self {
            host_url: host_url.into(),
            ..Default::default()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_defaults() {
        std::env::remove_var(HOST_URL_ENV);
        let config = ClientConfig::default();
        assert_eq!(config.host_url, DEFAULT_HOST_URL);
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.max_tabs, None);
        assert_eq!(config.close_shortcut, "Mod+W");
        assert_eq!(config.close_shortcut.parse::<Shortcut>().unwrap(), Shortcut::default());
    }

    #[test]
    #[serial]
    fn test_host_url_env_override() {
        std::env::set_var(HOST_URL_ENV, "ws://10.0.0.5:4000/terminal");
        let config = ClientConfig::default();
        std::env::remove_var(HOST_URL_ENV);
        assert_eq!(config.host_url, "ws://10.0.0.5:4000/terminal");
    }

    #[test]
    #[serial]
    fn test_partial_json_uses_defaults() {
        std::env::remove_var(HOST_URL_ENV);
        let config: ClientConfig =
            serde_json::from_str(r#"{"max_tabs": 4, "default_cwd": "/srv"}"#).unwrap();
        assert_eq!(config.max_tabs, Some(4));
        assert_eq!(config.default_cwd.as_deref(), Some("/srv"));
        assert_eq!(config.scrollback_lines, 1000);
        assert_eq!(config.host_url, DEFAULT_HOST_URL);
    }

    #[test]
    fn test_with_host_url() {
        let config = ClientConfig::with_host_url("ws://example:1/t");
        assert_eq!(config.host_url, "ws://example:1/t");
    }
}
