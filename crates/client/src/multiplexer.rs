//! The tab multiplexer.
//!
//! [`Multiplexer`] is a plain value owned by the UI layer. It keeps the
//! ordered tab list and the active pane, opens one channel per tab, and
//! turns channel events into [`TabUpdate`]s. Channel tasks report into a
//! single inbox; each event carries the connection epoch it belongs to and
//! is dropped if the tab has since been closed or reconnected.

use std::collections::VecDeque;
use std::sync::Arc;

use protocol::{ChannelParams, ClientMessage, Geometry};
use tokio::sync::mpsc;
use url::Url;
use uuid::Uuid;

use crate::channel::{spawn_channel, Connector, TabEvent};
use crate::error::{ClientError, Result};
use crate::input::{Disposition, KeyEvent, PointerButton, Shortcut};
use crate::snapshot::{tab_seq, MuxSnapshot, TabSnapshot};
use crate::tab::{Tab, TabId, TabInfo, TabState, TabUpdate};
use crate::widget::{ContainerSize, LayoutSlot, TerminalWidget, WidgetFactory};
use crate::ClientConfig;

/// The pane shown in the tab container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivePane {
    /// The non-interactive output pane.
    Output,
    /// A terminal tab.
    Tab(TabId),
}

/// Owns the terminal tabs of one UI.
pub struct Multiplexer {
    config: ClientConfig,
    host_url: Url,
    close_shortcut: Shortcut,
    connector: Arc<dyn Connector>,
    widgets: WidgetFactory,
    tabs: Vec<Tab>,
    active: ActivePane,
    next_seq: u64,
    next_epoch: u64,
    inbox_tx: mpsc::UnboundedSender<TabEvent>,
    inbox: mpsc::UnboundedReceiver<TabEvent>,
    pending: VecDeque<TabUpdate>,
}

impl Multiplexer {
    /// Creates an empty multiplexer.
    ///
    /// Fails if the configured host URL or close shortcut is invalid.
    pub fn new(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        widgets: WidgetFactory,
    ) -> Result<Self> {
        let host_url = Url::parse(&config.host_url)?;
        let close_shortcut = config.close_shortcut.parse()?;
        let (inbox_tx, inbox) = mpsc::unbounded_channel();

        Ok(Self {
            config,
            host_url,
            close_shortcut,
            connector,
            widgets,
            tabs: Vec::new(),
            active: ActivePane::Output,
            next_seq: 1,
            next_epoch: 1,
            inbox_tx,
            inbox,
            pending: VecDeque::new(),
        })
    }

    /// Returns the configuration in use.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Opens a new tab in the default working directory and makes it active.
    pub fn create_tab(&mut self) -> Result<TabId> {
        let cwd = self.config.default_cwd.clone();
        self.create_tab_in(cwd)
    }

    /// Opens a new tab in `cwd` and makes it active.
    pub fn create_tab_in(&mut self, cwd: Option<String>) -> Result<TabId> {
        if let Some(max) = self.config.max_tabs {
            if self.tabs.len() >= max {
                return Err(ClientError::TabLimit(max));
            }
        }

        // The counter saturates; once its last id is taken there are none left.
        let seq = self.next_seq;
        let id = format!("term-{seq}");
        if self.tabs.iter().any(|t| t.id == id) {
            return Err(ClientError::TabIdsExhausted);
        }
        self.next_seq = self.next_seq.saturating_add(1);

        let mut tab = Tab::new(seq, Uuid::new_v4().to_string(), cwd, (self.widgets)());
        self.open_channel(&mut tab, false);

        let id = tab.id.clone();
        tracing::info!(tab_id = %id, session_id = %tab.session_id, "Created tab");
        self.tabs.push(tab);
        self.active = ActivePane::Tab(id.clone());
        Ok(id)
    }

    /// Makes `id` the active pane.
    ///
    /// A geometry change that happened while the tab was in the background
    /// is sent now.
    pub fn select_tab(&mut self, id: &str) -> Result<()> {
        let tab = self
            .tabs
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| ClientError::TabNotFound(id.to_string()))?;
        self.active = ActivePane::Tab(tab.id.clone());
        flush_geometry(tab);
        Ok(())
    }

    /// Makes the output pane active.
    pub fn select_output(&mut self) {
        self.active = ActivePane::Output;
    }

    /// Closes a tab, its channel and its widget.
    ///
    /// Nothing is sent to the host; closing the channel is what ends the
    /// session. If the tab was active, the most recently opened remaining
    /// tab becomes active, or the output pane if none is left.
    pub fn close_tab(&mut self, id: &str) -> Result<()> {
        let index = self.position(id)?;
        let tab = self.tabs.remove(index);
        if let Some(channel) = tab.channel.as_ref() {
            channel.close();
        }
        tracing::info!(tab_id = %tab.id, session_id = %tab.session_id, state = %tab.state, "Closed tab");
        drop(tab);

        if self.active == ActivePane::Tab(id.to_string()) {
            let fallback = self
                .tabs
                .iter()
                .max_by_key(|t| t.seq)
                .map(|t| t.id.clone());
            match fallback {
                Some(next) => self.select_tab(&next)?,
                None => self.active = ActivePane::Output,
            }
        }
        Ok(())
    }

    /// Opens a new channel for a disconnected or failed tab.
    ///
    /// The tab gets a fresh session id and keeps its working directory and
    /// widget. Events still in flight from the old channel are discarded.
    pub fn reconnect(&mut self, id: &str) -> Result<()> {
        let index = self.position(id)?;
        let state = self.tabs[index].state;
        if !state.can_reconnect() {
            return Err(ClientError::InvalidState {
                tab_id: id.to_string(),
                state,
                operation: "reconnect",
            });
        }

        let mut tab = self.tabs.remove(index);
        tab.session_id = Uuid::new_v4().to_string();
        self.open_channel(&mut tab, true);
        tracing::info!(tab_id = %tab.id, session_id = %tab.session_id, "Reconnecting tab");
        self.tabs.insert(index, tab);
        Ok(())
    }

    /// Re-fits a tab's widget to its container.
    ///
    /// Returns the new geometry if it changed. The change is sent to the
    /// host right away when the tab is active and connected, otherwise on
    /// its next activation.
    pub fn container_resized(&mut self, id: &str, size: ContainerSize) -> Result<Option<Geometry>> {
        let is_active = self.active == ActivePane::Tab(id.to_string());
        let tab = self
            .tabs
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| ClientError::TabNotFound(id.to_string()))?;

        let geometry = tab.widget.fit(size);
        if geometry == tab.geometry {
            return Ok(None);
        }
        tab.geometry = geometry;
        tracing::debug!(tab_id = %tab.id, cols = geometry.cols, rows = geometry.rows, "Tab geometry changed");

        if is_active {
            flush_geometry(tab);
        }
        Ok(Some(geometry))
    }

    /// Handles a key press at the tab container level.
    ///
    /// The close shortcut closes the active tab and is consumed. With the
    /// output pane active it passes through.
    pub fn handle_key(&mut self, event: &KeyEvent) -> Disposition {
        if !self.close_shortcut.matches(event) {
            return Disposition::PassThrough;
        }
        match self.active.clone() {
            ActivePane::Tab(id) => {
                if let Err(e) = self.close_tab(&id) {
                    tracing::warn!(tab_id = %id, error = %e, "Close shortcut failed");
                }
                Disposition::Consumed
            }
            ActivePane::Output => Disposition::PassThrough,
        }
    }

    /// Handles a pointer press on a tab header.
    ///
    /// Middle-click closes the tab and is always consumed so the platform
    /// does not start auto-scroll.
    pub fn handle_pointer(&mut self, id: &str, button: PointerButton) -> Disposition {
        match button {
            PointerButton::Middle => {
                if let Err(e) = self.close_tab(id) {
                    tracing::debug!(tab_id = %id, error = %e, "Middle-click on unknown tab");
                }
                Disposition::Consumed
            }
            PointerButton::Primary | PointerButton::Secondary => Disposition::PassThrough,
        }
    }

    /// Moves the tab at `from` to position `to`.
    pub fn reorder(&mut self, from: usize, to: usize) -> Result<()> {
        let len = self.tabs.len();
        if from >= len || to >= len {
            return Err(ClientError::InvalidIndex { from, to, len });
        }
        let tab = self.tabs.remove(from);
        self.tabs.insert(to, tab);
        Ok(())
    }

    /// Sends keystrokes from a tab's widget to its shell.
    pub fn send_input(&mut self, id: &str, data: &str) -> Result<()> {
        let tab = self.find(id)?;
        let sent = tab
            .channel
            .as_ref()
            .map(|channel| channel.send(ClientMessage::input(data)))
            .unwrap_or(false);
        if !sent {
            tracing::debug!(tab_id = %id, bytes = data.len(), "Dropping input for tab without channel");
            return Err(ClientError::NotConnected(id.to_string()));
        }
        Ok(())
    }

    /// Moves a tab's widget to another layout slot. The widget, its buffer
    /// and the channel are kept.
    pub fn attach_widget(&mut self, id: &str, slot: LayoutSlot) -> Result<()> {
        let tab = self.find_mut(id)?;
        tab.widget.attach(slot);
        Ok(())
    }

    /// Waits for the next update from any tab.
    pub async fn next_update(&mut self) -> Option<TabUpdate> {
        loop {
            if let Some(update) = self.pending.pop_front() {
                return Some(update);
            }
            let event = self.inbox.recv().await?;
            self.dispatch(event);
        }
    }

    /// Applies every event received so far and returns the resulting
    /// updates without waiting.
    pub fn drain_updates(&mut self) -> Vec<TabUpdate> {
        while let Ok(event) = self.inbox.try_recv() {
            self.dispatch(event);
        }
        self.pending.drain(..).collect()
    }

    /// Tabs in display order.
    pub fn tabs(&self) -> Vec<TabInfo> {
        self.tabs.iter().map(Tab::info).collect()
    }

    pub fn tab(&self, id: &str) -> Option<TabInfo> {
        self.tabs.iter().find(|t| t.id == id).map(Tab::info)
    }

    pub fn active(&self) -> &ActivePane {
        &self.active
    }

    pub fn len(&self) -> usize {
        self.tabs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tabs.is_empty()
    }

    pub fn widget(&self, id: &str) -> Option<&dyn TerminalWidget> {
        self.tabs
            .iter()
            .find(|t| t.id == id)
            .map(|t| t.widget.as_ref())
    }

    pub fn widget_mut(&mut self, id: &str) -> Option<&mut Box<dyn TerminalWidget>> {
        self.tabs
            .iter_mut()
            .find(|t| t.id == id)
            .map(|t| &mut t.widget)
    }

    /// Captures the tab layout for persistence.
    pub fn snapshot(&self) -> MuxSnapshot {
        MuxSnapshot {
            tabs: self
                .tabs
                .iter()
                .map(|t| TabSnapshot {
                    id: t.id.clone(),
                    name: t.name.clone(),
                    session_id: t.session_id.clone(),
                    cwd: t.cwd.clone(),
                    geometry: t.geometry,
                })
                .collect(),
            active: match &self.active {
                ActivePane::Tab(id) => Some(id.clone()),
                ActivePane::Output => None,
            },
            next_seq: self.next_seq,
        }
    }

    /// Replaces all tabs with the ones in `snapshot`.
    ///
    /// Restored tabs are disconnected with fresh widgets; the user
    /// reconnects them to get a new shell. Tabs whose id repeats an earlier
    /// one are skipped.
    pub fn restore(&mut self, snapshot: MuxSnapshot) {
        for tab in self.tabs.drain(..) {
            if let Some(channel) = tab.channel.as_ref() {
                channel.close();
            }
        }
        self.pending.clear();

        let mut next_seq = snapshot.next_seq.max(1);
        if let Some(max) = snapshot.max_seq() {
            next_seq = next_seq.max(max.saturating_add(1));
        }

        for (index, saved) in snapshot.tabs.into_iter().enumerate() {
            if self.tabs.iter().any(|t| t.id == saved.id) {
                tracing::warn!(tab_id = %saved.id, "Skipping duplicate tab in snapshot");
                continue;
            }
            let seq = tab_seq(&saved.id).unwrap_or(index as u64);
            let mut tab = Tab::new(seq, saved.session_id, saved.cwd, (self.widgets)());
            tab.id = saved.id;
            tab.name = saved.name;
            tab.geometry = saved.geometry;
            tab.mark_restored();
            self.tabs.push(tab);
        }

        self.active = match snapshot.active {
            Some(id) if self.tabs.iter().any(|t| t.id == id) => ActivePane::Tab(id),
            _ => ActivePane::Output,
        };
        self.next_seq = next_seq;
        tracing::info!(tabs = self.tabs.len(), next_seq, "Restored tab layout");
    }

    fn open_channel(&mut self, tab: &mut Tab, reconnecting: bool) {
        let epoch = self.next_epoch;
        self.next_epoch += 1;

        let mut params = ChannelParams::new(tab.session_id.clone()).with_geometry(tab.geometry);
        if let Some(ref cwd) = tab.cwd {
            params = params.with_cwd(cwd.clone());
        }
        let url = params.to_url(&self.host_url);

        let channel = spawn_channel(
            Arc::clone(&self.connector),
            url,
            self.config.connect_timeout(),
            tab.id.clone(),
            epoch,
            self.inbox_tx.clone(),
        );
        tab.begin_connect(epoch, channel, reconnecting);
    }

    fn dispatch(&mut self, event: TabEvent) {
        let is_active = self.active == ActivePane::Tab(event.tab_id.clone());
        let Some(tab) = self.tabs.iter_mut().find(|t| t.id == event.tab_id) else {
            tracing::trace!(tab_id = %event.tab_id, "Event for closed tab");
            return;
        };
        if tab.epoch != event.epoch {
            tracing::trace!(tab_id = %tab.id, epoch = event.epoch, current = tab.epoch, "Stale channel event");
            return;
        }

        let updates = tab.apply(event.event);
        if is_active && tab.state == TabState::Connected {
            flush_geometry(tab);
        }
        self.pending.extend(updates);
    }

    fn position(&self, id: &str) -> Result<usize> {
        self.tabs
            .iter()
            .position(|t| t.id == id)
            .ok_or_else(|| ClientError::TabNotFound(id.to_string()))
    }

    fn find(&self, id: &str) -> Result<&Tab> {
        self.tabs
            .iter()
            .find(|t| t.id == id)
            .ok_or_else(|| ClientError::TabNotFound(id.to_string()))
    }

    fn find_mut(&mut self, id: &str) -> Result<&mut Tab> {
        self.tabs
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| ClientError::TabNotFound(id.to_string()))
    }
}

/// Sends the tab's geometry if the host has not seen it yet.
fn flush_geometry(tab: &mut Tab) {
    if tab.state != TabState::Connected || tab.sent_geometry == Some(tab.geometry) {
        return;
    }
    let Some(channel) = tab.channel.as_ref() else {
        return;
    };
    if channel.send(ClientMessage::resize(tab.geometry)) {
        tab.sent_geometry = Some(tab.geometry);
    }
}
