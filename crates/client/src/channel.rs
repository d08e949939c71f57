//! Channels between a tab and the session host.
//!
//! A [`Connector`] opens the transport and hands back a [`ChannelLink`]: a
//! pair of queues plus a close token, in the same shape for the real
//! WebSocket transport and for test doubles. [`spawn_channel`] runs one
//! tab's channel task, tagging every event with the tab id and the
//! connection epoch so events from a replaced connection can be told apart.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use protocol::{ClientMessage, ServerMessage};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{ClientError, Result};
use crate::tab::TabId;

/// Something the transport delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A message from the host.
    Message(ServerMessage),
    /// The transport closed.
    Closed { reason: Option<String> },
}

/// An open transport.
#[derive(Debug)]
pub struct ChannelLink {
    /// Messages to send to the host.
    pub outgoing: mpsc::UnboundedSender<ClientMessage>,
    /// Events from the host, ending with [`ChannelEvent::Closed`].
    pub incoming: mpsc::UnboundedReceiver<ChannelEvent>,
    /// Cancel to close the transport.
    pub close: CancellationToken,
}

/// Opens transports to the session host.
pub trait Connector: Send + Sync {
    /// Connects to `url`.
    fn connect(&self, url: Url) -> Pin<Box<dyn Future<Output = Result<ChannelLink>> + Send + '_>>;
}

/// What a tab's channel task reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A host message.
    Message(ServerMessage),
    /// The channel closed after being opened.
    Closed(Option<String>),
    /// The channel could not be opened.
    Failed(String),
}

/// A [`LinkEvent`] tagged with its origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabEvent {
    pub tab_id: TabId,
    pub epoch: u64,
    pub event: LinkEvent,
}

/// The multiplexer's handle on a tab's channel task.
#[derive(Debug)]
pub struct ChannelHandle {
    outgoing: mpsc::UnboundedSender<ClientMessage>,
    cancel: CancellationToken,
}

impl ChannelHandle {
    /// Queues a message. Messages sent while connecting are delivered once
    /// the channel is open.
    pub fn send(&self, message: ClientMessage) -> bool {
        self.outgoing.send(message).is_ok()
    }

    /// Closes the channel without sending anything.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Spawns the channel task for one tab connection.
pub fn spawn_channel(
    connector: std::sync::Arc<dyn Connector>,
    url: Url,
    connect_timeout: Duration,
    tab_id: TabId,
    epoch: u64,
    inbox: mpsc::UnboundedSender<TabEvent>,
) -> ChannelHandle {
    let (outgoing, mut queued) = mpsc::unbounded_channel::<ClientMessage>();
    let cancel = CancellationToken::new();
    let token = cancel.clone();

    tokio::spawn(async move {
        let emit = |event: LinkEvent| {
            let _ = inbox.send(TabEvent {
                tab_id: tab_id.clone(),
                epoch,
                event,
            });
        };

        // The deadline covers the handshake and the host's spawn, up to the
        // first `connected` or `error`.
        let deadline = Instant::now() + connect_timeout;
        let timed_out = || LinkEvent::Failed(ClientError::Timeout(connect_timeout).to_string());

        let attempt = tokio::time::timeout_at(deadline, connector.connect(url));
        let link = tokio::select! {
            _ = token.cancelled() => return,
            result = attempt => match result {
                Ok(Ok(link)) => link,
                Ok(Err(e)) => {
                    emit(LinkEvent::Failed(e.to_string()));
                    return;
                }
                Err(_) => {
                    emit(timed_out());
                    return;
                }
            },
        };

        let ChannelLink {
            outgoing: link_tx,
            mut incoming,
            close,
        } = link;
        let mut answered = false;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep_until(deadline), if !answered => {
                    tracing::debug!(tab_id = %tab_id, "Host did not answer before the connect deadline");
                    emit(timed_out());
                    break;
                }
                message = queued.recv() => match message {
                    Some(message) => {
                        if link_tx.send(message).is_err() {
                            tracing::debug!(tab_id = %tab_id, "Transport writer gone");
                        }
                    }
                    None => break,
                },
                event = incoming.recv() => match event {
                    Some(ChannelEvent::Message(message)) => {
                        if matches!(message, ServerMessage::Connected { .. } | ServerMessage::Error { .. }) {
                            answered = true;
                        }
                        emit(LinkEvent::Message(message));
                    }
                    Some(ChannelEvent::Closed { reason }) => {
                        emit(LinkEvent::Closed(reason));
                        break;
                    }
                    None => {
                        emit(LinkEvent::Closed(None));
                        break;
                    }
                },
            }
        }

        close.cancel();
    });

    ChannelHandle { outgoing, cancel }
}

/// Connects over WebSocket with `tokio-tungstenite`.
#[derive(Debug, Default, Clone)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Connector for WebSocketConnector {
    fn connect(&self, url: Url) -> Pin<Box<dyn Future<Output = Result<ChannelLink>> + Send + '_>> {
        Box::pin(async move {
            tracing::debug!(url = %url, "Opening channel");

            let (ws_stream, _) = connect_async(url.as_str()).await.map_err(|e| match e {
                WsError::Io(io_err) => ClientError::Connect(io_err.to_string()),
                other => ClientError::Connect(other.to_string()),
            })?;

            let (mut ws_sink, mut ws_stream) = ws_stream.split();
            let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<ClientMessage>();
            let (incoming_tx, incoming_rx) = mpsc::unbounded_channel::<ChannelEvent>();
            let close = CancellationToken::new();

            let writer_close = close.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = writer_close.cancelled() => break,
                        message = outgoing_rx.recv() => {
                            let Some(message) = message else { break };
                            match message.to_json() {
                                Ok(json) => {
                                    if let Err(e) = ws_sink.send(WsMessage::Text(json)).await {
                                        tracing::debug!(error = %e, "Channel send failed");
                                        break;
                                    }
                                }
                                Err(e) => tracing::error!(error = %e, "Failed to encode message"),
                            }
                        }
                    }
                }
                let _ = ws_sink.close().await;
            });

            let reader_close = close.clone();
            tokio::spawn(async move {
                let reason = loop {
                    let frame = tokio::select! {
                        _ = reader_close.cancelled() => break None,
                        frame = ws_stream.next() => frame,
                    };
                    match frame {
                        Some(Ok(WsMessage::Text(text))) => match ServerMessage::from_json(&text) {
                            Ok(message) => {
                                if incoming_tx.send(ChannelEvent::Message(message)).is_err() {
                                    break None;
                                }
                            }
                            Err(e) => tracing::warn!(error = %e, "Ignoring unparsable host message"),
                        },
                        Some(Ok(WsMessage::Close(frame))) => {
                            break frame
                                .map(|f| f.reason.to_string())
                                .filter(|reason| !reason.is_empty());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => break Some(e.to_string()),
                        None => break None,
                    }
                };
                let _ = incoming_tx.send(ChannelEvent::Closed { reason });
                reader_close.cancel();
            });

            Ok(ChannelLink {
                outgoing: outgoing_tx,
                incoming: incoming_rx,
                close,
            })
        })
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{Behaviour, MockConnector};
    use super::*;
    use std::sync::Arc;
    use tokio::time::timeout;

    fn url() -> Url {
        Url::parse("ws://127.0.0.1:1/terminal?sessionId=x").unwrap()
    }

    #[tokio::test]
    async fn test_events_are_tagged_and_ordered() {
        let (connector, mut hosts) = MockConnector::new();
        let (inbox_tx, mut inbox) = mpsc::unbounded_channel();

        let handle = spawn_channel(connector, url(), Duration::from_secs(1), "term-1".into(), 7, inbox_tx);
        let mut host = hosts.recv().await.unwrap();
        assert_eq!(host.url, url());

        host.send(ServerMessage::Output { data: "a".into() });
        host.send(ServerMessage::Output { data: "b".into() });

        for expected in ["a", "b"] {
            let event = inbox.recv().await.unwrap();
            assert_eq!(event.tab_id, "term-1");
            assert_eq!(event.epoch, 7);
            assert_eq!(
                event.event,
                LinkEvent::Message(ServerMessage::Output { data: expected.into() })
            );
        }

        assert!(handle.send(ClientMessage::input("ls\n")));
        assert_eq!(host.from_client.recv().await, Some(ClientMessage::input("ls\n")));
    }

    #[tokio::test]
    async fn test_refused_connect_reports_failure() {
        let (connector, _hosts) = MockConnector::new();
        connector.set_behaviour(Behaviour::Refuse);
        let (inbox_tx, mut inbox) = mpsc::unbounded_channel();

        let _handle = spawn_channel(connector, url(), Duration::from_secs(1), "term-1".into(), 1, inbox_tx);
        let event = inbox.recv().await.unwrap();
        assert!(matches!(event.event, LinkEvent::Failed(ref reason) if reason.contains("refused")));
    }

    #[tokio::test]
    async fn test_connect_timeout_reports_failure() {
        let (connector, _hosts) = MockConnector::new();
        connector.set_behaviour(Behaviour::Hang);
        let (inbox_tx, mut inbox) = mpsc::unbounded_channel();

        let _handle =
            spawn_channel(connector, url(), Duration::from_millis(50), "term-1".into(), 1, inbox_tx);
        let event = timeout(Duration::from_secs(2), inbox.recv()).await.unwrap().unwrap();
        assert!(matches!(event.event, LinkEvent::Failed(ref reason) if reason.contains("timed out")));
    }

    #[tokio::test]
    async fn test_close_cancels_transport_silently() {
        let (connector, mut hosts) = MockConnector::new();
        let (inbox_tx, mut inbox) = mpsc::unbounded_channel();

        let handle = spawn_channel(
            Arc::clone(&connector) as Arc<dyn Connector>,
            url(),
            Duration::from_secs(1),
            "term-1".into(),
            1,
            inbox_tx,
        );
        let host = hosts.recv().await.unwrap();

        handle.close();
        timeout(Duration::from_secs(1), host.close.cancelled()).await.unwrap();
        // The task ends without reporting anything; the inbox just closes.
        assert!(!matches!(
            timeout(Duration::from_millis(100), inbox.recv()).await,
            Ok(Some(_))
        ));
    }

    #[tokio::test]
    async fn test_silent_host_times_out_after_accept() {
        let (connector, mut hosts) = MockConnector::new();
        let (inbox_tx, mut inbox) = mpsc::unbounded_channel();

        let _handle =
            spawn_channel(connector, url(), Duration::from_millis(100), "term-1".into(), 1, inbox_tx);
        let host = hosts.recv().await.unwrap();

        let event = timeout(Duration::from_secs(2), inbox.recv()).await.unwrap().unwrap();
        assert!(matches!(event.event, LinkEvent::Failed(ref reason) if reason.contains("timed out")));
        timeout(Duration::from_secs(1), host.close.cancelled()).await.unwrap();
    }

    #[tokio::test]
    async fn test_connected_stops_the_deadline() {
        let (connector, mut hosts) = MockConnector::new();
        let (inbox_tx, mut inbox) = mpsc::unbounded_channel();

        let _handle =
            spawn_channel(connector, url(), Duration::from_millis(100), "term-1".into(), 1, inbox_tx);
        let host = hosts.recv().await.unwrap();
        let connected = ServerMessage::Connected {
            shell: "/bin/sh".into(),
            pid: 42,
            cwd: "/tmp".into(),
        };
        host.send(connected.clone());

        let event = inbox.recv().await.unwrap();
        assert_eq!(event.event, LinkEvent::Message(connected));
        assert!(timeout(Duration::from_millis(300), inbox.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_host_close_is_reported() {
        let (connector, mut hosts) = MockConnector::new();
        let (inbox_tx, mut inbox) = mpsc::unbounded_channel();

        let _handle = spawn_channel(connector, url(), Duration::from_secs(1), "term-1".into(), 3, inbox_tx);
        let host = hosts.recv().await.unwrap();
        drop(host);

        let event = inbox.recv().await.unwrap();
        assert_eq!(event.event, LinkEvent::Closed(None));
    }
}
