//! WebSocket channel server.
//!
//! Every accepted WebSocket is one channel. The upgrade request's query
//! string names the session; the connection task then relays PTY output to
//! the socket and socket input to the PTY until either side ends.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use protocol::{ChannelParams, ClientFrame, ClientMessage, Geometry, ServerMessage, Utf8StreamDecoder};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::session::{PtyEvent, Resolved, Session, SessionRegistry, SessionStatus};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Errors raised by the channel server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listener could not bind.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Accepting a TCP connection failed.
    #[error("accept failed: {0}")]
    Accept(#[from] std::io::Error),

    /// The WebSocket layer failed.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// A message could not be encoded.
    #[error(transparent)]
    Protocol(#[from] protocol::ProtocolError),
}

/// The channel listener.
pub struct Server {
    listener: TcpListener,
    registry: Arc<SessionRegistry>,
}

impl Server {
    /// Binds the listener.
    pub async fn bind(addr: SocketAddr, registry: Arc<SessionRegistry>) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        Ok(Self { listener, registry })
    }

    /// Returns the bound address.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Returns the session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Accepts channels until `shutdown` is cancelled, then kills every
    /// session.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ServerError> {
        let local = self.local_addr()?;
        info!(addr = %local, shell = %self.registry.settings().shell, "Listening for channels");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, remote)) => {
                            let registry = Arc::clone(&self.registry);
                            let shutdown = shutdown.child_token();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, remote, registry, shutdown).await {
                                    debug!(remote = %remote, error = %e, "Channel ended with error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "TCP accept failed");
                        }
                    }
                }
            }
        }

        info!("Shutting down, killing all sessions");
        self.registry.shutdown();
        Ok(())
    }
}

/// Why a relay loop ended.
#[derive(Debug, PartialEq, Eq)]
enum RelayEnd {
    /// The client closed or the transport failed.
    ClientGone,
    /// The shell exited.
    ShellExited,
    /// A newer channel attached to the same session.
    Superseded,
    /// The host is shutting down.
    Shutdown,
}

async fn handle_connection(
    stream: TcpStream,
    remote: SocketAddr,
    registry: Arc<SessionRegistry>,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let mut query = None;
    let capture = |request: &Request, response: Response| {
        query = request.uri().query().map(str::to_string);
        Ok::<Response, ErrorResponse>(response)
    };
    let ws = tokio_tungstenite::accept_hdr_async(stream, capture).await?;

    let params = ChannelParams::from_query(query.as_deref().unwrap_or_default());
    debug!(
        remote = %remote,
        session_id = ?params.session_id,
        cwd = ?params.cwd,
        cols = ?params.cols,
        rows = ?params.rows,
        "Channel opened"
    );

    let (mut sink, mut source) = ws.split();

    let Resolved {
        session,
        mut attachment,
        ..
    } = match registry.resolve(&params) {
        Ok(resolved) => resolved,
        Err(e) => {
            send(&mut sink, &ServerMessage::Error { message: e.to_string() }).await?;
            let _ = sink.close().await;
            return Ok(());
        }
    };

    let connected = ServerMessage::Connected {
        shell: session.shell().to_string(),
        pid: session.pid(),
        cwd: session.cwd().to_string_lossy().into_owned(),
    };
    // A client lost before `connected` still goes through detach below.
    let end = match send(&mut sink, &connected).await {
        Ok(()) => relay(&session, &mut attachment.events, &mut sink, &mut source, &shutdown).await,
        Err(e) => Err(e),
    };

    info!(
        remote = %remote,
        session_id = %session.id(),
        pid = session.pid(),
        reason = ?end,
        "Channel closed"
    );

    match end {
        Ok(RelayEnd::ClientGone) | Err(_) => registry.detach(&session, attachment.epoch),
        Ok(RelayEnd::ShellExited | RelayEnd::Superseded | RelayEnd::Shutdown) => {
            let _ = sink.close().await;
        }
    }

    end.map(|_| ())
}

async fn relay(
    session: &Session,
    events: &mut tokio::sync::mpsc::UnboundedReceiver<PtyEvent>,
    sink: &mut WsSink,
    source: &mut WsSource,
    shutdown: &CancellationToken,
) -> Result<RelayEnd, ServerError> {
    let mut decoder = Utf8StreamDecoder::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(RelayEnd::Shutdown),

            event = events.recv() => match event {
                Some(PtyEvent::Output(bytes)) => {
                    let data = decoder.decode(&bytes);
                    if !data.is_empty() {
                        send(sink, &ServerMessage::Output { data }).await?;
                    }
                }
                Some(PtyEvent::Exit(status)) => {
                    let data = decoder.finish();
                    if !data.is_empty() {
                        send(sink, &ServerMessage::Output { data }).await?;
                    }
                    send(sink, &exit_message(status)).await?;
                    return Ok(RelayEnd::ShellExited);
                }
                None => return Ok(RelayEnd::Superseded),
            },

            frame = source.next() => match frame {
                Some(Ok(Message::Text(text))) => handle_text(session, &text).await,
                Some(Ok(Message::Binary(bytes))) => write_input(session, &bytes).await,
                Some(Ok(Message::Ping(payload))) => {
                    sink.send(Message::Pong(payload)).await?;
                }
                Some(Ok(Message::Close(_))) | None => return Ok(RelayEnd::ClientGone),
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(session_id = %session.id(), error = %e, "Channel transport error");
                    return Ok(RelayEnd::ClientGone);
                }
            },
        }
    }
}

async fn handle_text(session: &Session, text: &str) {
    match ClientFrame::parse(text) {
        ClientFrame::Message(ClientMessage::Input { data }) => {
            write_input(session, data.as_bytes()).await;
        }
        ClientFrame::Message(ClientMessage::Resize { cols, rows }) => {
            if let Err(e) = session.resize(Geometry { cols, rows }) {
                warn!(session_id = %session.id(), cols, rows, error = %e, "Resize failed");
            }
        }
        ClientFrame::Raw(text) => write_input(session, text.as_bytes()).await,
    }
}

async fn write_input(session: &Session, data: &[u8]) {
    if let Err(e) = session.write(data).await {
        warn!(session_id = %session.id(), error = %e, "Failed to write input");
    }
}

fn exit_message(status: SessionStatus) -> ServerMessage {
    ServerMessage::Exit {
        exit_code: status.exit_code,
        signal: status.signal,
    }
}

async fn send(sink: &mut WsSink, message: &ServerMessage) -> Result<(), ServerError> {
    sink.send(Message::Text(message.to_json()?)).await?;
    Ok(())
}
