//! End-to-end tests for the session host.
//!
//! Each test starts a real host on an ephemeral port running `/bin/sh` and
//! drives it over WebSocket channels the way a multiplexer client would.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use daemon::session::{RegistrySettings, SessionRegistry};
use daemon::Server;
use futures_util::{SinkExt, StreamExt};
use protocol::{ChannelParams, ClientMessage, Geometry, ServerMessage};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

type Channel = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(10);

struct Host {
    addr: SocketAddr,
    registry: Arc<SessionRegistry>,
    shutdown: CancellationToken,
}

impl Drop for Host {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.registry.shutdown();
    }
}

async fn start_host(settings: RegistrySettings) -> Host {
    let registry = Arc::new(SessionRegistry::new(settings));
    let server = Server::bind("127.0.0.1:0".parse().unwrap(), Arc::clone(&registry))
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn(server.run(shutdown.clone()));
    Host {
        addr,
        registry,
        shutdown,
    }
}

fn sh_settings() -> RegistrySettings {
    let mut settings = RegistrySettings::with_shell("/bin/sh");
    settings.shell_args.clear();
    settings
}

async fn open(host: &Host, params: &ChannelParams) -> Channel {
    let base = Url::parse(&format!("ws://{}/terminal", host.addr)).unwrap();
    let url = params.to_url(&base);
    let (ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    ws
}

/// Returns the next server message, skipping control frames.
async fn next_message(ws: &mut Channel) -> Option<ServerMessage> {
    timeout(WAIT, async {
        while let Some(frame) = ws.next().await {
            match frame {
                Ok(Message::Text(text)) => return ServerMessage::from_json(&text).ok(),
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => continue,
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}

/// Opens a channel and returns it with the `connected` payload.
async fn connect(host: &Host, params: &ChannelParams) -> (Channel, u32, String) {
    let mut ws = open(host, params).await;
    match next_message(&mut ws).await {
        Some(ServerMessage::Connected { pid, cwd, .. }) => (ws, pid, cwd),
        other => panic!("expected connected, got {other:?}"),
    }
}

async fn send(ws: &mut Channel, message: ClientMessage) {
    ws.send(Message::Text(message.to_json().unwrap())).await.unwrap();
}

/// Accumulates `output` until it contains `marker`.
async fn read_until(ws: &mut Channel, marker: &str) -> String {
    let mut output = String::new();
    let _ = timeout(WAIT, async {
        while let Some(message) = next_message(ws).await {
            if let ServerMessage::Output { data } = message {
                output.push_str(&data);
                if output.contains(marker) {
                    break;
                }
            }
        }
    })
    .await;
    output
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(100)).await;
    }
    false
}

/// Signal 0 probes for existence without delivering anything.
fn pid_alive(pid: u32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
}

#[tokio::test]
async fn test_s1_echo_then_close_removes_session() {
    let host = start_host(sh_settings()).await;
    let params = ChannelParams::new("s1")
        .with_cwd("/tmp")
        .with_geometry(Geometry::new(80, 24).unwrap());

    let (mut ws, pid, cwd) = connect(&host, &params).await;
    assert!(pid > 0);
    assert_eq!(cwd, "/tmp");

    send(&mut ws, ClientMessage::input("echo hi\n")).await;
    let output = read_until(&mut ws, "hi\r\n").await;
    assert!(output.contains("hi"), "output was: {output:?}");

    ws.close(None).await.unwrap();
    assert!(wait_until(|| !host.registry.exists("s1")).await);

    let (_ws, second_pid, _) = connect(&host, &params).await;
    assert_ne!(second_pid, pid);
}

#[tokio::test]
async fn test_client_dropped_before_connected_kills_session() {
    let host = start_host(sh_settings()).await;

    // The socket goes away without reading anything or sending close.
    let ws = open(&host, &ChannelParams::new("hasty")).await;
    drop(ws);

    sleep(Duration::from_millis(300)).await;
    assert!(wait_until(|| !host.registry.exists("hasty")).await);
    assert!(host.registry.list().is_empty());
}

#[tokio::test]
async fn test_output_preserves_input_order() {
    let host = start_host(sh_settings()).await;
    let (mut ws, _, _) = connect(&host, &ChannelParams::new("order")).await;

    for i in 0..5 {
        send(&mut ws, ClientMessage::input(format!("echo step_$(({i}+100))\n"))).await;
    }

    let output = read_until(&mut ws, "step_104").await;
    let positions: Vec<usize> = (100..105)
        .map(|n| output.find(&format!("step_{n}")).expect("marker missing"))
        .collect();
    let mut sorted = positions.clone();
    sorted.sort_unstable();
    assert_eq!(positions, sorted);
}

#[tokio::test]
async fn test_closing_one_channel_leaves_other_session_alive() {
    let host = start_host(sh_settings()).await;
    let (mut first, first_pid, _) = connect(&host, &ChannelParams::new("tab-a")).await;
    let (mut second, second_pid, _) = connect(&host, &ChannelParams::new("tab-b")).await;
    assert_ne!(first_pid, second_pid);

    first.close(None).await.unwrap();
    assert!(wait_until(|| !host.registry.exists("tab-a")).await);
    assert!(wait_until(|| !pid_alive(first_pid)).await);

    assert!(host.registry.exists("tab-b"));
    assert!(pid_alive(second_pid));
    assert_eq!(host.registry.get("tab-b").map(|s| s.pid()), Some(second_pid));

    send(&mut second, ClientMessage::input("echo still_$((40+2))\n")).await;
    let output = read_until(&mut second, "still_42").await;
    assert!(output.contains("still_42"));
}

#[tokio::test]
async fn test_resize_then_stty_reports_new_geometry() {
    let host = start_host(sh_settings()).await;
    let (mut ws, _, _) = connect(&host, &ChannelParams::new("resize")).await;

    send(&mut ws, ClientMessage::resize(Geometry::new(40, 10).unwrap())).await;
    send(&mut ws, ClientMessage::resize(Geometry::new(40, 10).unwrap())).await;
    sleep(Duration::from_millis(200)).await;

    send(&mut ws, ClientMessage::input("echo size_$(stty size | tr ' ' x)\n")).await;
    let output = read_until(&mut ws, "size_10x40").await;
    assert!(output.contains("size_10x40"), "output was: {output:?}");
    assert!(host.registry.exists("resize"));
}

#[tokio::test]
async fn test_reconnect_yields_new_pid() {
    let host = start_host(sh_settings()).await;
    let (ws, pid, _) = connect(&host, &ChannelParams::new("tab-1")).await;
    drop(ws);

    assert!(wait_until(|| !host.registry.exists("tab-1")).await);

    // Reconnect uses a fresh session id.
    let (_ws, new_pid, _) = connect(&host, &ChannelParams::new("tab-1-retry")).await;
    assert_ne!(new_pid, pid);
}

#[tokio::test]
async fn test_invalid_cwd_falls_back_to_home() {
    let host = start_host(sh_settings()).await;
    let params = ChannelParams::new("cwd").with_cwd("/definitely/not/here");

    let (_ws, _, cwd) = connect(&host, &params).await;
    assert_ne!(cwd, "/definitely/not/here");
    let home = dirs::home_dir().unwrap_or_else(|| "/".into());
    assert_eq!(cwd, home.to_string_lossy());
}

#[tokio::test]
async fn test_shell_exit_sends_exit_and_closes() {
    let host = start_host(sh_settings()).await;
    let (mut ws, _, _) = connect(&host, &ChannelParams::new("exit")).await;

    send(&mut ws, ClientMessage::input("exit 7\n")).await;

    let mut exit = None;
    while let Some(message) = next_message(&mut ws).await {
        if let ServerMessage::Exit { exit_code, signal } = message {
            exit = Some((exit_code, signal));
            break;
        }
    }
    assert_eq!(exit, Some((Some(7), None)));
    assert!(next_message(&mut ws).await.is_none());
    assert!(wait_until(|| !host.registry.exists("exit")).await);
}

#[tokio::test]
async fn test_killed_session_reports_signal() {
    let host = start_host(sh_settings()).await;
    let (mut ws, _, _) = connect(&host, &ChannelParams::new("victim")).await;

    host.registry.kill("victim").unwrap();

    let mut exit = None;
    while let Some(message) = next_message(&mut ws).await {
        if let ServerMessage::Exit { exit_code, signal } = message {
            exit = Some((exit_code, signal));
            break;
        }
    }
    let (exit_code, signal) = exit.expect("no exit message");
    assert_eq!(exit_code, None);
    assert!(signal.is_some_and(|name| !name.is_empty()));
    assert!(!host.registry.exists("victim"));
}

#[tokio::test]
async fn test_raw_text_is_written_as_input() {
    let host = start_host(sh_settings()).await;
    let (mut ws, _, _) = connect(&host, &ChannelParams::new("raw")).await;

    ws.send(Message::Text("echo raw_$((6*7))\n".to_string())).await.unwrap();
    let output = read_until(&mut ws, "raw_42").await;
    assert!(output.contains("raw_42"));

    // An unknown structured message is typed like any other text; the
    // terminal echoes it back.
    ws.send(Message::Text(r#"{"type":"bogus"}"#.to_string())).await.unwrap();
    let output = read_until(&mut ws, "bogus").await;
    assert!(output.contains(r#"{"type":"bogus"}"#), "output was: {output:?}");

    // Clear the typed line before the next command.
    send(&mut ws, ClientMessage::input("\u{15}echo after_$((1+1))\n")).await;
    let output = read_until(&mut ws, "after_2").await;
    assert!(output.contains("after_2"));
}

#[tokio::test]
async fn test_spawn_failure_sends_error() {
    let host = start_host(RegistrySettings::with_shell("/definitely/not/a/shell")).await;
    let mut ws = open(&host, &ChannelParams::new("broken")).await;

    match next_message(&mut ws).await {
        Some(ServerMessage::Error { message }) => assert!(!message.is_empty()),
        other => panic!("expected error, got {other:?}"),
    }
    assert!(next_message(&mut ws).await.is_none());
    assert!(!host.registry.exists("broken"));
}

#[tokio::test]
async fn test_grace_window_reattach_replays_backlog() {
    let mut settings = sh_settings();
    settings.reconnect_grace = Duration::from_secs(30);
    let host = start_host(settings).await;
    let params = ChannelParams::new("durable");

    let (mut ws, pid, _) = connect(&host, &params).await;
    send(&mut ws, ClientMessage::input("sleep 1; echo late_$((2*21))\n")).await;
    ws.close(None).await.unwrap();

    sleep(Duration::from_millis(1500)).await;
    assert!(host.registry.exists("durable"));

    let (mut ws, same_pid, _) = connect(&host, &params).await;
    assert_eq!(same_pid, pid);
    let output = read_until(&mut ws, "late_42").await;
    assert!(output.contains("late_42"));
}

#[tokio::test]
async fn test_second_channel_takes_over_session() {
    let mut settings = sh_settings();
    settings.reconnect_grace = Duration::from_secs(30);
    let host = start_host(settings).await;
    let params = ChannelParams::new("shared");

    let (mut old, pid, _) = connect(&host, &params).await;
    let (mut new, new_pid, _) = connect(&host, &params).await;
    assert_eq!(pid, new_pid);

    // The superseded channel is closed by the host.
    let mut closed = false;
    for _ in 0..20 {
        if next_message(&mut old).await.is_none() {
            closed = true;
            break;
        }
    }
    assert!(closed);

    send(&mut new, ClientMessage::input("echo mine_$((3*3))\n")).await;
    let output = read_until(&mut new, "mine_9").await;
    assert!(output.contains("mine_9"));
}
