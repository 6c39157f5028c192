//! End-to-end integration tests for the WebTerm daemon.
//!
//! These tests run the real server and real shells (`/bin/sh`) and talk to
//! them over a WebSocket:
//! - Session creation and acknowledgement
//! - Input/output round trips and resize
//! - Close, disconnect cleanup, and shell exit
//! - Graceful shutdown

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use webterm_daemon::config::Config;
use webterm_daemon::orchestrator::{DaemonOrchestrator, OrchestratorState};
use webterm_daemon::protocol::Packet;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(10);

fn test_config() -> Config {
    let mut config = Config::default();
    config.server.bind_addr = "127.0.0.1:0".to_string();
    config.session.default_shell = "/bin/sh".to_string();
    config.session.max_sessions = 8;
    config
}

async fn start_daemon() -> (DaemonOrchestrator, SocketAddr) {
    let mut orchestrator = DaemonOrchestrator::new(test_config()).unwrap();
    orchestrator.start().await.unwrap();
    let addr = orchestrator.local_addr().unwrap();
    (orchestrator, addr)
}

async fn connect(addr: SocketAddr) -> Ws {
    let (ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    ws
}

async fn send_event(ws: &mut Ws, event: &str, data: Value, id: Option<u64>) {
    let packet = Packet::Event {
        event: event.to_string(),
        data,
        id,
    };
    ws.send(Message::Text(packet.encode().unwrap())).await.unwrap();
}

/// Next packet, skipping control frames.
async fn next_packet(ws: &mut Ws) -> Option<Packet> {
    loop {
        let frame = timeout(WAIT, ws.next()).await.expect("timed out waiting for frame")?;
        match frame.ok()? {
            Message::Text(text) => return Some(Packet::decode(&text).unwrap()),
            Message::Close(_) => return None,
            _ => continue,
        }
    }
}

/// Wait for the ack with `id`, collecting nothing else.
async fn wait_ack(ws: &mut Ws, id: u64) -> bool {
    loop {
        match next_packet(ws).await {
            Some(Packet::Ack { id: ack_id, data }) if ack_id == id => {
                return data["success"].as_bool().unwrap();
            }
            Some(_) => continue,
            None => panic!("connection closed before ack {id}"),
        }
    }
}

async fn create(ws: &mut Ws, terminal_id: &str, cols: u16, rows: u16, ack_id: u64) -> bool {
    send_event(
        ws,
        "create_terminal",
        json!({"terminal_id": terminal_id, "cols": cols, "rows": rows}),
        Some(ack_id),
    )
    .await;
    wait_ack(ws, ack_id).await
}

async fn input(ws: &mut Ws, terminal_id: &str, text: &str) {
    send_event(
        ws,
        "terminal_input",
        json!({"terminal_id": terminal_id, "input": text}),
        None,
    )
    .await;
}

/// Accumulate output for `terminal_id` until it contains `needle`.
async fn read_until(ws: &mut Ws, terminal_id: &str, needle: &str) -> String {
    let event_name = format!("terminal_output_{terminal_id}");
    let deadline = Instant::now() + WAIT;
    let mut collected = String::new();

    while Instant::now() < deadline {
        match next_packet(ws).await {
            Some(Packet::Event { event, data, .. }) if event == event_name => {
                collected.push_str(data["output"].as_str().unwrap());
                if collected.contains(needle) {
                    return collected;
                }
            }
            Some(_) => continue,
            None => break,
        }
    }
    panic!("never saw {needle:?} in output of {terminal_id}: {collected:?}");
}

async fn wait_for_count(orchestrator: &DaemonOrchestrator, expected: usize) {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if orchestrator.registry().count() == expected {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!(
        "expected {expected} sessions, found {}",
        orchestrator.registry().count()
    );
}

// =============================================================================
// HTTP
// =============================================================================

#[tokio::test]
async fn test_health_endpoint() {
    let (orchestrator, addr) = start_daemon().await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();

    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.ends_with(r#"{"status":"healthy"}"#));

    orchestrator.stop().await.unwrap();
}

// =============================================================================
// Session Lifecycle
// =============================================================================

#[tokio::test]
async fn test_create_and_echo_round_trip() {
    let (orchestrator, addr) = start_daemon().await;
    let mut ws = connect(addr).await;

    assert!(create(&mut ws, "e2e-echo", 80, 24, 1).await);
    assert_eq!(orchestrator.registry().count(), 1);

    // The command line echoes "20+22"; only the shell's answer prints 42.
    input(&mut ws, "e2e-echo", "echo $((20+22))\n").await;
    let output = read_until(&mut ws, "e2e-echo", "42").await;
    assert!(!output.contains('\u{FFFD}'));

    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_duplicate_create_is_rejected() {
    let (orchestrator, addr) = start_daemon().await;
    let mut ws = connect(addr).await;

    assert!(create(&mut ws, "e2e-dup", 80, 24, 1).await);
    assert!(!create(&mut ws, "e2e-dup", 80, 24, 2).await);
    assert_eq!(orchestrator.registry().count(), 1);

    // The original session still works
    input(&mut ws, "e2e-dup", "echo $((6*7))\n").await;
    read_until(&mut ws, "e2e-dup", "42").await;

    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_resize_reaches_the_pty() {
    let (orchestrator, addr) = start_daemon().await;
    let mut ws = connect(addr).await;

    assert!(create(&mut ws, "e2e-resize", 80, 24, 1).await);
    send_event(
        &mut ws,
        "resize_terminal",
        json!({"terminal_id": "e2e-resize", "cols": 100, "rows": 40}),
        None,
    )
    .await;

    input(&mut ws, "e2e-resize", "stty size\n").await;
    read_until(&mut ws, "e2e-resize", "40 100").await;

    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_close_terminal_acks_and_frees_slot() {
    let (orchestrator, addr) = start_daemon().await;
    let mut ws = connect(addr).await;

    assert!(create(&mut ws, "e2e-close", 80, 24, 1).await);
    send_event(
        &mut ws,
        "close_terminal",
        json!({"terminal_id": "e2e-close"}),
        Some(2),
    )
    .await;
    assert!(wait_ack(&mut ws, 2).await);
    assert_eq!(orchestrator.registry().count(), 0);

    // Closing again changes nothing and reports no live session
    send_event(
        &mut ws,
        "close_terminal",
        json!({"terminal_id": "e2e-close"}),
        Some(3),
    )
    .await;
    assert!(!wait_ack(&mut ws, 3).await);
    assert_eq!(orchestrator.registry().count(), 0);

    // A closed id cannot be reused
    assert!(!create(&mut ws, "e2e-close", 80, 24, 4).await);

    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_disconnect_closes_owned_sessions() {
    let (orchestrator, addr) = start_daemon().await;

    let mut first = connect(addr).await;
    let mut second = connect(addr).await;
    assert!(create(&mut first, "e2e-drop-a", 80, 24, 1).await);
    assert!(create(&mut first, "e2e-drop-b", 80, 24, 2).await);
    assert!(create(&mut second, "e2e-keep", 80, 24, 1).await);
    assert_eq!(orchestrator.registry().count(), 3);

    first.close(None).await.unwrap();
    drop(first);

    wait_for_count(&orchestrator, 1).await;
    assert!(orchestrator.registry().lookup("e2e-keep").await.is_some());

    input(&mut second, "e2e-keep", "echo $((40+2))\n").await;
    read_until(&mut second, "e2e-keep", "42").await;

    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_foreign_connection_cannot_drive_session() {
    let (orchestrator, addr) = start_daemon().await;

    let mut owner = connect(addr).await;
    let mut other = connect(addr).await;
    assert!(create(&mut owner, "e2e-owned", 80, 24, 1).await);

    send_event(
        &mut other,
        "close_terminal",
        json!({"terminal_id": "e2e-owned"}),
        Some(1),
    )
    .await;
    assert!(!wait_ack(&mut other, 1).await);
    assert!(orchestrator.registry().lookup("e2e-owned").await.is_some());

    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_shell_exit_sends_notice() {
    let (orchestrator, addr) = start_daemon().await;
    let mut ws = connect(addr).await;

    assert!(create(&mut ws, "e2e-exit", 80, 24, 1).await);
    input(&mut ws, "e2e-exit", "exit\n").await;
    read_until(&mut ws, "e2e-exit", "Process exited").await;

    wait_for_count(&orchestrator, 0).await;

    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_malformed_frames_are_skipped() {
    let (orchestrator, addr) = start_daemon().await;
    let mut ws = connect(addr).await;

    ws.send(Message::Text("not json".to_string())).await.unwrap();
    send_event(&mut ws, "launch_missiles", json!({}), Some(7)).await;
    send_event(&mut ws, "create_terminal", json!({"cols": 80}), Some(8)).await;

    assert!(create(&mut ws, "e2e-after-garbage", 80, 24, 9).await);

    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_sessions_isolated_across_connections() {
    let (orchestrator, addr) = start_daemon().await;

    let mut a = connect(addr).await;
    let mut b = connect(addr).await;
    assert!(create(&mut a, "e2e-iso-a", 80, 24, 1).await);
    assert!(create(&mut b, "e2e-iso-b", 80, 24, 1).await);

    input(&mut a, "e2e-iso-a", "echo A$((1+1))A\n").await;
    input(&mut b, "e2e-iso-b", "echo B$((2+2))B\n").await;

    let out_a = read_until(&mut a, "e2e-iso-a", "A2A").await;
    let out_b = read_until(&mut b, "e2e-iso-b", "B4B").await;
    assert!(!out_a.contains("B4B"));
    assert!(!out_b.contains("A2A"));

    orchestrator.stop().await.unwrap();
}

// =============================================================================
// Shutdown
// =============================================================================

#[tokio::test]
async fn test_shutdown_closes_connections_and_sessions() {
    let (orchestrator, addr) = start_daemon().await;
    let mut ws = connect(addr).await;
    assert!(create(&mut ws, "e2e-shutdown", 80, 24, 1).await);

    orchestrator.stop().await.unwrap();
    assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
    assert_eq!(orchestrator.registry().count(), 0);

    // Drain until the server's close frame or end of stream
    let closed = timeout(WAIT, async {
        while let Some(frame) = ws.next().await {
            match frame {
                Ok(Message::Close(_)) | Err(_) => return true,
                Ok(_) => continue,
            }
        }
        true
    })
    .await;
    assert!(matches!(closed, Ok(true)));
}
