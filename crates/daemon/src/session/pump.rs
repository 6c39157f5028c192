//! Per-session I/O pumps.
//!
//! Every `Active` session runs two tasks:
//!
//! - the **input pump** drains the session's input FIFO and writes each chunk
//!   to the PTY on the blocking pool, one at a time, so input reaches the
//!   shell in the order it was received;
//! - the **output pump** drains the PTY output stream, decodes it as UTF-8
//!   across chunk boundaries, and queues `terminal_output_<id>` packets on the
//!   bound transport.
//!
//! A write or read failure, or the shell exiting, is reported to the client
//! as a line of output before the session is forced closed.

use std::sync::Arc;

use tokio::sync::mpsc;
use webterm_protocol::{chunk_text, ServerEvent, Utf8StreamDecoder, MAX_TEXT_CHUNK};

use super::pty::{OutputStream, PtyOutput, PtyProcess};
use super::registry::{CloseStart, SessionEntry, SessionRegistry};

/// Shown when the shell exits on its own.
pub const PROCESS_EXITED_NOTICE: &str = "\r\nProcess exited\r\n";

/// Shown when PTY I/O fails.
pub fn connection_closed_notice(error: &str) -> String {
    format!("\r\nConnection closed: {error}\r\n")
}

pub(crate) fn spawn_input_pump(
    registry: Arc<SessionRegistry>,
    entry: Arc<SessionEntry>,
    process: Arc<dyn PtyProcess>,
    mut input: mpsc::Receiver<Vec<u8>>,
) {
    tokio::spawn(async move {
        while let Some(data) = input.recv().await {
            let writer = Arc::clone(&process);
            let result = tokio::task::spawn_blocking(move || writer.write(&data)).await;

            let error = match result {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(e) => format!("write task failed: {e}"),
            };

            tracing::warn!(session_id = %entry.id(), error = %error, "PTY write failed");
            fail_session(&registry, &entry, connection_closed_notice(&error)).await;
            break;
        }

        tracing::trace!(session_id = %entry.id(), "Input pump finished");
    });
}

pub(crate) fn spawn_output_pump(
    registry: Arc<SessionRegistry>,
    entry: Arc<SessionEntry>,
    mut output: OutputStream,
) {
    tokio::spawn(async move {
        let mut decoder = Utf8StreamDecoder::new();

        let notice = loop {
            match output.recv().await {
                Some(PtyOutput::Data(bytes)) => {
                    let text = decoder.decode(&bytes);
                    if !text.is_empty() && !send_output(&entry, text).await {
                        // Transport gone; its disconnect closes the session.
                        break None;
                    }
                }
                Some(PtyOutput::Exited) | None => {
                    tracing::info!(session_id = %entry.id(), "Shell exited");
                    break Some(PROCESS_EXITED_NOTICE.to_string());
                }
                Some(PtyOutput::Failed(error)) => {
                    tracing::warn!(session_id = %entry.id(), error = %error, "PTY read failed");
                    break Some(connection_closed_notice(&error));
                }
            }
        };

        let tail = decoder.finish();
        if !tail.is_empty() {
            send_output(&entry, tail).await;
        }

        if let Some(notice) = notice {
            fail_session(&registry, &entry, notice).await;
        }

        tracing::trace!(session_id = %entry.id(), "Output pump finished");
    });
}

/// Close a session that is still `Active`, telling the client why first.
///
/// Sessions already closing (client close, disconnect) are left alone, so
/// destroying a process never produces an exit notice.
async fn fail_session(registry: &SessionRegistry, entry: &SessionEntry, notice: String) {
    if let CloseStart::Teardown(teardown) = registry.begin_close(entry.id()).await {
        send_output(entry, notice).await;
        registry.finish_close(teardown).await;
    }
}

/// Queue `output` for the transport, split so every packet fits the frame
/// limit. Returns `false` once the transport is gone.
async fn send_output(entry: &SessionEntry, output: String) -> bool {
    for chunk in chunk_text(&output, MAX_TEXT_CHUNK) {
        let packet = match ServerEvent::output(entry.id().as_str(), chunk).to_packet() {
            Ok(packet) => packet,
            Err(e) => {
                tracing::error!(session_id = %entry.id(), error = %e, "Failed to encode output");
                return false;
            }
        };

        if entry.outbound().send(packet).await.is_err() {
            tracing::debug!(session_id = %entry.id(), "Transport closed, dropping output");
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::mock::MockPtyAdapter;
    use crate::session::pty::PtyAdapter;
    use crate::session::registry::SessionState;
    use std::time::Duration;
    use tokio::time::timeout;
    use webterm_protocol::Packet;

    async fn setup(
        adapter: &Arc<MockPtyAdapter>,
    ) -> (Arc<SessionRegistry>, mpsc::Receiver<Packet>) {
        let registry = SessionRegistry::new(Arc::clone(adapter) as Arc<dyn PtyAdapter>, 10);
        let (tx, rx) = mpsc::channel(256);
        registry.create("t1", 80, 24, "conn", tx).await.unwrap();
        (registry, rx)
    }

    async fn next_output(rx: &mut mpsc::Receiver<Packet>) -> (String, String) {
        let packet = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for output")
            .expect("outbound closed");
        let Packet::Event { event, data, .. } = packet else {
            panic!("expected event packet, got {packet:?}");
        };
        match ServerEvent::from_parts(&event, data).unwrap() {
            ServerEvent::TerminalOutput {
                terminal_id,
                output,
            } => (terminal_id, output),
        }
    }

    async fn wait_closed(registry: &SessionRegistry, id: &str) {
        for _ in 0..200 {
            if registry.lookup(id).await.is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("session {id} was not closed");
    }

    #[tokio::test]
    async fn test_output_forwarded_in_order() {
        let adapter = MockPtyAdapter::new();
        let (_registry, mut rx) = setup(&adapter).await;
        let process = adapter.last();

        process.emit(b"one ").await;
        process.emit(b"two ").await;
        process.emit(b"three").await;

        let mut received = String::new();
        while received.len() < "one two three".len() {
            let (id, output) = next_output(&mut rx).await;
            assert_eq!(id, "t1");
            received.push_str(&output);
        }
        assert_eq!(received, "one two three");
    }

    #[tokio::test]
    async fn test_split_utf8_is_reassembled() {
        let adapter = MockPtyAdapter::new();
        let (_registry, mut rx) = setup(&adapter).await;
        let process = adapter.last();

        // "✓" is E2 9C 93
        process.emit(&[b'o', b'k', 0xE2]).await;
        process.emit(&[0x9C, 0x93]).await;

        assert_eq!(next_output(&mut rx).await.1, "ok");
        assert_eq!(next_output(&mut rx).await.1, "✓");
    }

    #[tokio::test]
    async fn test_escape_heavy_output_is_split_into_sendable_packets() {
        let adapter = MockPtyAdapter::new();
        let (_registry, mut rx) = setup(&adapter).await;

        // Control bytes serialize as six-character \u escapes
        let burst = vec![0x01u8; 400_000];
        adapter.last().emit(&burst).await;

        let mut received = String::new();
        let mut packets = 0;
        while received.len() < burst.len() {
            let packet = timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("timed out waiting for output")
                .expect("outbound closed");
            assert!(packet.encode().is_ok(), "packet over the frame limit");
            let Packet::Event { event, data, .. } = packet else {
                panic!("expected event packet");
            };
            let ServerEvent::TerminalOutput { output, .. } =
                ServerEvent::from_parts(&event, data).unwrap();
            received.push_str(&output);
            packets += 1;
        }
        assert!(packets > 1);
        assert_eq!(received.as_bytes(), burst.as_slice());
    }

    #[tokio::test]
    async fn test_shell_exit_sends_notice_and_closes() {
        let adapter = MockPtyAdapter::new();
        let (registry, mut rx) = setup(&adapter).await;
        let process = adapter.last();

        process.emit(b"bye").await;
        process.exit().await;

        assert_eq!(next_output(&mut rx).await.1, "bye");
        assert_eq!(next_output(&mut rx).await.1, PROCESS_EXITED_NOTICE);
        wait_closed(&registry, "t1").await;
        assert!(registry.is_retired("t1"));
        assert!(process.is_destroyed());
    }

    #[tokio::test]
    async fn test_read_failure_sends_connection_closed() {
        let adapter = MockPtyAdapter::new();
        let (registry, mut rx) = setup(&adapter).await;

        adapter.last().fail_read("input/output error").await;

        assert_eq!(
            next_output(&mut rx).await.1,
            "\r\nConnection closed: input/output error\r\n"
        );
        wait_closed(&registry, "t1").await;
    }

    #[tokio::test]
    async fn test_write_failure_sends_connection_closed() {
        let adapter = MockPtyAdapter::new();
        let (registry, mut rx) = setup(&adapter).await;
        adapter.last().fail_writes();

        registry.input("t1", b"ls\r".to_vec()).await.unwrap();

        let (_, output) = next_output(&mut rx).await;
        assert!(output.starts_with("\r\nConnection closed: "), "got {output:?}");
        assert!(output.contains("broken pipe"));
        wait_closed(&registry, "t1").await;
    }

    #[tokio::test]
    async fn test_client_close_sends_no_exit_notice() {
        let adapter = MockPtyAdapter::new();
        let (registry, mut rx) = setup(&adapter).await;

        assert!(registry.close("t1").await);
        assert_eq!(registry.lookup("t1").await.map(|i| i.state), None);

        // The destroyed process ends the stream; nothing is sent for it.
        let extra = timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(!matches!(extra, Ok(Some(_))), "unexpected packet after close: {extra:?}");
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let adapter = MockPtyAdapter::echoing();
        let registry = SessionRegistry::new(Arc::clone(&adapter) as Arc<dyn PtyAdapter>, 10);
        let (tx_a, mut rx_a) = mpsc::channel(256);
        let (tx_b, mut rx_b) = mpsc::channel(256);

        registry.create("a", 80, 24, "conn-a", tx_a).await.unwrap();
        registry.create("b", 80, 24, "conn-b", tx_b).await.unwrap();

        registry.input("a", b"from-a".to_vec()).await.unwrap();
        registry.input("b", b"from-b".to_vec()).await.unwrap();

        assert_eq!(next_output(&mut rx_a).await, ("a".to_string(), "from-a".to_string()));
        assert_eq!(next_output(&mut rx_b).await, ("b".to_string(), "from-b".to_string()));

        // Failing one session leaves the other active
        adapter.spawned()[0].exit().await;
        wait_closed(&registry, "a").await;
        assert_eq!(
            registry.lookup("b").await.map(|i| i.state),
            Some(SessionState::Active)
        );
    }
}
