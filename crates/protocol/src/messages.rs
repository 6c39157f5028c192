//! Terminal session event definitions.
//!
//! This module defines the named events exchanged between the daemon and its
//! clients. Every event carries a `terminal_id` naming the session it targets,
//! except the output stream, whose session is encoded in the event name itself
//! (`terminal_output_<terminal_id>`).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProtocolError, Result};
use crate::packet::{Packet, MAX_PACKET_SIZE};

/// Opaque, client-generated session identifier.
pub type TerminalId = String;

/// Event name: client asks the server to spawn a PTY.
pub const CREATE_TERMINAL: &str = "create_terminal";
/// Event name: keystrokes or pasted text for a session.
pub const TERMINAL_INPUT: &str = "terminal_input";
/// Event name: new terminal dimensions.
pub const RESIZE_TERMINAL: &str = "resize_terminal";
/// Event name: tear a session down.
pub const CLOSE_TERMINAL: &str = "close_terminal";
/// Prefix of the per-session output event name.
pub const TERMINAL_OUTPUT_PREFIX: &str = "terminal_output_";

/// Columns used when a create request omits them.
pub const DEFAULT_COLS: u16 = 80;
/// Rows used when a create request omits them.
pub const DEFAULT_ROWS: u16 = 24;

/// Longest accepted `terminal_id`, in bytes.
pub const MAX_TERMINAL_ID_LEN: usize = 256;

/// Room left in a packet for the envelope and an escaped `terminal_id`.
const ENVELOPE_RESERVE: usize = 4096;

/// Largest text carried by one `terminal_input` or `terminal_output_<id>`
/// event. JSON escaping grows a control byte six-fold (`\u001b`), so any
/// chunk of this size encodes under [`MAX_PACKET_SIZE`].
pub const MAX_TEXT_CHUNK: usize = (MAX_PACKET_SIZE - ENVELOPE_RESERVE) / 6;

/// Split `text` into pieces of at most `max` bytes without breaking a
/// character. Concatenating the pieces gives back `text`.
pub fn chunk_text(text: &str, max: usize) -> Vec<&str> {
    let max = max.max(4);
    let mut chunks = Vec::with_capacity(text.len() / max + 1);
    let mut rest = text;
    while rest.len() > max {
        let mut end = max;
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        let (head, tail) = rest.split_at(end);
        chunks.push(head);
        rest = tail;
    }
    if !rest.is_empty() {
        chunks.push(rest);
    }
    chunks
}

fn default_cols() -> u16 {
    DEFAULT_COLS
}

fn default_rows() -> u16 {
    DEFAULT_ROWS
}

// ============================================================================
// Client → server payloads
// ============================================================================

/// Request to create a new terminal session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTerminal {
    /// Identifier chosen by the client.
    pub terminal_id: TerminalId,
    /// Requested terminal columns.
    #[serde(default = "default_cols")]
    pub cols: u16,
    /// Requested terminal rows.
    #[serde(default = "default_rows")]
    pub rows: u16,
}

/// Input destined for the session's PTY, written verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalInput {
    /// Target session.
    pub terminal_id: TerminalId,
    /// Raw input text (keystrokes, paste, control characters).
    pub input: String,
}

/// New dimensions for a session's PTY.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeTerminal {
    /// Target session.
    pub terminal_id: TerminalId,
    /// New column count.
    pub cols: u16,
    /// New row count.
    pub rows: u16,
}

/// Request to close a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseTerminal {
    /// Target session.
    pub terminal_id: TerminalId,
}

// ============================================================================
// Server → client payloads
// ============================================================================

/// Payload of a `terminal_output_<id>` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalOutput {
    /// Decoded PTY output.
    pub output: String,
}

/// Acknowledgement payload for `create_terminal` and acked `close_terminal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// Whether the request took effect.
    pub success: bool,
}

impl Ack {
    /// Successful acknowledgement.
    pub const fn ok() -> Self {
        Self { success: true }
    }

    /// Failed acknowledgement.
    pub const fn failed() -> Self {
        Self { success: false }
    }
}

// ============================================================================
// Typed events
// ============================================================================

/// Events sent by a client to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// `create_terminal`
    CreateTerminal(CreateTerminal),
    /// `terminal_input`
    TerminalInput(TerminalInput),
    /// `resize_terminal`
    ResizeTerminal(ResizeTerminal),
    /// `close_terminal`
    CloseTerminal(CloseTerminal),
}

impl ClientEvent {
    /// Wire name of this event.
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::CreateTerminal(_) => CREATE_TERMINAL,
            ClientEvent::TerminalInput(_) => TERMINAL_INPUT,
            ClientEvent::ResizeTerminal(_) => RESIZE_TERMINAL,
            ClientEvent::CloseTerminal(_) => CLOSE_TERMINAL,
        }
    }

    /// Session this event targets.
    pub fn terminal_id(&self) -> &str {
        match self {
            ClientEvent::CreateTerminal(m) => &m.terminal_id,
            ClientEvent::TerminalInput(m) => &m.terminal_id,
            ClientEvent::ResizeTerminal(m) => &m.terminal_id,
            ClientEvent::CloseTerminal(m) => &m.terminal_id,
        }
    }

    /// Check the invariants serde cannot express: a non-empty id and
    /// strictly positive dimensions.
    pub fn validate(&self) -> Result<()> {
        if self.terminal_id().is_empty() {
            return Err(self.invalid("terminal_id must not be empty"));
        }
        if self.terminal_id().len() > MAX_TERMINAL_ID_LEN {
            return Err(self.invalid(format!(
                "terminal_id longer than {MAX_TERMINAL_ID_LEN} bytes"
            )));
        }
        let dims = match self {
            ClientEvent::CreateTerminal(m) => Some((m.cols, m.rows)),
            ClientEvent::ResizeTerminal(m) => Some((m.cols, m.rows)),
            _ => None,
        };
        if let Some((cols, rows)) = dims {
            if cols == 0 || rows == 0 {
                return Err(self.invalid(format!(
                    "dimensions must be positive, got {cols}x{rows}"
                )));
            }
        }
        Ok(())
    }

    /// Wrap this event in a packet, optionally requesting an ack under `ack_id`.
    pub fn to_packet(&self, ack_id: Option<u64>) -> Result<Packet> {
        let data = match self {
            ClientEvent::CreateTerminal(m) => serde_json::to_value(m),
            ClientEvent::TerminalInput(m) => serde_json::to_value(m),
            ClientEvent::ResizeTerminal(m) => serde_json::to_value(m),
            ClientEvent::CloseTerminal(m) => serde_json::to_value(m),
        }
        .map_err(|e| ProtocolError::Serialization(e.to_string()))?;

        Ok(Packet::Event {
            event: self.name().to_string(),
            data,
            id: ack_id,
        })
    }

    /// Build a typed event from a packet's event name and payload.
    ///
    /// The result is validated; an unknown name yields
    /// [`ProtocolError::UnknownEvent`].
    pub fn from_parts(event: &str, data: Value) -> Result<Self> {
        let parsed = match event {
            CREATE_TERMINAL => ClientEvent::CreateTerminal(payload(event, data)?),
            TERMINAL_INPUT => ClientEvent::TerminalInput(payload(event, data)?),
            RESIZE_TERMINAL => ClientEvent::ResizeTerminal(payload(event, data)?),
            CLOSE_TERMINAL => ClientEvent::CloseTerminal(payload(event, data)?),
            other => return Err(ProtocolError::UnknownEvent(other.to_string())),
        };
        parsed.validate()?;
        Ok(parsed)
    }

    fn invalid(&self, reason: impl Into<String>) -> ProtocolError {
        ProtocolError::InvalidPayload {
            event: self.name().to_string(),
            reason: reason.into(),
        }
    }
}

/// Events sent by the server to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// `terminal_output_<terminal_id>`
    TerminalOutput {
        /// Session the output belongs to.
        terminal_id: TerminalId,
        /// Decoded PTY output.
        output: String,
    },
}

impl ServerEvent {
    /// Output event for `terminal_id`.
    pub fn output(terminal_id: impl Into<TerminalId>, output: impl Into<String>) -> Self {
        ServerEvent::TerminalOutput {
            terminal_id: terminal_id.into(),
            output: output.into(),
        }
    }

    /// Wire name of the output event for a given session.
    pub fn output_event_name(terminal_id: &str) -> String {
        format!("{TERMINAL_OUTPUT_PREFIX}{terminal_id}")
    }

    /// Wire name of this event.
    pub fn name(&self) -> String {
        match self {
            ServerEvent::TerminalOutput { terminal_id, .. } => {
                Self::output_event_name(terminal_id)
            }
        }
    }

    /// Session this event belongs to.
    pub fn terminal_id(&self) -> &str {
        match self {
            ServerEvent::TerminalOutput { terminal_id, .. } => terminal_id,
        }
    }

    /// Wrap this event in a packet. Server events never request an ack.
    pub fn to_packet(&self) -> Result<Packet> {
        let data = match self {
            ServerEvent::TerminalOutput { output, .. } => serde_json::to_value(TerminalOutput {
                output: output.clone(),
            }),
        }
        .map_err(|e| ProtocolError::Serialization(e.to_string()))?;

        Ok(Packet::Event {
            event: self.name(),
            data,
            id: None,
        })
    }

    /// Build a typed event from a packet's event name and payload.
    pub fn from_parts(event: &str, data: Value) -> Result<Self> {
        match event.strip_prefix(TERMINAL_OUTPUT_PREFIX) {
            Some(terminal_id) if !terminal_id.is_empty() => {
                let TerminalOutput { output } = payload(event, data)?;
                Ok(ServerEvent::TerminalOutput {
                    terminal_id: terminal_id.to_string(),
                    output,
                })
            }
            _ => Err(ProtocolError::UnknownEvent(event.to_string())),
        }
    }
}

fn payload<T: serde::de::DeserializeOwned>(event: &str, data: Value) -> Result<T> {
    serde_json::from_value(data).map_err(|e| ProtocolError::InvalidPayload {
        event: event.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_chunk_text_keeps_characters_whole() {
        let text = "ab\u{00e9}\u{1f600}cd";
        let chunks = chunk_text(text, 4);
        assert_eq!(chunks, vec!["ab\u{00e9}", "\u{1f600}", "cd"]);
        assert_eq!(chunks.concat(), text);
        assert!(chunk_text("", 8).is_empty());
        assert_eq!(chunk_text("short", 8), vec!["short"]);
    }

    #[test]
    fn test_worst_case_output_chunk_fits_in_packet() {
        let id = "t".repeat(MAX_TERMINAL_ID_LEN);
        let output = "\x1b".repeat(MAX_TEXT_CHUNK);
        let packet = ServerEvent::output(id.clone(), output).to_packet().unwrap();
        assert!(packet.encode().is_ok());

        let input = ClientEvent::TerminalInput(TerminalInput {
            terminal_id: id,
            input: "\x1b".repeat(MAX_TEXT_CHUNK),
        });
        assert!(input.to_packet(Some(u64::MAX)).unwrap().encode().is_ok());
    }

    #[test]
    fn test_oversized_output_split_encodes() {
        let output = "\x1b[0m".repeat(100_000);
        for chunk in chunk_text(&output, MAX_TEXT_CHUNK) {
            let packet = ServerEvent::output("t1", chunk).to_packet().unwrap();
            assert!(packet.encode().is_ok());
        }
    }

    #[test]
    fn test_long_terminal_id_rejected() {
        let err = ClientEvent::from_parts(
            CLOSE_TERMINAL,
            json!({"terminal_id": "x".repeat(MAX_TERMINAL_ID_LEN + 1)}),
        )
        .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayload { .. }));
    }

    fn roundtrip_client(event: ClientEvent) {
        let packet = event.to_packet(None).expect("to_packet failed");
        let Packet::Event { event: name, data, .. } = packet else {
            panic!("expected event packet");
        };
        let decoded = ClientEvent::from_parts(&name, data).expect("from_parts failed");
        assert_eq!(event, decoded);
    }

    #[test]
    fn test_create_terminal_roundtrip() {
        roundtrip_client(ClientEvent::CreateTerminal(CreateTerminal {
            terminal_id: "term-1700000000000-a1b2c3d4".to_string(),
            cols: 132,
            rows: 43,
        }));
    }

    #[test]
    fn test_terminal_input_roundtrip_preserves_control_chars() {
        roundtrip_client(ClientEvent::TerminalInput(TerminalInput {
            terminal_id: "t1".to_string(),
            input: "ls -la\r\x03\x1b[A".to_string(),
        }));
    }

    #[test]
    fn test_create_terminal_payload_shape() {
        let packet = ClientEvent::CreateTerminal(CreateTerminal {
            terminal_id: "t1".to_string(),
            cols: 80,
            rows: 24,
        })
        .to_packet(Some(7))
        .unwrap();

        assert_eq!(
            packet,
            Packet::Event {
                event: "create_terminal".to_string(),
                data: json!({"terminal_id": "t1", "cols": 80, "rows": 24}),
                id: Some(7),
            }
        );
    }

    #[test]
    fn test_create_terminal_defaults_dimensions() {
        let event = ClientEvent::from_parts(CREATE_TERMINAL, json!({"terminal_id": "t1"})).unwrap();
        assert_eq!(
            event,
            ClientEvent::CreateTerminal(CreateTerminal {
                terminal_id: "t1".to_string(),
                cols: DEFAULT_COLS,
                rows: DEFAULT_ROWS,
            })
        );
    }

    #[test]
    fn test_zero_dimensions_rejected() {
        let err = ClientEvent::from_parts(
            RESIZE_TERMINAL,
            json!({"terminal_id": "t1", "cols": 0, "rows": 24}),
        )
        .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayload { ref event, .. } if event == "resize_terminal"));
    }

    #[test]
    fn test_negative_dimensions_rejected() {
        let err = ClientEvent::from_parts(
            CREATE_TERMINAL,
            json!({"terminal_id": "t1", "cols": -1, "rows": 24}),
        )
        .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayload { .. }));
    }

    #[test]
    fn test_empty_terminal_id_rejected() {
        let err = ClientEvent::from_parts(CLOSE_TERMINAL, json!({"terminal_id": ""})).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayload { .. }));
    }

    #[test]
    fn test_missing_field_rejected() {
        let err = ClientEvent::from_parts(TERMINAL_INPUT, json!({"terminal_id": "t1"})).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayload { .. }));
    }

    #[test]
    fn test_unknown_client_event() {
        let err = ClientEvent::from_parts("spawn_shell", json!({})).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownEvent(ref name) if name == "spawn_shell"));
    }

    #[test]
    fn test_output_event_name() {
        let event = ServerEvent::output("term-42", "hello");
        assert_eq!(event.name(), "terminal_output_term-42");
    }

    #[test]
    fn test_output_event_with_underscored_id() {
        let event = ServerEvent::output("my_term_1", "$ ");
        let Packet::Event { event: name, data, id } = event.to_packet().unwrap() else {
            panic!("expected event packet");
        };
        assert_eq!(name, "terminal_output_my_term_1");
        assert_eq!(data, json!({"output": "$ "}));
        assert_eq!(id, None);

        let decoded = ServerEvent::from_parts(&name, data).unwrap();
        assert_eq!(decoded.terminal_id(), "my_term_1");
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_output_event_without_id_is_unknown() {
        let err = ServerEvent::from_parts("terminal_output_", json!({"output": ""})).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownEvent(_)));

        let err = ServerEvent::from_parts("create_terminal", json!({})).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownEvent(_)));
    }

    #[test]
    fn test_ack_payload_shape() {
        assert_eq!(serde_json::to_value(Ack::ok()).unwrap(), json!({"success": true}));
        assert_eq!(serde_json::to_value(Ack::failed()).unwrap(), json!({"success": false}));
    }

    #[test]
    fn test_terminal_id_accessor() {
        let event = ClientEvent::CloseTerminal(CloseTerminal {
            terminal_id: "abc".to_string(),
        });
        assert_eq!(event.terminal_id(), "abc");
        assert_eq!(event.name(), "close_terminal");
    }
}
