//! # WebTerm Protocol Library
//!
//! This crate defines the wire contract spoken between the WebTerm daemon and
//! its clients over a WebSocket.
//!
//! ## Overview
//!
//! - **Packets**: every WebSocket text frame carries one JSON [`Packet`], either
//!   a named event (optionally requesting an acknowledgement) or an ack.
//! - **Events**: typed client→server requests ([`ClientEvent`]) and the
//!   server→client output stream ([`ServerEvent`]).
//! - **Text decoding**: [`Utf8StreamDecoder`] turns a byte stream into text
//!   without splitting multi-byte characters across chunks.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │   ClientEvent / ServerEvent / Ack       │  typed payloads
//! ├─────────────────────────────────────────┤
//! │              Packet                     │  {"type":"event"|"ack", ...}
//! ├─────────────────────────────────────────┤
//! │        WebSocket text frames            │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use webterm_protocol::{ClientEvent, Packet};
//! use webterm_protocol::messages::CreateTerminal;
//!
//! let event = ClientEvent::CreateTerminal(CreateTerminal {
//!     terminal_id: "term-1000".to_string(),
//!     cols: 80,
//!     rows: 24,
//! });
//!
//! // Ask for an acknowledgement correlated by id 1
//! let packet = event.to_packet(Some(1)).unwrap();
//! let text = packet.encode().unwrap();
//!
//! let decoded = Packet::decode(&text).unwrap();
//! assert_eq!(decoded, packet);
//! ```

pub mod error;
pub mod messages;
pub mod packet;
pub mod text;

pub use error::{ProtocolError, Result};
pub use messages::{
    chunk_text, Ack, ClientEvent, ServerEvent, TerminalId, CLOSE_TERMINAL, CREATE_TERMINAL,
    MAX_TERMINAL_ID_LEN, MAX_TEXT_CHUNK, RESIZE_TERMINAL, TERMINAL_INPUT, TERMINAL_OUTPUT_PREFIX,
};
pub use packet::{Packet, MAX_PACKET_SIZE};
pub use text::Utf8StreamDecoder;
