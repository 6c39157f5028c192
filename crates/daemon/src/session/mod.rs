//! Session management module.
//!
//! This module provides the PTY adapter, the session registry, and the
//! per-session pumps that move bytes between a PTY and its transport.

#[cfg(test)]
pub(crate) mod mock;
pub mod pty;
pub(crate) mod pump;
pub mod registry;

pub use pty::{
    NativePtyAdapter, OutputStream, PtyAdapter, PtyOutput, PtyProcess, SessionError, SessionId,
    ShellOptions,
};
pub use pump::{connection_closed_notice, PROCESS_EXITED_NOTICE};
pub use registry::{OutboundTx, SessionInfo, SessionRegistry, SessionState, TransportId};
