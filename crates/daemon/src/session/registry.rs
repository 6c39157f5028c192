//! Session registry.
//!
//! The registry is the single owner of session records. It maps each
//! client-chosen id to its state machine (`Pending -> Active -> Closing ->
//! Closed`), its PTY process, and the transport it is bound to, and it
//! serializes create, close, and disconnect cleanup per id.
//!
//! Ids are never reused: once a session is closed its id moves to a
//! tombstone set and further creates with that id fail.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use tokio::sync::{mpsc, watch, Mutex};
use webterm_protocol::Packet;

use super::pty::{PtyAdapter, PtyProcess, SessionError, SessionId};
use super::pump;

/// Server-assigned identifier of one client connection.
pub type TransportId = String;

/// Queue of packets bound for one transport.
pub type OutboundTx = mpsc::Sender<Packet>;

/// Input chunks a session may hold before further input is refused.
pub const INPUT_QUEUE_CAPACITY: usize = 1024;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Process is being spawned.
    Pending,
    /// Process is running and accepting input.
    Active,
    /// Teardown has begun.
    Closing,
    /// Process destroyed and entry removed.
    Closed,
}

/// Read-only snapshot of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Client-chosen id.
    pub id: SessionId,
    /// Current terminal columns.
    pub cols: u16,
    /// Current terminal rows.
    pub rows: u16,
    /// Lifecycle state.
    pub state: SessionState,
    /// Transport the session is bound to.
    pub transport: TransportId,
    /// Shell process id, once spawned.
    pub pid: Option<u32>,
}

pub(crate) struct SessionEntry {
    id: SessionId,
    transport: TransportId,
    outbound: OutboundTx,
    inner: Mutex<SessionInner>,
    /// Flips to `true` once the session is `Closed` and its entry removed.
    closed: watch::Sender<bool>,
}

struct SessionInner {
    state: SessionState,
    cols: u16,
    rows: u16,
    pid: Option<u32>,
    process: Option<Arc<dyn PtyProcess>>,
    input: Option<mpsc::Sender<Vec<u8>>>,
}

impl SessionEntry {
    pub(crate) fn id(&self) -> &SessionId {
        &self.id
    }

    pub(crate) fn outbound(&self) -> &OutboundTx {
        &self.outbound
    }

    fn mark_closed(&self) {
        self.closed.send_replace(true);
    }

    async fn wait_closed(&self) {
        let mut closed = self.closed.subscribe();
        let _ = closed.wait_for(|done| *done).await;
    }

    async fn info(&self) -> SessionInfo {
        let inner = self.inner.lock().await;
        SessionInfo {
            id: self.id.clone(),
            cols: inner.cols,
            rows: inner.rows,
            state: inner.state,
            transport: self.transport.clone(),
            pid: inner.pid,
        }
    }
}

/// Result of moving a session out of `Pending`/`Active`.
pub(crate) enum CloseStart {
    /// The caller owns the teardown.
    Teardown(Teardown),
    /// The in-flight create will tear the session down.
    Deferred,
    /// Another caller is already tearing the session down.
    InProgress(Arc<SessionEntry>),
    /// Unknown or closed.
    NotLive,
}

/// A session that has entered `Closing` and still has to be destroyed.
pub(crate) struct Teardown {
    entry: Arc<SessionEntry>,
    process: Option<Arc<dyn PtyProcess>>,
}

/// Thread-safe registry of terminal sessions.
pub struct SessionRegistry {
    adapter: Arc<dyn PtyAdapter>,
    sessions: DashMap<SessionId, Arc<SessionEntry>>,
    retired: DashSet<SessionId>,
    live: AtomicUsize,
    max_sessions: usize,
}

impl SessionRegistry {
    /// Create a registry spawning processes through `adapter`.
    pub fn new(adapter: Arc<dyn PtyAdapter>, max_sessions: usize) -> Arc<Self> {
        Arc::new(Self {
            adapter,
            sessions: DashMap::new(),
            retired: DashSet::new(),
            live: AtomicUsize::new(0),
            max_sessions,
        })
    }

    /// Create a session bound to `transport` and spawn its PTY.
    ///
    /// Returns once the session is `Active`. On failure the id is retired
    /// and nothing is left behind; a duplicate or retired id fails with
    /// [`SessionError::AlreadyExists`] and leaves the existing session alone.
    pub async fn create(
        self: &Arc<Self>,
        id: &str,
        cols: u16,
        rows: u16,
        transport: &str,
        outbound: OutboundTx,
    ) -> Result<SessionInfo, SessionError> {
        if !self.reserve_slot() {
            tracing::warn!(
                session_id = %id,
                max_sessions = self.max_sessions,
                "Session limit reached"
            );
            return Err(SessionError::LimitReached(self.max_sessions));
        }

        let entry = match self.sessions.entry(id.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(_) if self.retired.contains(id) => None,
            Entry::Vacant(vacant) => {
                let entry = Arc::new(SessionEntry {
                    id: id.to_string(),
                    transport: transport.to_string(),
                    outbound,
                    inner: Mutex::new(SessionInner {
                        state: SessionState::Pending,
                        cols,
                        rows,
                        pid: None,
                        process: None,
                        input: None,
                    }),
                    closed: watch::Sender::new(false),
                });
                vacant.insert(Arc::clone(&entry));
                Some(entry)
            }
        };

        let Some(entry) = entry else {
            self.release_slot();
            tracing::warn!(session_id = %id, "Rejected create for existing id");
            return Err(SessionError::AlreadyExists(id.to_string()));
        };

        let adapter = Arc::clone(&self.adapter);
        let spawned = tokio::task::spawn_blocking(move || adapter.spawn(cols, rows))
            .await
            .unwrap_or_else(|e| Err(SessionError::SpawnFailed(e.to_string())));

        let (process, output) = match spawned {
            Ok(spawned) => spawned,
            Err(e) => {
                tracing::error!(session_id = %id, error = %e, "Failed to spawn PTY");
                entry.inner.lock().await.state = SessionState::Closed;
                self.retire(id);
                entry.mark_closed();
                return Err(e);
            }
        };

        let mut inner = entry.inner.lock().await;
        if inner.state != SessionState::Pending {
            // Closed while the process was starting up.
            inner.state = SessionState::Closed;
            drop(inner);
            destroy_process(id, process).await;
            self.retire(id);
            entry.mark_closed();
            tracing::info!(session_id = %id, "Session closed before becoming active");
            return Err(SessionError::NotActive(id.to_string()));
        }

        let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE_CAPACITY);
        inner.state = SessionState::Active;
        inner.pid = process.pid();
        inner.process = Some(Arc::clone(&process));
        inner.input = Some(input_tx);
        drop(inner);

        pump::spawn_input_pump(Arc::clone(self), Arc::clone(&entry), process, input_rx);
        pump::spawn_output_pump(Arc::clone(self), Arc::clone(&entry), output);

        let info = entry.info().await;
        tracing::info!(
            session_id = %id,
            transport_id = %transport,
            pid = ?info.pid,
            cols = cols,
            rows = rows,
            "Created terminal session"
        );
        Ok(info)
    }

    /// Snapshot of a session, if it exists.
    pub async fn lookup(&self, id: &str) -> Option<SessionInfo> {
        let entry = self.get(id)?;
        Some(entry.info().await)
    }

    /// Queue input for an `Active` session.
    ///
    /// Input is written to the PTY in call order by the session's input pump.
    /// Never waits on the PTY: when [`INPUT_QUEUE_CAPACITY`] chunks are
    /// already waiting the chunk is refused with
    /// [`SessionError::InputQueueFull`].
    pub async fn input(&self, id: &str, data: Vec<u8>) -> Result<(), SessionError> {
        let entry = self
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        let inner = entry.inner.lock().await;

        match (inner.state, inner.input.as_ref()) {
            (SessionState::Active, Some(tx)) => match tx.try_send(data) {
                Ok(()) => Ok(()),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    Err(SessionError::InputQueueFull(id.to_string()))
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    Err(SessionError::NotActive(id.to_string()))
                }
            },
            _ => Err(SessionError::NotActive(id.to_string())),
        }
    }

    /// Resize an `Active` session's PTY.
    pub async fn resize(&self, id: &str, cols: u16, rows: u16) -> Result<(), SessionError> {
        let entry = self
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        let mut inner = entry.inner.lock().await;

        let process = match (inner.state, inner.process.as_ref()) {
            (SessionState::Active, Some(process)) => Arc::clone(process),
            _ => return Err(SessionError::NotActive(id.to_string())),
        };

        process.resize(cols, rows)?;
        inner.cols = cols;
        inner.rows = rows;

        tracing::debug!(session_id = %id, cols = cols, rows = rows, "Resized session");
        Ok(())
    }

    /// Close a session.
    ///
    /// Returns `true` if a live session was closed (or will be, when it is
    /// still being created) and `false` for unknown, closing, or closed ids.
    /// A session already being torn down by another caller is waited for,
    /// so on return it is gone from the registry.
    pub async fn close(&self, id: &str) -> bool {
        match self.begin_close(id).await {
            CloseStart::Teardown(teardown) => {
                self.finish_close(teardown).await;
                true
            }
            CloseStart::Deferred => true,
            CloseStart::InProgress(entry) => {
                entry.wait_closed().await;
                false
            }
            CloseStart::NotLive => false,
        }
    }

    /// Close every session bound to `transport`.
    pub async fn close_transport(&self, transport: &str) -> usize {
        let ids: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().transport == transport)
            .map(|entry| entry.key().clone())
            .collect();

        let mut closed = 0;
        for id in ids {
            if self.close(&id).await {
                closed += 1;
            }
        }

        if closed > 0 {
            tracing::info!(
                transport_id = %transport,
                closed = closed,
                "Closed sessions for disconnected transport"
            );
        }
        closed
    }

    /// Close every session and wait until all of them are destroyed,
    /// including those still being created or closed by someone else.
    pub async fn close_all(&self) -> usize {
        let entries: Vec<Arc<SessionEntry>> =
            self.sessions.iter().map(|e| Arc::clone(e.value())).collect();

        let mut closed = 0;
        for entry in &entries {
            if self.close(&entry.id).await {
                closed += 1;
            }
        }
        for entry in &entries {
            entry.wait_closed().await;
        }
        closed
    }

    /// Number of sessions in the registry (any state but `Closed`).
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Snapshots of all sessions.
    pub async fn list(&self) -> Vec<SessionInfo> {
        let entries: Vec<Arc<SessionEntry>> =
            self.sessions.iter().map(|e| Arc::clone(e.value())).collect();

        let mut infos = Vec::with_capacity(entries.len());
        for entry in entries {
            infos.push(entry.info().await);
        }
        infos
    }

    /// Transport a session is bound to.
    pub fn owner(&self, id: &str) -> Option<TransportId> {
        self.sessions
            .get(id)
            .map(|entry| entry.value().transport.clone())
    }

    /// Whether `id` belonged to a closed session.
    pub fn is_retired(&self, id: &str) -> bool {
        self.retired.contains(id)
    }

    /// Move a session into `Closing`.
    pub(crate) async fn begin_close(&self, id: &str) -> CloseStart {
        let Some(entry) = self.get(id) else {
            return CloseStart::NotLive;
        };

        let mut inner = entry.inner.lock().await;
        match inner.state {
            SessionState::Active => {
                inner.state = SessionState::Closing;
                inner.input = None;
                let process = inner.process.take();
                drop(inner);
                CloseStart::Teardown(Teardown { entry, process })
            }
            SessionState::Pending => {
                inner.state = SessionState::Closing;
                tracing::debug!(session_id = %id, "Close requested while session pending");
                CloseStart::Deferred
            }
            SessionState::Closing => {
                drop(inner);
                CloseStart::InProgress(entry)
            }
            SessionState::Closed => CloseStart::NotLive,
        }
    }

    /// Destroy the process and remove the entry (`Closing -> Closed`).
    pub(crate) async fn finish_close(&self, teardown: Teardown) {
        let Teardown { entry, process } = teardown;

        if let Some(process) = process {
            destroy_process(&entry.id, process).await;
        }

        entry.inner.lock().await.state = SessionState::Closed;
        self.retire(&entry.id);
        entry.mark_closed();
        tracing::info!(session_id = %entry.id, "Closed terminal session");
    }

    fn get(&self, id: &str) -> Option<Arc<SessionEntry>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Tombstone first so a concurrent create never sees the id as free.
    fn retire(&self, id: &str) {
        self.retired.insert(id.to_string());
        if self.sessions.remove(id).is_some() {
            self.release_slot();
        }
    }

    fn reserve_slot(&self) -> bool {
        self.live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.max_sessions).then_some(n + 1)
            })
            .is_ok()
    }

    fn release_slot(&self) {
        let _ = self
            .live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }
}

async fn destroy_process(id: &str, process: Arc<dyn PtyProcess>) {
    match tokio::task::spawn_blocking(move || process.destroy()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(session_id = %id, error = %e, "Failed to destroy PTY"),
        Err(e) => tracing::error!(session_id = %id, error = %e, "Destroy task panicked"),
    }
}
