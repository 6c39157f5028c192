//! In-memory PTY adapter for engine tests.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};

use tokio::sync::mpsc;

use super::pty::{OutputStream, PtyAdapter, PtyOutput, PtyProcess, SessionError};

/// Adapter whose processes record what they receive.
#[derive(Default)]
pub struct MockPtyAdapter {
    next_pid: AtomicU32,
    fail_spawn: AtomicBool,
    echo: AtomicBool,
    gate: Mutex<Option<std_mpsc::Receiver<()>>>,
    spawned: Mutex<Vec<Arc<MockProcess>>>,
}

impl MockPtyAdapter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_pid: AtomicU32::new(1000),
            ..Default::default()
        })
    }

    /// Processes echo every write back as output.
    pub fn echoing() -> Arc<Self> {
        let adapter = Self::new();
        adapter.echo.store(true, Ordering::SeqCst);
        adapter
    }

    pub fn fail_spawns(&self, fail: bool) {
        self.fail_spawn.store(fail, Ordering::SeqCst);
    }

    /// Block the next spawn until the returned sender fires.
    pub fn hold_next_spawn(&self) -> std_mpsc::Sender<()> {
        let (tx, rx) = std_mpsc::channel();
        *self.gate.lock().unwrap() = Some(rx);
        tx
    }

    pub fn spawned(&self) -> Vec<Arc<MockProcess>> {
        self.spawned.lock().unwrap().clone()
    }

    pub fn last(&self) -> Arc<MockProcess> {
        self.spawned().last().cloned().expect("no process spawned")
    }
}

impl PtyAdapter for MockPtyAdapter {
    fn spawn(
        &self,
        cols: u16,
        rows: u16,
    ) -> Result<(Arc<dyn PtyProcess>, OutputStream), SessionError> {
        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.recv();
        }

        if self.fail_spawn.load(Ordering::SeqCst) {
            return Err(SessionError::SpawnFailed("mock spawn failure".to_string()));
        }

        let (tx, rx) = mpsc::channel(64);
        let process = Arc::new(MockProcess {
            pid: self.next_pid.fetch_add(1, Ordering::SeqCst),
            echo: self.echo.load(Ordering::SeqCst),
            written: Mutex::new(Vec::new()),
            sizes: Mutex::new(vec![(cols, rows)]),
            fail_writes: AtomicBool::new(false),
            fail_resizes: AtomicBool::new(false),
            write_gate: Mutex::new(None),
            destroyed: AtomicBool::new(false),
            destroy_calls: AtomicU32::new(0),
            output: Mutex::new(Some(tx)),
        });
        self.spawned.lock().unwrap().push(Arc::clone(&process));
        Ok((process, rx))
    }
}

pub struct MockProcess {
    pid: u32,
    echo: bool,
    written: Mutex<Vec<u8>>,
    sizes: Mutex<Vec<(u16, u16)>>,
    fail_writes: AtomicBool,
    fail_resizes: AtomicBool,
    write_gate: Mutex<Option<std_mpsc::Receiver<()>>>,
    destroyed: AtomicBool,
    destroy_calls: AtomicU32,
    output: Mutex<Option<mpsc::Sender<PtyOutput>>>,
}

impl MockProcess {
    pub fn written(&self) -> String {
        String::from_utf8_lossy(&self.written.lock().unwrap()).into_owned()
    }

    /// Size at spawn followed by every successful resize.
    pub fn sizes(&self) -> Vec<(u16, u16)> {
        self.sizes.lock().unwrap().clone()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn destroy_calls(&self) -> u32 {
        self.destroy_calls.load(Ordering::SeqCst)
    }

    /// Make the next write block until the returned sender fires or drops.
    pub fn hold_next_write(&self) -> std_mpsc::Sender<()> {
        let (tx, rx) = std_mpsc::channel();
        *self.write_gate.lock().unwrap() = Some(rx);
        tx
    }

    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    pub fn fail_resizes(&self) {
        self.fail_resizes.store(true, Ordering::SeqCst);
    }

    /// Push raw output bytes as if the shell printed them.
    pub async fn emit(&self, data: &[u8]) {
        let tx = self.output.lock().unwrap().clone();
        if let Some(tx) = tx {
            let _ = tx.send(PtyOutput::Data(data.to_vec())).await;
        }
    }

    /// Simulate the shell exiting.
    pub async fn exit(&self) {
        self.finish(PtyOutput::Exited).await;
    }

    /// Simulate a read error.
    pub async fn fail_read(&self, reason: &str) {
        self.finish(PtyOutput::Failed(reason.to_string())).await;
    }

    async fn finish(&self, item: PtyOutput) {
        let tx = self.output.lock().unwrap().take();
        if let Some(tx) = tx {
            let _ = tx.send(item).await;
        }
    }
}

impl PtyProcess for MockProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        let gate = self.write_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.recv();
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SessionError::WriteFailed("broken pipe".to_string()));
        }
        self.written.lock().unwrap().extend_from_slice(data);
        if self.echo {
            if let Some(tx) = self.output.lock().unwrap().as_ref() {
                let _ = tx.try_send(PtyOutput::Data(data.to_vec()));
            }
        }
        Ok(())
    }

    fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        if self.fail_resizes.load(Ordering::SeqCst) {
            return Err(SessionError::ResizeFailed("ioctl failed".to_string()));
        }
        self.sizes.lock().unwrap().push((cols, rows));
        Ok(())
    }

    fn destroy(&self) -> Result<(), SessionError> {
        self.destroy_calls.fetch_add(1, Ordering::SeqCst);
        self.destroyed.store(true, Ordering::SeqCst);
        self.output.lock().unwrap().take();
        Ok(())
    }
}
