//! In-memory process double for unit tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{EngineError, EngineResult};
use crate::registry::{ProcessSignal, ScopeProcess};

pub struct MockProcess {
    id: u32,
    exit_code: Mutex<Option<i32>>,
    writable: bool,
    ignores_terminate: bool,
    written: Mutex<Vec<u8>>,
    signals: Mutex<Vec<Option<ProcessSignal>>>,
    kills: AtomicUsize,
}

impl MockProcess {
    pub fn running(id: u32) -> Arc<Self> {
        Arc::new(Self::build(id, None, true))
    }

    /// Running process that only exits on kill
    pub fn stubborn(id: u32) -> Arc<Self> {
        Arc::new(Self {
            ignores_terminate: true,
            ..Self::build(id, None, true)
        })
    }

    pub fn exited(id: u32, code: i32) -> Arc<Self> {
        Arc::new(Self::build(id, Some(code), true))
    }

    pub fn read_only(id: u32) -> Arc<Self> {
        Arc::new(Self::build(id, None, false))
    }

    fn build(id: u32, exit_code: Option<i32>, writable: bool) -> Self {
        Self {
            id,
            exit_code: Mutex::new(exit_code),
            writable,
            ignores_terminate: false,
            written: Mutex::new(Vec::new()),
            signals: Mutex::new(Vec::new()),
            kills: AtomicUsize::new(0),
        }
    }

    pub fn set_exit_code(&self, code: i32) {
        *self.exit_code.lock() = Some(code);
    }

    pub fn kill_count(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    pub fn signals(&self) -> Vec<Option<ProcessSignal>> {
        self.signals.lock().clone()
    }

    pub fn written(&self) -> Vec<u8> {
        self.written.lock().clone()
    }
}

impl ScopeProcess for MockProcess {
    fn id(&self) -> u32 {
        self.id
    }

    fn write(&self, bytes: &[u8]) -> EngineResult<()> {
        if !self.writable {
            return Err(EngineError::NotWritable(self.id.to_string()));
        }
        self.written.lock().extend_from_slice(bytes);
        Ok(())
    }

    fn kill(&self, signal: Option<ProcessSignal>) -> EngineResult<()> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        self.signals.lock().push(signal);

        let mut exit_code = self.exit_code.lock();
        if exit_code.is_some() {
            return Err(EngineError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no such process",
            )));
        }
        *exit_code = match signal {
            Some(ProcessSignal::Interrupt | ProcessSignal::Terminate) if self.ignores_terminate => {
                None
            }
            Some(ProcessSignal::Interrupt) => Some(130),
            Some(ProcessSignal::Terminate) => Some(143),
            Some(ProcessSignal::Kill) | None => Some(137),
        };
        Ok(())
    }

    fn exit_code(&self) -> Option<i32> {
        *self.exit_code.lock()
    }

    fn is_writable(&self) -> bool {
        self.writable
    }
}
