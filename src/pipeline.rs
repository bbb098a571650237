use std::fmt;
use std::sync::{Condvar, Mutex};

use crate::kernel::KernelPtr;

/// Anything that accepts kernels: the parallel pipeline, the socket
/// pipelines, the process pipeline. `send` never blocks on I/O; it only
/// enqueues and notifies.
pub trait Pipeline: Send + Sync {
    fn send(&self, k: KernelPtr);
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Initial,
    Starting,
    Started,
    Stopping,
    Stopped,
}

impl PipelineState {
    pub fn stopping(self) -> bool {
        self == PipelineState::Stopping
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PipelineState::Initial => "initial",
            PipelineState::Starting => "starting",
            PipelineState::Started => "started",
            PipelineState::Stopping => "stopping",
            PipelineState::Stopped => "stopped",
        })
    }
}

/// Kernels collected while tearing pipelines down. They are released only
/// after every thread has joined, so no cross-connection reference can
/// observe a dangling kernel.
pub type KernelSack = Vec<KernelPtr>;

/// A process-wide exit latch. The first kernel whose final result reaches
/// the top of the lineage wins; everyone else's code is ignored.
pub struct ShutdownLatch {
    code: Mutex<Option<i32>>,
    condvar: Condvar,
}

impl ShutdownLatch {
    pub fn new() -> ShutdownLatch {
        ShutdownLatch {
            code: Mutex::new(None),
            condvar: Condvar::new(),
        }
    }

    pub fn notify(&self, code: i32) {
        let mut guard = self.code.lock().unwrap();
        if guard.is_none() {
            *guard = Some(code);
        }
        self.condvar.notify_all();
    }

    /// Block until some kernel requests shutdown; returns the exit code.
    pub fn wait(&self) -> i32 {
        let mut guard = self.code.lock().unwrap();
        loop {
            if let Some(code) = *guard {
                return code;
            }
            guard = self.condvar.wait(guard).unwrap();
        }
    }

    pub fn wait_timeout(&self, timeout: std::time::Duration) -> Option<i32> {
        let mut guard = self.code.lock().unwrap();
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if let Some(code) = *guard {
                return Some(code);
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return None;
            }
            let (g, _) = self.condvar.wait_timeout(guard, deadline - now).unwrap();
            guard = g;
        }
    }

    pub fn try_get(&self) -> Option<i32> {
        *self.code.lock().unwrap()
    }
}

impl Default for ShutdownLatch {
    fn default() -> ShutdownLatch {
        ShutdownLatch::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn first_code_wins() {
        let latch = ShutdownLatch::new();
        latch.notify(3);
        latch.notify(5);
        assert_eq!(latch.wait(), 3);
    }

    #[test]
    fn wait_blocks_until_notified() {
        let latch = Arc::new(ShutdownLatch::new());
        let other = latch.clone();
        let t = std::thread::spawn(move || other.wait());
        std::thread::sleep(Duration::from_millis(10));
        latch.notify(0);
        assert_eq!(t.join().unwrap(), 0);
    }

    #[test]
    fn wait_timeout_expires() {
        let latch = ShutdownLatch::new();
        assert_eq!(latch.wait_timeout(Duration::from_millis(20)), None);
    }
}
