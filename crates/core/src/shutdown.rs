//! Cooperative cancellation shared between session threads.
//!
//! A [`Shutdown`] owns the only sender of a zero-capacity channel. Triggering
//! drops that sender, which disconnects every [`ShutdownSignal`] receiver at
//! once. Because the signal is a plain channel receiver, worker loops can
//! `select!` on it together with their timers and queues.

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;

/// Owner side of a cancellation signal.
#[derive(Debug)]
pub struct Shutdown {
    trigger: Mutex<Option<Sender<()>>>,
    signal: ShutdownSignal,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::bounded(0);
        Self {
            trigger: Mutex::new(Some(tx)),
            signal: ShutdownSignal { rx },
        }
    }

    /// Fire the signal. Idempotent.
    pub fn trigger(&self) {
        self.trigger.lock().take();
    }

    pub fn is_triggered(&self) -> bool {
        self.signal.is_triggered()
    }

    /// A receiver handle that observes this shutdown.
    pub fn signal(&self) -> ShutdownSignal {
        self.signal.clone()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer side of a [`Shutdown`]; cheap to clone into worker threads.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: Receiver<()>,
}

impl ShutdownSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        Self {
            rx: crossbeam_channel::never(),
        }
    }

    pub fn is_triggered(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Receiver that becomes ready (disconnected) once triggered, for use
    /// in `crossbeam_channel::select!`.
    pub fn receiver(&self) -> &Receiver<()> {
        &self.rx
    }

    /// Sleep for `timeout` unless triggered first. Returns `true` if the
    /// signal fired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        !matches!(self.rx.recv_timeout(timeout), Err(RecvTimeoutError::Timeout))
    }
}
