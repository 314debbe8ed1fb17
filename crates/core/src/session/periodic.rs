use std::io;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::select;

use crate::error::Result;
use crate::shutdown::Shutdown;

/// A background thread that runs a task on a fixed interval.
///
/// Used for KEEPALIVE and SESSION_INFO events. The first run happens one
/// interval after spawning. The thread is stopped and joined when the
/// handle is finished or dropped, so a failed setup path cannot leak it.
pub(crate) struct Periodic {
    name: String,
    stop: Shutdown,
    handle: Option<JoinHandle<u64>>,
}

impl Periodic {
    pub(crate) fn spawn<F>(name: String, interval: Duration, mut task: F) -> io::Result<Self>
    where
        F: FnMut() -> Result<()> + Send + 'static,
    {
        let stop = Shutdown::new();
        let signal = stop.signal();
        let thread_name = name.clone();

        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            let ticker = crossbeam_channel::tick(interval);
            let mut runs = 0u64;
            loop {
                select! {
                    recv(ticker) -> _ => {}
                    recv(signal.receiver()) -> _ => break,
                }
                if signal.is_triggered() {
                    break;
                }
                match task() {
                    Ok(()) => runs += 1,
                    Err(e) => tracing::warn!(task = %thread_name, error = %e, "periodic task failed"),
                }
            }
            runs
        })?;

        Ok(Self {
            name,
            stop,
            handle: Some(handle),
        })
    }

    /// Stop the task and return how many runs succeeded.
    pub(crate) fn finish(mut self) -> u64 {
        self.join()
    }

    fn join(&mut self) -> u64 {
        self.stop.trigger();
        let Some(handle) = self.handle.take() else {
            return 0;
        };
        handle.join().unwrap_or_else(|_| {
            tracing::warn!(task = %self.name, "periodic task panicked");
            0
        })
    }
}

impl Drop for Periodic {
    fn drop(&mut self) {
        self.join();
    }
}
