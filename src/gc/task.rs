//! Spawning the GC worker as an isolated blocking task with a cancellation
//! flag and live progress counters.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::error::{Error, Result};

use super::worker::{self, PartialStats, WorkerArgs};

pub struct GcTask {
    handle: JoinHandle<Result<()>>,
    cancel: Arc<AtomicBool>,
    progress: Arc<PartialStats>,
}

impl GcTask {
    /// Run the worker on the blocking pool. The worker owns a read-only
    /// view of the store and communicates back only through its
    /// generation-suffixed files and the returned result.
    pub fn spawn(args: WorkerArgs) -> Self {
        let cancel = Arc::new(AtomicBool::new(false));
        let progress = Arc::new(PartialStats::default());
        let task_cancel = cancel.clone();
        let task_progress = progress.clone();
        let handle =
            tokio::task::spawn_blocking(move || worker::run(&args, &task_cancel, &task_progress));
        Self {
            handle,
            cancel,
            progress,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Best-effort: the worker polls the flag between objects and between
    /// copy chunks, so it may still finish successfully first.
    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    /// `(objects traversed, bytes copied)` so far.
    pub fn progress(&self) -> (u64, u64) {
        self.progress.snapshot()
    }

    /// Await the worker. A panic inside the worker is funnelled into the
    /// GC error taxonomy like any other worker death.
    pub async fn join(self) -> Result<()> {
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => {
                Err(Error::GcProcessError(format!("worker panicked: {e}")))
            }
            Err(e) => Err(Error::GcProcessError(format!("worker aborted: {e}"))),
        }
    }
}
