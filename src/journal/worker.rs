//! Background commit worker
//!
//! One thread per mounted journal. It sleeps on a channel until an async
//! commit is queued or shutdown is requested; on each idle tick it runs
//! the periodic flush of old commits.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, warn};

use crate::error::{JournalError, Result};

use super::Journal;

/// Requests handled by the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkItem {
    /// Commit the list in `slot` if it still holds `trans_id`
    Commit { slot: usize, trans_id: u64 },
    Shutdown,
}

/// Handle to the running worker thread
pub(crate) struct CommitWorker {
    tx: Sender<WorkItem>,
    handle: Option<JoinHandle<()>>,
}

impl CommitWorker {
    /// Spawn the worker and register its queue with the journal
    pub fn spawn(journal: Arc<Journal>) -> Result<Self> {
        let (tx, rx) = channel::unbounded();
        let interval = journal.config.flush_interval;
        *journal.worker_tx.lock() = Some(tx.clone());

        let handle = thread::Builder::new()
            .name("txjournal-commit".into())
            .spawn(move || run(journal, rx, interval))
            .map_err(JournalError::Io)?;

        Ok(Self {
            tx,
            handle: Some(handle),
        })
    }

    /// Drain outstanding work, stop the thread and wait for it
    pub fn shutdown(&mut self) {
        let _ = self.tx.send(WorkItem::Shutdown);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(target: "txjournal::worker", "commit worker panicked");
            }
        }
    }
}

impl Drop for CommitWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(journal: Arc<Journal>, rx: Receiver<WorkItem>, interval: Duration) {
    debug!(target: "txjournal::worker", "commit worker started");
    loop {
        let item = match rx.recv_timeout(interval) {
            Ok(item) => item,
            Err(RecvTimeoutError::Timeout) => {
                if !journal.is_halted() {
                    if let Err(e) = journal.flush_old_commits(false) {
                        warn!(target: "txjournal::worker", error = %e, "periodic flush failed");
                    }
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        };

        // Take everything already queued in one wakeup
        let mut batch = vec![item];
        batch.extend(rx.try_iter());

        let mut stop = false;
        for item in batch {
            match item {
                WorkItem::Commit { slot, trans_id } => handle_commit(&journal, slot, trans_id),
                WorkItem::Shutdown => stop = true,
            }
        }
        if stop {
            break;
        }
    }
    *journal.worker_tx.lock() = None;
    debug!(target: "txjournal::worker", "commit worker stopped");
}

fn handle_commit(journal: &Journal, slot: usize, trans_id: u64) {
    if let Err(e) = journal.flush_commit(slot, trans_id) {
        warn!(target: "txjournal::worker", trans_id, error = %e, "async commit failed");
        return;
    }

    let ready = {
        let state = journal.state.lock();
        let list = &state.lists[slot];
        list.holds(trans_id) && list.is_committed() && list.nonzerolen > 0
    };
    if ready {
        if let Err(e) = journal.write_back(slot, trans_id) {
            warn!(target: "txjournal::worker", trans_id, error = %e, "write-back failed");
        }
    }
}
