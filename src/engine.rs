//! Engine Module
//!
//! The mounted journal: recovery at open, transactions while mounted, a
//! full flush at close.
//!
//! ## Responsibilities
//! - Replay the log before the first transaction can begin
//! - Hand out transaction handles to concurrent callers
//! - Answer the allocator's quarantine queries
//! - Run the background commit worker
//! - Flush and checkpoint everything on close

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::JournalConfig;
use crate::device::BlockDevice;
use crate::error::{JournalError, Result};
use crate::journal::format::JournalHeader;
use crate::journal::recovery::{self, RecoveryReport};
use crate::journal::{CommitWorker, EndFlags, Journal, JournalStats, MountState, Transaction};

/// A journal mounted on a block device
///
/// ## Concurrency Model
///
/// - Any number of threads may hold [`Transaction`] handles on the same
///   open transaction; `begin` blocks while a close is running.
/// - Commit and checkpoint I/O happen outside the journal mutex, owned by
///   per-list flags.
/// - The background worker commits transactions ended with
///   `COMMIT_NOW` but without `WAIT`.
///
/// Once a log, home or header write fails, the engine halts: every
/// mutating call returns [`JournalError::Halted`] until the device is
/// opened again, which replays the log.
pub struct JournalEngine {
    journal: Arc<Journal>,
    worker: Option<CommitWorker>,
    report: RecoveryReport,
    closed: bool,
}

impl JournalEngine {
    /// Zero the log region and write a fresh header
    pub fn format(device: &dyn BlockDevice, config: &JournalConfig) -> Result<JournalHeader> {
        config.validate()?;
        check_device(device, config)?;
        recovery::format_log(device, config)
    }

    /// Mount the journal on `device`
    ///
    /// On open:
    /// 1. Validate the config against the device
    /// 2. Replay committed transactions and rewrite the header
    /// 3. Build the in-memory state from the rewritten header
    /// 4. Start the background commit worker
    pub fn open(device: Arc<dyn BlockDevice>, config: JournalConfig) -> Result<Self> {
        // Step 1: Validate
        config.validate()?;
        check_device(device.as_ref(), &config)?;

        // Step 2: Recover
        let (header, report) = recovery::recover(device.as_ref(), &config)?;

        // Step 3: Build state
        let mount = MountState {
            last_flush_trans_id: header.last_flush_trans_id,
            first_unflushed_offset: header.first_unflushed_offset,
            mount_id: header.mount_id,
        };
        let spawn_worker = config.commit_worker;
        let journal = Arc::new(Journal::new(config, device, mount));

        // Step 4: Worker
        let worker = if spawn_worker {
            Some(CommitWorker::spawn(Arc::clone(&journal))?)
        } else {
            None
        };

        info!(
            target: "txjournal",
            next_trans_id = header.last_flush_trans_id + 1,
            start_offset = header.first_unflushed_offset,
            mount_id = header.mount_id,
            replayed = report.transactions_replayed,
            "journal mounted"
        );

        Ok(Self {
            journal,
            worker,
            report,
            closed: false,
        })
    }

    /// Join the open transaction, reserving room for `min_blocks`
    pub fn begin(&self, min_blocks: u32) -> Result<Transaction<'_>> {
        self.journal.begin(min_blocks, false)
    }

    /// Join the open transaction regardless of batch limits
    pub fn join(&self, min_blocks: u32) -> Result<Transaction<'_>> {
        self.journal.begin(min_blocks, true)
    }

    /// Allocator check: `block` on `dev` must not be reused yet
    pub fn is_quarantined(&self, dev: u32, block: u64) -> bool {
        self.journal.is_quarantined(dev, block)
    }

    /// Commit the open transaction (and everything before it) and wait
    pub fn sync(&self) -> Result<()> {
        let th = self.journal.begin(1, true)?;
        th.end_sync()?;

        let newest = {
            let state = self.journal.state.lock();
            state
                .lists
                .iter()
                .enumerate()
                .filter(|(_, l)| l.in_use())
                .max_by_key(|(_, l)| l.trans_id)
                .map(|(i, l)| (i, l.trans_id))
        };
        match newest {
            Some((slot, trans_id)) => self.journal.flush_commit(slot, trans_id),
            None => Ok(()),
        }
    }

    /// Make `trans_id` durable in the log, closing it first if it is open
    pub fn commit(&self, trans_id: u64) -> Result<()> {
        loop {
            self.journal.check_halted()?;
            let (slot, open_id, open_len) = {
                let state = self.journal.state.lock();
                (state.find_list(trans_id), state.txn.trans_id, state.txn.len)
            };

            if let Some(slot) = slot {
                return self.journal.flush_commit(slot, trans_id);
            }
            if trans_id > open_id {
                return Err(JournalError::InvalidArgument(format!(
                    "transaction {trans_id} has not started (open is {open_id})"
                )));
            }
            if trans_id < open_id || open_len == 0 {
                // Already checkpointed, or nothing logged yet
                return Ok(());
            }

            let th = self.journal.begin(1, true)?;
            th.end(EndFlags::COMMIT_NOW | EndFlags::WAIT)?;
        }
    }

    /// Commit and checkpoint `trans_id` and everything older
    pub fn checkpoint(&self, trans_id: u64) -> Result<()> {
        self.commit(trans_id)?;
        let slot = self.journal.state.lock().find_list(trans_id);
        match slot {
            Some(slot) => self.journal.checkpoint_list(slot, trans_id),
            None => Ok(()),
        }
    }

    /// Checkpoint every closed transaction
    pub fn checkpoint_all(&self) -> Result<()> {
        self.journal.check_halted()?;
        self.journal.checkpoint_all()
    }

    /// Periodic flush; the worker runs this on every idle tick
    pub fn flush_old_commits(&self, immediate: bool) -> Result<usize> {
        self.journal.flush_old_commits(immediate)
    }

    /// Make new `begin` calls wait until [`allow_writes`](Self::allow_writes)
    pub fn block_writes(&self) {
        self.journal.state.lock().writers_blocked = true;
    }

    pub fn allow_writes(&self) {
        let mut state = self.journal.state.lock();
        state.writers_blocked = false;
        self.journal.join_wait.notify_all();
    }

    /// Flush everything, write the final header and stop the worker
    pub fn close(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let result = (|| -> Result<()> {
            self.journal.check_halted()?;
            let th = self.journal.begin(1, true)?;
            th.end(EndFlags::FLUSH_ALL)?;
            self.journal.checkpoint_all()
        })();

        if let Some(mut worker) = self.worker.take() {
            worker.shutdown();
        }

        match &result {
            Ok(()) => info!(target: "txjournal", "journal released"),
            Err(e) => warn!(target: "txjournal", error = %e, "journal released with errors"),
        }
        result
    }

    // =========================================================================
    // Accessors (for testing and debugging)
    // =========================================================================

    /// What recovery did at open
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.report
    }

    pub fn stats(&self) -> JournalStats {
        self.journal.state.lock().stats.clone()
    }

    pub fn is_halted(&self) -> bool {
        self.journal.is_halted()
    }

    pub fn halt_reason(&self) -> Option<String> {
        self.journal.halt_reason()
    }

    /// Id the next registered block will belong to
    pub fn current_trans_id(&self) -> u64 {
        self.journal.state.lock().txn.trans_id
    }

    /// Newest transaction whose blocks are all home, per the header
    pub fn last_flush_trans_id(&self) -> u64 {
        self.journal.state.lock().last_flush_trans_id
    }

    /// Transactions closed but not yet checkpointed
    pub fn pending_lists(&self) -> usize {
        self.journal.state.lock().lists.iter().filter(|l| l.in_use()).count()
    }

    /// Block records in use across all in-memory transactions
    pub fn cnodes_in_use(&self) -> usize {
        self.journal.state.lock().cnodes.in_use()
    }

    /// Bitmap nodes held by quarantine bitmaps
    pub fn bitmap_nodes_in_use(&self) -> usize {
        self.journal.state.lock().bitmaps.in_use()
    }

    pub fn config(&self) -> &JournalConfig {
        &self.journal.config
    }
}

impl Drop for JournalEngine {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(target: "txjournal", error = %e, "implicit close failed");
        }
    }
}

fn check_device(device: &dyn BlockDevice, config: &JournalConfig) -> Result<()> {
    if device.block_size() != config.block_size {
        return Err(JournalError::Config(format!(
            "device block size {} does not match configured {}",
            device.block_size(),
            config.block_size
        )));
    }
    if device.block_count() < config.journal_end() {
        return Err(JournalError::Config(format!(
            "device has {} blocks, journal needs {}",
            device.block_count(),
            config.journal_end()
        )));
    }
    Ok(())
}
