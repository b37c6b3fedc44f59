//! Journal Module
//!
//! Makes multi-block updates atomic and crash-recoverable.
//!
//! ## Responsibilities
//! - Batch block registrations into one open transaction
//! - Close transactions into the journal list ring and commit them in id order
//! - Checkpoint committed blocks home, newest copy only
//! - Quarantine freed blocks until their transaction is checkpointed
//! - Replay the log after a crash
//!
//! ## Lifecycle of a Transaction
//! ```text
//!  begin/register/end        close              flush_commit           checkpoint
//! ┌──────────────────┐   ┌─────────────┐   ┌──────────────────┐   ┌─────────────────┐
//! │ open transaction │──▶│ list slot   │──▶│ desc+copies+sync │──▶│ home writes,    │
//! │ (txn_index)      │   │ (list_index)│   │ commit+sync      │   │ header advance  │
//! └──────────────────┘   └─────────────┘   └──────────────────┘   └─────────────────┘
//! ```
//!
//! ## Locking
//! - `state` guards every counter, index and slot. Device I/O never runs under it.
//! - A slot's `commit_flushing` / `flushing` flags own it across I/O; waiters
//!   sleep on the slot's `commit_done` / `flush_done` condvar.
//! - `checkpoint_lock` serializes home-location writes and header updates.
//!   It is always taken before `state`, never while holding it.

pub mod bitmap;
pub mod cnode;
pub mod format;
pub mod recovery;

mod checkpoint;
mod commit;
mod list;
mod transaction;
mod worker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam::channel::Sender;
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::config::JournalConfig;
use crate::device::BlockDevice;
use crate::error::{JournalError, Result};

use bitmap::{BitmapPool, ListBitmap};
use cnode::{BlockIndex, BlockKey, CnodeArena, CnodeChain};
use format::{JournalParams, LogGeometry};
use list::{JournalList, ListSignals};

pub use transaction::{EndFlags, Transaction};
pub(crate) use worker::{CommitWorker, WorkItem};

/// Extra quota granted each time a handle uses up its reservation
pub(crate) const QUOTA_STEP: u32 = 18;

/// Counters exposed through `JournalEngine::stats`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalStats {
    pub begins: u64,
    /// Begins that had to wait for or force a close
    pub relocks: u64,
    pub batched_ends: u64,
    pub transactions_closed: u64,
    pub commits_flushed: u64,
    pub checkpoints: u64,
    pub blocks_logged: u64,
    pub blocks_written_home: u64,
    pub blocks_superseded: u64,
    pub fresh_frees: u64,
    pub quarantined_frees: u64,
}

/// Accounting for the single open transaction
#[derive(Debug, Default)]
pub(crate) struct OpenTransaction {
    pub trans_id: u64,
    /// Log offset the descriptor will occupy
    pub start: u32,
    pub len: u32,
    /// Blocks reserved by joined handles
    pub len_alloc: u32,
    pub writers: u32,
    pub start_time: Option<Instant>,
    pub chain: CnodeChain,
    /// A close is running; nobody may join
    pub closing: bool,
    /// Some handle wants this transaction closed at the last end
    pub close_requested: bool,
    pub next_full_flush: bool,
    pub next_async_flush: bool,
}

impl OpenTransaction {
    fn rearm(&mut self, trans_id: u64, start: u32) {
        *self = OpenTransaction {
            trans_id,
            start,
            closing: self.closing,
            ..OpenTransaction::default()
        };
    }
}

/// Everything guarded by the journal mutex
pub(crate) struct JournalState {
    pub txn: OpenTransaction,
    pub cnodes: CnodeArena,
    /// Records of the open transaction
    pub txn_index: BlockIndex,
    /// Records of every closed, not yet checkpointed transaction
    pub list_index: BlockIndex,
    pub lists: Vec<JournalList>,
    /// Slot reserved for the open transaction
    pub current: usize,
    pub bitmaps: BitmapPool,
    pub last_flush_trans_id: u64,
    pub first_unflushed_offset: u32,
    pub mount_id: u32,
    /// Highest transaction id whose close (and requested flush) finished
    pub closed_through: u64,
    pub writers_blocked: bool,
    pub stats: JournalStats,
}

impl JournalState {
    /// Slot holding `trans_id`, if it is still in memory
    pub fn find_list(&self, trans_id: u64) -> Option<usize> {
        self.lists.iter().position(|l| l.holds(trans_id))
    }

    /// In-use slots with ids below `trans_id`, oldest first
    pub fn older_lists(&self, trans_id: u64) -> Vec<(usize, u64)> {
        let mut older: Vec<(usize, u64)> = self
            .lists
            .iter()
            .enumerate()
            .filter(|(_, l)| l.in_use() && l.trans_id < trans_id)
            .map(|(i, l)| (i, l.trans_id))
            .collect();
        older.sort_by_key(|(_, id)| *id);
        older
    }

    /// Oldest in-use slot
    pub fn oldest_list(&self) -> Option<(usize, u64)> {
        self.older_lists(u64::MAX).into_iter().next()
    }
}

/// Starting point handed over by recovery
pub(crate) struct MountState {
    pub last_flush_trans_id: u64,
    pub first_unflushed_offset: u32,
    pub mount_id: u32,
}

/// Shared core of a mounted journal
pub(crate) struct Journal {
    pub config: JournalConfig,
    pub geometry: LogGeometry,
    pub device: Arc<dyn BlockDevice>,
    pub state: Mutex<JournalState>,
    /// Handles waiting to join or for a close to finish
    pub join_wait: Condvar,
    pub signals: Box<[ListSignals]>,
    pub checkpoint_lock: Mutex<()>,
    pub worker_tx: Mutex<Option<Sender<WorkItem>>>,
    halted: AtomicBool,
    halt_reason: Mutex<Option<String>>,
}

impl Journal {
    pub fn new(config: JournalConfig, device: Arc<dyn BlockDevice>, mount: MountState) -> Self {
        let geometry = LogGeometry::from_config(&config);
        let bitmaps = BitmapPool::new(config.block_size, config.bitmap_pool_max);
        let device_blocks = device.block_count();
        let lists = (0..config.list_count)
            .map(|_| JournalList::new(ListBitmap::new(device_blocks, &bitmaps)))
            .collect();
        let signals = (0..config.list_count)
            .map(|_| ListSignals::default())
            .collect();

        let mut txn = OpenTransaction::default();
        txn.rearm(mount.last_flush_trans_id + 1, mount.first_unflushed_offset);

        let state = JournalState {
            txn,
            cnodes: CnodeArena::with_capacity(config.cnode_count),
            txn_index: BlockIndex::new(),
            list_index: BlockIndex::new(),
            lists,
            current: 0,
            bitmaps,
            last_flush_trans_id: mount.last_flush_trans_id,
            first_unflushed_offset: mount.first_unflushed_offset,
            mount_id: mount.mount_id,
            closed_through: mount.last_flush_trans_id,
            writers_blocked: false,
            stats: JournalStats::default(),
        };

        Self {
            config,
            geometry,
            device,
            state: Mutex::new(state),
            join_wait: Condvar::new(),
            signals,
            checkpoint_lock: Mutex::new(()),
            worker_tx: Mutex::new(None),
            halted: AtomicBool::new(false),
            halt_reason: Mutex::new(None),
        }
    }

    pub fn params(&self) -> JournalParams {
        JournalParams::from_config(&self.config)
    }

    pub fn key(&self, block: u64) -> BlockKey {
        BlockKey::new(self.config.device_id, block)
    }

    // =========================================================================
    // Halt State
    // =========================================================================

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    pub fn halt_reason(&self) -> Option<String> {
        self.halt_reason.lock().clone()
    }

    /// Fail fast once halted
    pub fn check_halted(&self) -> Result<()> {
        if self.is_halted() {
            let reason = self.halt_reason().unwrap_or_default();
            return Err(JournalError::Halted(reason));
        }
        Ok(())
    }

    /// Stop all further writes. Call with the state guard held so sleepers
    /// cannot miss the wakeup.
    pub fn halt_locked(&self, _state: &mut MutexGuard<'_, JournalState>, reason: String) -> JournalError {
        if !self.halted.swap(true, Ordering::AcqRel) {
            error!(target: "txjournal", reason = %reason, "journal halted");
            *self.halt_reason.lock() = Some(reason.clone());
        }
        self.join_wait.notify_all();
        for signal in self.signals.iter() {
            signal.commit_done.notify_all();
            signal.flush_done.notify_all();
        }
        JournalError::Halted(reason)
    }

    /// Halt from a path that does not hold the state guard
    pub fn halt(&self, reason: String) -> JournalError {
        let mut state = self.state.lock();
        self.halt_locked(&mut state, reason)
    }

    // =========================================================================
    // Block Checks
    // =========================================================================

    /// Reject blocks the journal itself owns or that the device lacks
    pub fn check_block(&self, block: u64) -> Result<()> {
        if self.geometry.is_journal_block(block) {
            return Err(JournalError::InvalidBlock {
                block,
                reason: "inside the journal log region".into(),
            });
        }
        if block >= self.device.block_count() {
            return Err(JournalError::InvalidBlock {
                block,
                reason: format!("past end of device ({} blocks)", self.device.block_count()),
            });
        }
        Ok(())
    }

    /// True while `block` may not be handed out by the allocator
    pub fn is_quarantined(&self, dev: u32, block: u64) -> bool {
        if dev != self.config.device_id {
            return false;
        }
        let key = BlockKey::new(dev, block);
        let state = self.state.lock();

        state.txn_index.find(&state.cnodes, &key).is_some()
            || state.list_index.find(&state.cnodes, &key).is_some()
            || state.lists.iter().any(|l| l.bitmap.test(block))
    }
}
